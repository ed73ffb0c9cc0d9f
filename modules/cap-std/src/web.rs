//! `std/web`: `request(url, method, headers, body)`.
//!
//! The `get`, `post`, `post_json` and `post_urlencoded` helpers are script
//! side (see `web.js`) and all go through `request`. So do the `tls()` and
//! `cert(n)` accessors the prelude hangs on every result.

use std::collections::BTreeMap;
use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use base64::Engine as _;
use reqwest::blocking::{Client, Response};
use reqwest::tls::TlsInfo;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const PRELUDE: &str = include_str!("web.js");

/// A header value from script: one string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    fn values(&self) -> &[String] {
        match self {
            HeaderValue::One(v) => std::slice::from_ref(v),
            HeaderValue::Many(vs) => vs,
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct WebResult {
    pub code: u16,
    pub message: String,
    pub body: String,
    pub header: BTreeMap<String, Vec<String>>,
    /// Set when the status arrived but the body could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present for https responses; the prelude turns it into `tls()`/`cert(n)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsResult>,
}

impl WebResult {
    fn short(code: u16, message: &str, body: String) -> Self {
        Self {
            code,
            message: message.to_string(),
            body,
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TlsResult {
    pub server_name: String,
    pub n_certs: usize,
    pub certs: Vec<TlsCert>,
}

/// Peer certificate as delivered on the wire.
#[derive(Debug, Serialize, PartialEq)]
pub struct TlsCert {
    /// DER, standard base64.
    pub der: String,
    /// SHA-256 fingerprint, lowercase hex.
    pub sha256: String,
}

impl TlsResult {
    fn from_peer(server_name: &str, der: Option<&[u8]>) -> Self {
        let certs: Vec<TlsCert> = der
            .into_iter()
            .map(|der| TlsCert {
                der: base64::engine::general_purpose::STANDARD.encode(der),
                sha256: hex::encode(Sha256::digest(der)),
            })
            .collect();
        Self {
            server_name: server_name.to_string(),
            n_certs: certs.len(),
            certs,
        }
    }
}

fn tls_of(resp: &Response) -> Option<TlsResult> {
    let info = resp.extensions().get::<TlsInfo>()?;
    let host = resp.url().host_str().unwrap_or_default();
    Some(TlsResult::from_peer(host, info.peer_certificate()))
}

pub struct Web {
    acct: Rc<dyn Accountant>,
}

impl Web {
    pub fn new(acct: Rc<dyn Accountant>) -> Self {
        Self { acct }
    }

    pub fn request(
        &self,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, HeaderValue>,
        body: String,
    ) -> anyhow::Result<WebResult> {
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!(
            "web: {method} {url}\nheaders: {headers:?}\nbody: {body}"
        ));
        if self.acct.is_dry_run() {
            return Ok(WebResult::short(200, "not tried", String::new()));
        }

        let method = if method.is_empty() { "GET" } else { method };
        let method = match Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(e) => return Err(self.fatal(format!("web request: invalid method '{method}': {e}"))),
        };
        let url = match url::Url::parse(url) {
            Ok(u) => u,
            Err(e) => return Err(self.fatal(format!("web request: invalid url '{url}': {e}"))),
        };
        let client = match Client::builder()
            .timeout(self.acct.net_timeout())
            .tls_info(true)
            .build()
        {
            Ok(c) => c,
            Err(e) => return Err(self.fatal(format!("web request: {e}"))),
        };

        let mut req = client.request(method, url).body(body);
        for (name, value) in headers {
            for v in value.values() {
                req = req.header(name.as_str(), v.as_str());
            }
        }
        if let Some(trace) = self.acct.trace_info() {
            req = req.header("X-Trace", trace);
        }

        let resp = match req.send() {
            Ok(r) => r,
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("Request Failed: {e}"));
                return Ok(WebResult::short(500, "Request Failed", e.to_string()));
            }
        };

        let status = resp.status();
        tracing::debug!(
            run_id = %self.acct.context().run_id(),
            status = status.as_u16(),
            "web.response"
        );
        let reason = status.canonical_reason().unwrap_or("").to_string();
        if status.is_success() {
            self.acct.diag(&format!("{} {reason}", status.as_u16()));
        } else {
            self.acct.net_io_err();
            self.acct.verbose(&format!("Request Failed: {} {reason}", status.as_u16()));
        }

        let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in resp.headers() {
            header
                .entry(canonical_header(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let tls = tls_of(&resp);
        let (body, error) = match resp.text() {
            Ok(body) => (body, None),
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("Response Body Failed: {e}"));
                (String::new(), Some(e.to_string()))
            }
        };

        Ok(WebResult {
            code: status.as_u16(),
            message: reason,
            body,
            header,
            error,
            tls,
        })
    }

    fn fatal(&self, msg: String) -> anyhow::Error {
        self.acct.fatal(&msg);
        anyhow::anyhow!(msg)
    }
}

/// `content-type` -> `Content-Type`.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

impl Capability for Web {
    fn methods(&self) -> &[&'static str] {
        &["request"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "request" => {
                let url: String = arg(&args, 0)?;
                let verb: Option<String> = arg(&args, 1)?;
                let headers: Option<BTreeMap<String, HeaderValue>> = arg(&args, 2)?;
                let body: Option<String> = arg(&args, 3)?;
                let res = self.request(
                    &url,
                    verb.as_deref().unwrap_or("GET"),
                    &headers.unwrap_or_default(),
                    body.unwrap_or_default(),
                )?;
                to_value(&res)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}

pub fn factory(
    acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Web::new(acct)))
}
