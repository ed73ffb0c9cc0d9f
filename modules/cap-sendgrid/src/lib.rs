//! `ext/sendgrid`: `send(key, message[, extra])` through the v3
//! `mail/send` endpoint.
//!
//! `message` has the `std/smtp` shape. `extra` is an optional v3 request
//! object (categories, `send_at`, tracking settings, ...) that the message
//! fields are laid over. `module("ext/sendgrid", {api_url})` points the
//! capability at another API base.

use std::collections::BTreeMap;
use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use alertscript_runner::{CapRegistry, RegistryError};
use alertscript_std::smtp::MailMessage;
use base64::Engine as _;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const NAME: &str = "ext/sendgrid";
pub const API_URL: &str = "https://api.sendgrid.com/v3";

pub fn register(reg: &mut CapRegistry) -> Result<(), RegistryError> {
    reg.register(NAME, factory)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Options {
    api_url: Option<String>,
}

pub fn factory(
    acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    let opts: Option<Options> = arg(args, 0)?;
    let api_url = opts.and_then(|o| o.api_url).unwrap_or_else(|| API_URL.to_string());
    Ok(Box::new(SendGrid::new(acct, api_url)))
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct SendResult {
    pub code: u16,
    pub message: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl SendResult {
    fn short(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Default::default()
        }
    }
}

fn email(addr: &str, name: &str) -> Value {
    if name.is_empty() {
        json!({ "email": addr })
    } else {
        json!({ "email": addr, "name": name })
    }
}

/// The v3 request body. The API takes one value per header, so only the
/// first of each is sent.
pub fn request_body(msg: &MailMessage, extra: Option<Map<String, Value>>) -> Value {
    let mut body = extra.unwrap_or_default();

    body.insert("from".into(), email(&msg.from, &msg.from_name));
    body.insert(
        "personalizations".into(),
        json!([{ "to": [email(&msg.to, &msg.to_name)] }]),
    );
    body.insert("subject".into(), json!(msg.subject));
    if !msg.reply_to.is_empty() {
        body.insert("reply_to".into(), email(&msg.reply_to, ""));
    }

    let mut content = Vec::new();
    if !msg.text.is_empty() {
        content.push(json!({ "type": "text/plain", "value": msg.text }));
    }
    if !msg.html.is_empty() {
        content.push(json!({ "type": "text/html", "value": msg.html }));
    }
    if !content.is_empty() {
        body.insert("content".into(), Value::Array(content));
    }

    if !msg.attach.is_empty() {
        let attachments: Vec<Value> = msg
            .attach
            .iter()
            .map(|a| {
                json!({
                    "filename": a.name,
                    "type": a.kind,
                    "content": base64::engine::general_purpose::STANDARD.encode(&a.content),
                    "disposition": "attachment",
                })
            })
            .collect();
        body.insert("attachments".into(), Value::Array(attachments));
    }

    let headers: Map<String, Value> = msg
        .header
        .iter()
        .filter_map(|(k, vs)| vs.first().map(|v| (k.clone(), json!(v))))
        .collect();
    if !headers.is_empty() {
        body.insert("headers".into(), Value::Object(headers));
    }
    Value::Object(body)
}

pub struct SendGrid {
    acct: Rc<dyn Accountant>,
    api_url: String,
}

impl SendGrid {
    pub fn new(acct: Rc<dyn Accountant>, api_url: impl Into<String>) -> Self {
        Self {
            acct,
            api_url: api_url.into(),
        }
    }

    pub fn send(
        &self,
        key: &str,
        msg: &MailMessage,
        extra: Option<Map<String, Value>>,
    ) -> anyhow::Result<SendResult> {
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("sending to sendgrid {}", msg.to));
        if self.acct.is_dry_run() {
            return Ok(SendResult::short(200, "dry run"));
        }

        match self.post(key, request_body(msg, extra)) {
            Ok(res) => Ok(res),
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("sendgrid error {e}"));
                Ok(SendResult::short(500, e.to_string()))
            }
        }
    }

    fn post(&self, key: &str, body: Value) -> anyhow::Result<SendResult> {
        let client = Client::builder().timeout(self.acct.net_timeout()).build()?;
        let url = format!("{}/mail/send", self.api_url.trim_end_matches('/'));
        let resp = client.post(url).bearer_auth(key).json(&body).send()?;

        let status = resp.status();
        self.acct.diag(&format!("sendgrid: {status}"));
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in resp.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let message = if status.is_success() {
            "OK".to_string()
        } else {
            self.acct.net_io_err();
            status.canonical_reason().unwrap_or("?").to_string()
        };
        Ok(SendResult {
            code: status.as_u16(),
            message,
            headers,
            body: resp.text()?,
        })
    }
}

impl Capability for SendGrid {
    fn methods(&self) -> &[&'static str] {
        &["send"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "send" => {
                let key: Option<String> = arg(&args, 0)?;
                let msg: Option<MailMessage> = arg(&args, 1)?;
                let extra: Option<Map<String, Value>> = arg(&args, 2)?;
                let (Some(key), Some(msg)) = (key.filter(|k| !k.is_empty()), msg) else {
                    anyhow::bail!("sendgrid.send(key, message)");
                };
                to_value(&self.send(&key, &msg, extra)?)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertscript_core::testing::RecordingAccountant;
    use alertscript_std::smtp::MailAttachment;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn message() -> MailMessage {
        MailMessage {
            to: "oncall@example.com".into(),
            from: "alerts@example.com".into(),
            from_name: "Alerts".into(),
            subject: "disk full".into(),
            text: "sda1 at 99%".into(),
            header: BTreeMap::from([
                ("X-Alert-Id".to_string(), vec!["42".to_string(), "43".to_string()]),
                ("X-Empty".to_string(), vec![]),
            ]),
            attach: vec![MailAttachment {
                name: "df.txt".into(),
                kind: "text/plain".into(),
                content: "abc".into(),
            }],
            ..Default::default()
        }
    }

    /// Read one request: headers, then `Content-Length` bytes of body.
    fn read_request(conn: &mut impl Read) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = conn.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let len = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    fn reply_once(status: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let raw = read_request(&mut conn);
            let resp = format!(
                "HTTP/1.1 {status}\r\nX-Message-Id: m-1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            conn.write_all(resp.as_bytes()).unwrap();
            raw
        });
        (base, handle)
    }

    #[test]
    fn dry_run() {
        let acct = RecordingAccountant::new(true).shared();
        let mut sg = SendGrid::new(acct.clone(), API_URL);
        let out = sg
            .call("send", vec![json!("SG.key"), json!({"to": "oncall@example.com"})])
            .unwrap();
        assert_eq!(out["code"], 200);
        assert_eq!(out["message"], "dry run");
        assert_eq!(acct.heavy.get(), 1);
        assert!(acct.lines.borrow()[0].contains("sending to sendgrid oncall@example.com"));
    }

    #[test]
    fn key_and_message_are_required() {
        let acct = RecordingAccountant::new(true).shared();
        let mut sg = SendGrid::new(acct.clone(), API_URL);
        let err = sg.call("send", vec![json!(""), json!({})]).unwrap_err();
        assert_eq!(err.to_string(), "sendgrid.send(key, message)");
        assert!(sg.call("send", vec![json!("k")]).is_err());
        assert_eq!(acct.heavy.get(), 0);
    }

    #[test]
    fn v3_body_layout() {
        let extra = json!({"categories": ["alerts"], "subject": "overridden"});
        let body = request_body(&message(), extra.as_object().cloned());
        assert_eq!(body["from"], json!({"email": "alerts@example.com", "name": "Alerts"}));
        assert_eq!(
            body["personalizations"],
            json!([{"to": [{"email": "oncall@example.com"}]}])
        );
        assert_eq!(body["subject"], "disk full");
        assert_eq!(body["categories"], json!(["alerts"]));
        assert_eq!(body["content"], json!([{"type": "text/plain", "value": "sda1 at 99%"}]));
        assert_eq!(body["attachments"][0]["content"], "YWJj");
        assert_eq!(body["attachments"][0]["disposition"], "attachment");
        assert_eq!(body["headers"], json!({"X-Alert-Id": "42"}));
        assert!(body.get("reply_to").is_none());
    }

    #[test]
    fn posts_to_mail_send() {
        let (base, server) = reply_once("202 Accepted");
        let acct = RecordingAccountant::new(false).shared();
        let sg = SendGrid::new(acct.clone(), base);
        let res = sg.send("SG.key", &message(), None).unwrap();
        assert_eq!(res.code, 202);
        assert_eq!(res.message, "OK");
        assert_eq!(res.headers["x-message-id"], vec!["m-1".to_string()]);
        assert_eq!(acct.io_errors.get(), 0);

        let raw = server.join().unwrap();
        assert!(raw.starts_with("POST /mail/send"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sg.key"));
        assert!(raw.contains(r#""subject":"disk full""#));
    }

    #[test]
    fn rejected_request_counts_an_io_error() {
        let (base, server) = reply_once("401 Unauthorized");
        let acct = RecordingAccountant::new(false).shared();
        let sg = SendGrid::new(acct.clone(), base);
        let res = sg.send("bad", &message(), None).unwrap();
        assert_eq!(res.code, 401);
        assert_eq!(res.message, "Unauthorized");
        assert_eq!(acct.io_errors.get(), 1);
        server.join().unwrap();
    }

    #[test]
    fn unreachable_api_is_a_500_result() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let acct = RecordingAccountant::new(false).shared();
        let sg = SendGrid::new(acct.clone(), base);
        let res = sg.send("k", &message(), None).unwrap();
        assert_eq!(res.code, 500);
        assert_eq!(acct.io_errors.get(), 1);
    }
}
