//! `ext/twilio`: `message(creds, to, from, text, params)` sends an SMS,
//! `phone(creds, to, from, url, params)` places a call driven by the TwiML
//! at `url`.
//!
//! `params` are extra form fields for the Twilio REST call, named as Twilio
//! names them (`StatusCallback`, `MediaUrl`, ...).

use std::collections::BTreeMap;
use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use alertscript_runner::{CapRegistry, RegistryError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NAME: &str = "ext/twilio";
pub const API_URL: &str = "https://api.twilio.com";

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
    Ok(Box::new(Twilio::new(acct, api_url)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Creds {
    #[serde(alias = "accound_sid")]
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TwilioResult {
    pub code: u16,
    pub message: String,
    pub response: Value,
}

impl TwilioResult {
    fn new(code: u16, message: impl Into<String>, response: Value) -> Self {
        Self {
            code,
            message: message.into(),
            response,
        }
    }
}

#[derive(Clone, Copy)]
enum Resource {
    Messages,
    Calls,
}

impl Resource {
    fn path(self) -> &'static str {
        match self {
            Resource::Messages => "Messages.json",
            Resource::Calls => "Calls.json",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Resource::Messages => "message",
            Resource::Calls => "phone",
        }
    }
}

pub struct Twilio {
    acct: Rc<dyn Accountant>,
    api_url: String,
}

impl Twilio {
    pub fn new(acct: Rc<dyn Accountant>, api_url: impl Into<String>) -> Self {
        Self {
            acct,
            api_url: api_url.into(),
        }
    }

    pub fn message(
        &self,
        creds: Option<Creds>,
        to: &str,
        from: &str,
        text: &str,
        params: BTreeMap<String, Value>,
    ) -> anyhow::Result<TwilioResult> {
        self.create(Resource::Messages, creds, to, from, ("Body", text), params)
    }

    pub fn phone(
        &self,
        creds: Option<Creds>,
        to: &str,
        from: &str,
        url: &str,
        params: BTreeMap<String, Value>,
    ) -> anyhow::Result<TwilioResult> {
        self.create(Resource::Calls, creds, to, from, ("Url", url), params)
    }

    fn create(
        &self,
        res: Resource,
        creds: Option<Creds>,
        to: &str,
        from: &str,
        payload: (&str, &str),
        params: BTreeMap<String, Value>,
    ) -> anyhow::Result<TwilioResult> {
        let creds = creds.ok_or_else(|| anyhow::anyhow!("must supply twilio credentials"))?;
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("sending to twilio ({}) {to}", res.label()));
        if self.acct.is_dry_run() {
            return Ok(TwilioResult::new(200, "dry run", Value::Null));
        }

        let form = form_body(&params, to, from, payload);
        match self.send(res, &creds, form) {
            Ok(reply) => Ok(TwilioResult::new(200, "OK", reply)),
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("twilio error {e}"));
                Ok(TwilioResult::new(500, e.to_string(), Value::Null))
            }
        }
    }

    fn send(&self, res: Resource, creds: &Creds, form: String) -> anyhow::Result<Value> {
        let client = Client::builder().timeout(self.acct.net_timeout()).build()?;
        let url = format!(
            "{}/2010-04-01/Accounts/{}/{}",
            self.api_url.trim_end_matches('/'),
            creds.account_sid,
            res.path()
        );
        let resp = client
            .post(url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form)
            .send()?;

        let status = resp.status();
        let reply: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"));
            anyhow::bail!("status: {}, {detail}", status.as_u16());
        }
        Ok(reply)
    }
}

/// `To`, `From` and the payload field win over same-named `params`.
fn form_body(params: &BTreeMap<String, Value>, to: &str, from: &str, payload: (&str, &str)) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in params {
        if k == "To" || k == "From" || k == payload.0 {
            continue;
        }
        match v {
            Value::Null => {}
            Value::String(s) => {
                ser.append_pair(k, s);
            }
            Value::Array(items) => {
                for item in items {
                    ser.append_pair(k, &scalar(item));
                }
            }
            other => {
                ser.append_pair(k, &scalar(other));
            }
        }
    }
    ser.append_pair("To", to);
    ser.append_pair("From", from);
    ser.append_pair(payload.0, payload.1);
    ser.finish()
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Capability for Twilio {
    fn methods(&self) -> &[&'static str] {
        &["message", "phone"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let creds: Option<Creds> = arg(&args, 0)?;
        let to: String = arg(&args, 1)?;
        let from: String = arg(&args, 2)?;
        let payload: String = arg(&args, 3)?;
        let params: Option<BTreeMap<String, Value>> = arg(&args, 4)?;
        let params = params.unwrap_or_default();
        let res = match method {
            "message" => self.message(creds, &to, &from, &payload, params)?,
            "phone" => self.phone(creds, &to, &from, &payload, params)?,
            _ => anyhow::bail!("unknown method '{method}'"),
        };
        to_value(&res)
    }
}
