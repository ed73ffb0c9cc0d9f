//! `ext/slack`: `post(token, channel, ...attachments)` through
//! `chat.postMessage`.
//!
//! `module("ext/slack", {api_url})` points the capability at another API
//! base (a proxy or a test server).

use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use alertscript_runner::{CapRegistry, RegistryError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const NAME: &str = "ext/slack";
pub const API_URL: &str = "https://slack.com/api";

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
    Ok(Box::new(Slack::new(acct, api_url)))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PostResult {
    pub code: u16,
    pub message: String,
}

impl PostResult {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct Slack {
    acct: Rc<dyn Accountant>,
    api_url: String,
}

impl Slack {
    pub fn new(acct: Rc<dyn Accountant>, api_url: impl Into<String>) -> Self {
        Self {
            acct,
            api_url: api_url.into(),
        }
    }

    pub fn post(&self, token: &str, channel: &str, attachments: Vec<Value>) -> anyhow::Result<PostResult> {
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("posting to slack chan {channel}"));
        if self.acct.is_dry_run() {
            return Ok(PostResult::new(200, "dry run"));
        }

        match self.send(token, channel, attachments) {
            Ok(()) => Ok(PostResult::new(200, "OK")),
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("slack error {e}"));
                Ok(PostResult::new(500, e.to_string()))
            }
        }
    }

    fn send(&self, token: &str, channel: &str, attachments: Vec<Value>) -> anyhow::Result<()> {
        let client = Client::builder().timeout(self.acct.net_timeout()).build()?;
        let url = format!("{}/chat.postMessage", self.api_url.trim_end_matches('/'));
        let resp = client
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "channel": channel, "attachments": attachments }))
            .send()?;

        let status = resp.status();
        self.acct.diag(&format!("slack: {status}"));
        if !status.is_success() {
            anyhow::bail!("slack server error: {status}");
        }
        let reply: ApiReply = resp.json()?;
        if !reply.ok {
            anyhow::bail!("{}", reply.error.as_deref().unwrap_or("unknown error"));
        }
        Ok(())
    }
}

impl Capability for Slack {
    fn methods(&self) -> &[&'static str] {
        &["post"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "post" => {
                let token: String = arg(&args, 0)?;
                let channel: String = arg(&args, 1)?;
                let attachments = args.get(2..).map(<[Value]>::to_vec).unwrap_or_default();
                to_value(&self.post(&token, &channel, attachments)?)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}
