//! `std/smtp`: `send(server, message)`.
//!
//! STARTTLS is used whenever the server offers it; port 465 speaks TLS from
//! the first byte. Credentials are optional. The message shape is shared
//! with the hosted mail capabilities (`ext/sendgrid`, `ext/mailchimp`).

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PORT: u16 = 25;
const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpServer {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct MailAttachment {
    pub name: String,
    /// MIME type; `application/octet-stream` when empty.
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct MailMessage {
    pub to: String,
    pub to_name: String,
    pub from: String,
    pub from_name: String,
    pub reply_to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub attach: Vec<MailAttachment>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SmtpResult {
    pub code: u16,
    pub message: String,
}

impl SmtpResult {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn mailbox(name: &str, addr: &str, field: &str) -> anyhow::Result<Mailbox> {
    let address = addr
        .parse::<Address>()
        .map_err(|e| anyhow::anyhow!("invalid {field} address '{addr}': {e}"))?;
    let name = (!name.is_empty()).then(|| name.to_string());
    Ok(Mailbox::new(name, address))
}

fn content_type(kind: &str) -> anyhow::Result<ContentType> {
    let kind = if kind.is_empty() { "application/octet-stream" } else { kind };
    ContentType::parse(kind).map_err(|e| anyhow::anyhow!("invalid attachment type '{kind}': {e}"))
}

fn with_header(builder: MessageBuilder, name: &str, value: &str) -> anyhow::Result<MessageBuilder> {
    let name = HeaderName::new_from_ascii(name.to_string())
        .map_err(|e| anyhow::anyhow!("invalid header name '{name}': {e}"))?;
    Ok(builder.raw_header(HeaderValue::new(name, value.to_string())))
}

/// Assemble the MIME message. Text and html become an alternative pair;
/// attachments wrap that in a mixed part.
pub fn build_message(msg: &MailMessage, trace: Option<&str>) -> anyhow::Result<Message> {
    let mut builder = Message::builder()
        .from(mailbox(&msg.from_name, &msg.from, "from")?)
        .to(mailbox(&msg.to_name, &msg.to, "to")?)
        .subject(msg.subject.clone());
    if !msg.reply_to.is_empty() {
        builder = builder.reply_to(mailbox("", &msg.reply_to, "reply_to")?);
    }
    for (name, values) in &msg.header {
        for value in values {
            builder = with_header(builder, name, value)?;
        }
    }
    if let Some(trace) = trace.filter(|t| !t.is_empty()) {
        builder = with_header(builder, "X-Trace-Info", trace)?;
    }

    let body = match (msg.text.is_empty(), msg.html.is_empty()) {
        (false, false) => MultiPart::alternative_plain_html(msg.text.clone(), msg.html.clone()),
        (true, false) => MultiPart::mixed().singlepart(SinglePart::html(msg.html.clone())),
        _ => MultiPart::mixed().singlepart(SinglePart::plain(msg.text.clone())),
    };
    let message = if msg.attach.is_empty() {
        builder.multipart(body)?
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for a in &msg.attach {
            mixed = mixed.singlepart(
                Attachment::new(a.name.clone()).body(a.content.clone(), content_type(&a.kind)?),
            );
        }
        builder.multipart(mixed)?
    };
    Ok(message)
}

fn transport(srv: &SmtpServer, timeout: Duration) -> anyhow::Result<SmtpTransport> {
    let port = if srv.port == 0 { DEFAULT_PORT } else { srv.port };
    let params = TlsParameters::new(srv.hostname.clone())?;
    let tls = if port == IMPLICIT_TLS_PORT {
        Tls::Wrapper(params)
    } else {
        Tls::Opportunistic(params)
    };
    let mut builder = SmtpTransport::builder_dangerous(srv.hostname.as_str())
        .port(port)
        .tls(tls)
        .timeout(Some(timeout));
    if !srv.username.is_empty() {
        builder = builder.credentials(Credentials::new(srv.username.clone(), srv.password.clone()));
    }
    Ok(builder.build())
}

pub struct Smtp {
    acct: Rc<dyn Accountant>,
}

impl Smtp {
    pub fn new(acct: Rc<dyn Accountant>) -> Self {
        Self { acct }
    }

    pub fn send(&self, srv: &SmtpServer, msg: &MailMessage) -> anyhow::Result<SmtpResult> {
        let _io = self.acct.net_io_heavy()?;

        self.acct
            .diag(&format!("sending mail to: {} via: {}", msg.to, srv.hostname));
        if self.acct.is_dry_run() {
            return Ok(SmtpResult::new(200, "not tried"));
        }

        tracing::debug!(
            run_id = %self.acct.context().run_id(),
            server = %srv.hostname,
            port = srv.port,
            "smtp.send"
        );
        match self.deliver(srv, msg) {
            Ok(()) => Ok(SmtpResult::new(200, "OK")),
            Err(e) => {
                self.acct.net_io_err();
                self.acct.verbose(&format!("smtp error {e}"));
                Ok(SmtpResult::new(500, e.to_string()))
            }
        }
    }

    fn deliver(&self, srv: &SmtpServer, msg: &MailMessage) -> anyhow::Result<()> {
        let message = build_message(msg, self.acct.trace_info().as_deref())?;
        transport(srv, self.acct.net_timeout())?.send(&message)?;
        Ok(())
    }
}

impl Capability for Smtp {
    fn methods(&self) -> &[&'static str] {
        &["send"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "send" => {
                let srv: Option<SmtpServer> = arg(&args, 0)?;
                let msg: Option<MailMessage> = arg(&args, 1)?;
                let (Some(srv), Some(msg)) = (srv, msg) else {
                    anyhow::bail!("smtp.send(server, message)");
                };
                to_value(&self.send(&srv, &msg)?)
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
    Ok(Box::new(Smtp::new(acct)))
}
