//! `ext/mailchimp`: `send(creds, message)` through Mailchimp's transactional
//! relay (Mandrill). Same shapes as `std/smtp`; host and port are fixed.

use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use alertscript_runner::{CapRegistry, RegistryError};
use alertscript_std::smtp::{MailMessage, Smtp, SmtpServer};
use serde_json::Value;

pub const NAME: &str = "ext/mailchimp";
pub const HOST: &str = "smtp.mandrillapp.com";
pub const PORT: u16 = 587;

pub fn register(reg: &mut CapRegistry) -> Result<(), RegistryError> {
    reg.register(NAME, factory)
}

pub fn factory(
    acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Mailchimp {
        smtp: Smtp::new(acct),
    }))
}

/// Only the username and password of `creds` are used.
fn relay(creds: SmtpServer) -> SmtpServer {
    SmtpServer {
        hostname: HOST.to_string(),
        port: PORT,
        ..creds
    }
}

pub struct Mailchimp {
    smtp: Smtp,
}

impl Capability for Mailchimp {
    fn methods(&self) -> &[&'static str] {
        &["send"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "send" => {
                let creds: Option<SmtpServer> = arg(&args, 0)?;
                let msg: Option<MailMessage> = arg(&args, 1)?;
                let (Some(creds), Some(msg)) = (creds, msg) else {
                    anyhow::bail!("mailchimp.send(creds, message)");
                };
                to_value(&self.smtp.send(&relay(creds), &msg)?)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}
