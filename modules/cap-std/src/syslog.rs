//! `std/syslog`: `send(dst, message)`.
//!
//! RFC 5424 framing (or legacy RFC 3164 with `legacy: true`), optional CEF
//! payload, `udp://` (RFC 5426), and `tcp://` or `tls://` with octet
//! counting (RFC 6587, RFC 5425). TLS peers are verified against the
//! webpki root set.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use alertscript_core::{arg, Accountant, Capability, EvalContext};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

pub const MAX_SIZE: usize = 8192;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Structured {
    pub name: String,
    /// Private enterprise number; may be a dotted OID.
    pub enterprise: String,
    pub param: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CefEvent {
    pub version: u32,
    pub vendor: String,
    pub product: String,
    pub device_version: String,
    pub classid: String,
    pub name: String,
    pub severity: String,
    pub extensions: BTreeMap<String, String>,
}

impl CefEvent {
    pub fn render(&self) -> anyhow::Result<String> {
        let header = [
            ("vendor", &self.vendor),
            ("product", &self.product),
            ("device_version", &self.device_version),
            ("classid", &self.classid),
            ("name", &self.name),
            ("severity", &self.severity),
        ];
        let mut out = format!("CEF:{}", self.version);
        for (field, value) in header {
            if value.is_empty() {
                anyhow::bail!("invalid CEF data: missing '{field}'");
            }
            out.push('|');
            out.push_str(&value.replace('\\', "\\\\").replace('|', "\\|"));
        }
        out.push('|');
        let ext: Vec<String> = self
            .extensions
            .iter()
            .map(|(k, v)| format!("{k}={}", cef_ext_value(v)))
            .collect();
        out.push_str(&ext.join(" "));
        Ok(out)
    }
}

fn cef_ext_value(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Message {
    /// BSD (RFC 3164) framing.
    pub legacy: bool,
    pub severity: String,
    pub facility: String,
    pub hostname: String,
    pub appname: String,
    pub message: String,
    pub sd_data: Vec<Structured>,
    /// When present, replaces `message`.
    pub cef: Option<CefEvent>,
}

impl Message {
    pub fn priority(&self) -> anyhow::Result<u8> {
        let sev = severity(&self.severity)
            .ok_or_else(|| anyhow::anyhow!("invalid severity '{}'", self.severity))?;
        let fac = facility(&self.facility)
            .ok_or_else(|| anyhow::anyhow!("invalid facility '{}'", self.facility))?;
        Ok((fac << 3) | sev)
    }

    pub fn build(&self, now: DateTime<Utc>) -> anyhow::Result<String> {
        let prio = self.priority()?;
        let text = match &self.cef {
            Some(cef) => cef.render()?,
            None => self.message.clone(),
        };
        let ts = rfc5424_time(now);

        let mut msg = if self.legacy {
            format!("<{prio}> {ts} {} {}: {}", self.hostname, self.appname, clean(&text))
        } else {
            format!(
                "<{prio}>1 {ts} {} {} - - {} {}",
                nil_if_empty(&self.hostname),
                nil_if_empty(&self.appname),
                self.structured_data(),
                clean(&text)
            )
        };

        if msg.len() > MAX_SIZE {
            let mut end = MAX_SIZE;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            msg.truncate(end);
        }
        Ok(msg)
    }

    fn structured_data(&self) -> String {
        let mut out = String::new();
        for sd in &self.sd_data {
            out.push('[');
            out.push_str(&sd.name);
            if !sd.enterprise.is_empty() {
                out.push('@');
                out.push_str(&sd.enterprise);
            }
            for (k, v) in &sd.param {
                out.push_str(&format!(" {k}=\"{}\"", sd_value(v)));
            }
            out.push(']');
        }
        if out.is_empty() {
            "-".to_string()
        } else {
            out
        }
    }
}

fn nil_if_empty(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Newlines become spaces; other control characters are dropped.
fn clean(s: &str) -> String {
    s.chars()
        .filter_map(|c| match c {
            '\n' => Some(' '),
            c if (c as u32) < 0x20 => None,
            c => Some(c),
        })
        .collect()
}

/// RFC 5424 6.3.3 escaping.
fn sd_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace(']', "\\]")
}

/// UTC, second precision, fractional microseconds only when non-zero.
fn rfc5424_time(t: DateTime<Utc>) -> String {
    let mut out = t.format("%Y-%m-%dT%H:%M:%S").to_string();
    let micros = t.timestamp_subsec_micros();
    if micros > 0 {
        let frac = format!("{micros:06}");
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
    out.push('Z');
    out
}

pub fn severity(name: &str) -> Option<u8> {
    Some(match name {
        "emerg" | "panic" => 0,
        "alert" => 1,
        "crit" => 2,
        "err" | "error" => 3,
        "warning" | "warn" => 4,
        "notice" => 5,
        "" | "info" => 6,
        "debug" => 7,
        _ => return None,
    })
}

pub fn facility(name: &str) -> Option<u8> {
    Some(match name {
        "kern" => 0,
        "" | "user" => 1,
        "mail" => 2,
        "daemon" => 3,
        "auth" => 4,
        "syslog" => 5,
        "lpr" => 6,
        "news" => 7,
        "uucp" => 8,
        "cron" => 9,
        "authpriv" => 10,
        "ftp" => 11,
        "ntp" => 12,
        "security" => 13,
        "console" => 14,
        "solaris-cron" => 15,
        "local0" => 16,
        "local1" => 17,
        "local2" => 18,
        "local3" => 19,
        "local4" => 20,
        "local5" => 21,
        "local6" => 22,
        "local7" => 23,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
}

impl Proto {
    fn default_port(self) -> u16 {
        match self {
            Proto::Udp | Proto::Tcp => 514,
            Proto::Tls => 6514,
        }
    }
}

/// Parsed `udp://host[:port]`, `tcp://host[:port]` or `tls://host[:port]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub proto: Proto,
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, as used for certificate checks.
    fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

pub fn parse_dst(dst: &str) -> anyhow::Result<Destination> {
    let u = Url::parse(dst)
        .map_err(|_| anyhow::anyhow!("invalid dst '{dst}', use format 'udp://127.0.0.1:514'"))?;
    let proto = match u.scheme() {
        "udp" => Proto::Udp,
        "tcp" => Proto::Tcp,
        "tls" => Proto::Tls,
        other => anyhow::bail!("invalid protocol '{other}', use udp, tcp or tls"),
    };
    let host = u
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow::anyhow!("invalid dst '{dst}': missing host"))?;
    Ok(Destination {
        proto,
        host: host.to_string(),
        port: u.port().unwrap_or_else(|| proto.default_port()),
    })
}

/// First address that accepts a connection within `timeout`.
fn connect(dst: &Destination, timeout: Duration) -> anyhow::Result<TcpStream> {
    let mut last = None;
    for sockaddr in dst.addr().to_socket_addrs()? {
        match TcpStream::connect_timeout(&sockaddr, timeout) {
            Ok(conn) => {
                conn.set_write_timeout(Some(timeout))?;
                conn.set_read_timeout(Some(timeout))?;
                return Ok(conn);
            }
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => anyhow::bail!("cannot connect to '{}': {e}", dst.addr()),
        None => anyhow::bail!("cannot resolve '{}'", dst.addr()),
    }
}

fn tls_config() -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn octet_counted(pkt: &str) -> Vec<u8> {
    format!("{} {}", pkt.len(), pkt).into_bytes()
}

fn send_packet(dst: &str, pkt: &str, timeout: Duration) -> anyhow::Result<()> {
    let dst = parse_dst(dst)?;
    match dst.proto {
        Proto::Udp => {
            let sockaddr: SocketAddr = dst
                .addr()
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| anyhow::anyhow!("cannot resolve '{}'", dst.addr()))?;
            let local: SocketAddr = if sockaddr.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let sock = UdpSocket::bind(local)?;
            sock.set_write_timeout(Some(timeout))?;
            sock.send_to(pkt.as_bytes(), sockaddr)?;
        }
        Proto::Tcp => {
            let mut conn = connect(&dst, timeout)?;
            conn.write_all(&octet_counted(pkt))?;
        }
        Proto::Tls => {
            let name = rustls::pki_types::ServerName::try_from(dst.server_name().to_string())
                .map_err(|e| anyhow::anyhow!("invalid tls server name '{}': {e}", dst.host))?;
            let session = rustls::ClientConnection::new(tls_config()?, name)?;
            let mut tls = rustls::StreamOwned::new(session, connect(&dst, timeout)?);
            tls.write_all(&octet_counted(pkt))
                .map_err(|e| anyhow::anyhow!("tls to '{}': {e}", dst.addr()))?;
            tls.conn.send_close_notify();
            tls.flush()?;
        }
    }
    Ok(())
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "-".to_string())
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub struct Syslog {
    acct: Rc<dyn Accountant>,
}

impl Syslog {
    pub fn new(acct: Rc<dyn Accountant>) -> Self {
        Self { acct }
    }

    fn send(&self, dst: &str, mut msg: Message) -> anyhow::Result<()> {
        if msg.hostname.is_empty() {
            msg.hostname = local_hostname();
        }
        let pkt = msg.build(Utc::now())?;

        let _io = self.acct.net_io_heavy()?;
        self.acct.diag(&format!("sending syslog to: {dst}"));
        if self.acct.is_dry_run() {
            return Ok(());
        }

        tracing::debug!(
            run_id = %self.acct.context().run_id(),
            dst = %dst,
            bytes = pkt.len(),
            "syslog.send"
        );
        send_packet(dst, &pkt, self.acct.net_timeout()).inspect_err(|_| self.acct.net_io_err())
    }
}

impl Capability for Syslog {
    fn methods(&self) -> &[&'static str] {
        &["send"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "send" => {
                let dst: String = arg(&args, 0)?;
                let msg: Message = arg(&args, 1)?;
                self.send(&dst, msg)?;
                Ok(Value::Null)
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
    Ok(Box::new(Syslog::new(acct)))
}
