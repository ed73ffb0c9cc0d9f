//! `std/encoding/base64`, `std/encoding/base32`, `std/encoding/hex`.
//!
//! Pure functions, no I/O accounting. Variants are exposed as nested objects:
//! `b64.urlsafe_nopadding.encode(bytes)`.

use std::rc::Rc;

use alertscript_core::{arg, Accountant, Capability, EvalContext};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::Value;

use crate::bytes::{bytes_arg, to_value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Base64Std,
    Base64Url,
    Base64StdNoPad,
    Base64UrlNoPad,
    Base32Std,
    Base32Hex,
    Base32StdNoPad,
    Base32HexNoPad,
    Hex,
}

impl Scheme {
    pub fn encode(self, data: &[u8]) -> String {
        match self {
            Scheme::Base64Std => STANDARD.encode(data),
            Scheme::Base64Url => URL_SAFE.encode(data),
            Scheme::Base64StdNoPad => STANDARD_NO_PAD.encode(data),
            Scheme::Base64UrlNoPad => URL_SAFE_NO_PAD.encode(data),
            Scheme::Base32Std => data_encoding::BASE32.encode(data),
            Scheme::Base32Hex => data_encoding::BASE32HEX.encode(data),
            Scheme::Base32StdNoPad => data_encoding::BASE32_NOPAD.encode(data),
            Scheme::Base32HexNoPad => data_encoding::BASE32HEX_NOPAD.encode(data),
            Scheme::Hex => hex::encode(data),
        }
    }

    pub fn decode(self, text: &str) -> anyhow::Result<Vec<u8>> {
        let raw = text.as_bytes();
        Ok(match self {
            Scheme::Base64Std => STANDARD.decode(raw)?,
            Scheme::Base64Url => URL_SAFE.decode(raw)?,
            Scheme::Base64StdNoPad => STANDARD_NO_PAD.decode(raw)?,
            Scheme::Base64UrlNoPad => URL_SAFE_NO_PAD.decode(raw)?,
            Scheme::Base32Std => data_encoding::BASE32.decode(raw)?,
            Scheme::Base32Hex => data_encoding::BASE32HEX.decode(raw)?,
            Scheme::Base32StdNoPad => data_encoding::BASE32_NOPAD.decode(raw)?,
            Scheme::Base32HexNoPad => data_encoding::BASE32HEX_NOPAD.decode(raw)?,
            Scheme::Hex => hex::decode(raw)?,
        })
    }
}

const BASE64_METHODS: &[&str] = &[
    "std.encode",
    "std.decode",
    "urlsafe.encode",
    "urlsafe.decode",
    "std_nopadding.encode",
    "std_nopadding.decode",
    "urlsafe_nopadding.encode",
    "urlsafe_nopadding.decode",
];
const BASE64_VARIANTS: &[(&str, Scheme)] = &[
    ("std", Scheme::Base64Std),
    ("urlsafe", Scheme::Base64Url),
    ("std_nopadding", Scheme::Base64StdNoPad),
    ("urlsafe_nopadding", Scheme::Base64UrlNoPad),
];

const BASE32_METHODS: &[&str] = &[
    "std.encode",
    "std.decode",
    "hex.encode",
    "hex.decode",
    "std_nopadding.encode",
    "std_nopadding.decode",
    "hex_nopadding.encode",
    "hex_nopadding.decode",
];
const BASE32_VARIANTS: &[(&str, Scheme)] = &[
    ("std", Scheme::Base32Std),
    ("hex", Scheme::Base32Hex),
    ("std_nopadding", Scheme::Base32StdNoPad),
    ("hex_nopadding", Scheme::Base32HexNoPad),
];

const HEX_METHODS: &[&str] = &["encode", "decode"];
const HEX_VARIANTS: &[(&str, Scheme)] = &[("", Scheme::Hex)];

pub struct Codec {
    methods: &'static [&'static str],
    variants: &'static [(&'static str, Scheme)],
}

impl Codec {
    pub fn base64() -> Self {
        Self {
            methods: BASE64_METHODS,
            variants: BASE64_VARIANTS,
        }
    }

    pub fn base32() -> Self {
        Self {
            methods: BASE32_METHODS,
            variants: BASE32_VARIANTS,
        }
    }

    pub fn hex() -> Self {
        Self {
            methods: HEX_METHODS,
            variants: HEX_VARIANTS,
        }
    }

    fn scheme(&self, variant: &str) -> Option<Scheme> {
        self.variants
            .iter()
            .find(|(name, _)| *name == variant)
            .map(|(_, s)| *s)
    }
}

impl Capability for Codec {
    fn methods(&self) -> &[&'static str] {
        self.methods
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let (variant, op) = method.rsplit_once('.').unwrap_or(("", method));
        let scheme = self
            .scheme(variant)
            .ok_or_else(|| anyhow::anyhow!("unknown method '{method}'"))?;
        match op {
            "encode" => Ok(Value::String(scheme.encode(bytes_arg(&args, 0)?.as_slice()))),
            "decode" => {
                let text: String = arg(&args, 0)?;
                let raw = scheme
                    .decode(&text)
                    .map_err(|e| anyhow::anyhow!("{method}: {e}"))?;
                Ok(to_value(&raw))
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}

pub fn base64_factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Codec::base64()))
}

pub fn base32_factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Codec::base32()))
}

pub fn hex_factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Codec::hex()))
}
