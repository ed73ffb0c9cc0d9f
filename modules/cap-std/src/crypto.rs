//! `std/crypto/hash` and `std/crypto/hmac`.

use std::rc::Rc;

use alertscript_core::{Accountant, Capability, EvalContext};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Digest;

use crate::bytes::{bytes_arg, to_value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algo {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "md5" => Some(Algo::Md5),
            "sha1" => Some(Algo::Sha1),
            "sha256" => Some(Algo::Sha256),
            "sha512" => Some(Algo::Sha512),
            _ => None,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Algo::Md5 => md5::Md5::digest(data).to_vec(),
            Algo::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Algo::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Algo::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>> {
        macro_rules! mac {
            ($d:ty) => {{
                let mut m = <Hmac<$d> as Mac>::new_from_slice(key)
                    .map_err(|e| anyhow::anyhow!("hmac key: {e}"))?;
                m.update(data);
                m.finalize().into_bytes().to_vec()
            }};
        }
        Ok(match self {
            Algo::Md5 => mac!(md5::Md5),
            Algo::Sha1 => mac!(sha1::Sha1),
            Algo::Sha256 => mac!(sha2::Sha256),
            Algo::Sha512 => mac!(sha2::Sha512),
        })
    }
}

// ---------------------------------------------------------------------------
// std/crypto/hash
// ---------------------------------------------------------------------------

const HASH_METHODS: &[&str] = &[
    "md5",
    "sha1",
    "sha256",
    "sha512",
    "md5_hex",
    "md5_base64",
    "sha1_hex",
    "sha1_base64",
    "sha256_hex",
    "sha256_base64",
    "sha512_hex",
    "sha512_base64",
];

/// `sha256(text)` returns bytes, `sha256_hex` a hex string, `sha256_base64`
/// url-safe unpadded base64.
pub struct Hash;

impl Capability for Hash {
    fn methods(&self) -> &[&'static str] {
        HASH_METHODS
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let (name, enc) = match method.split_once('_') {
            Some((name, enc)) => (name, Some(enc)),
            None => (method, None),
        };
        let algo = Algo::from_name(name).ok_or_else(|| anyhow::anyhow!("unknown method '{method}'"))?;
        let sum = algo.digest(bytes_arg(&args, 0)?.as_slice());
        Ok(match enc {
            None => to_value(&sum),
            Some("hex") => Value::String(hex::encode(&sum)),
            Some("base64") => Value::String(URL_SAFE_NO_PAD.encode(&sum)),
            Some(_) => anyhow::bail!("unknown method '{method}'"),
        })
    }
}

pub fn hash_factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(Hash))
}

// ---------------------------------------------------------------------------
// std/crypto/hmac
// ---------------------------------------------------------------------------

/// `sha256(key, text)` returns the MAC bytes.
pub struct HmacCap;

impl Capability for HmacCap {
    fn methods(&self) -> &[&'static str] {
        &["md5", "sha1", "sha256", "sha512"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let algo = Algo::from_name(method).ok_or_else(|| anyhow::anyhow!("unknown method '{method}'"))?;
        let key = bytes_arg(&args, 0)?;
        let text = bytes_arg(&args, 1)?;
        Ok(to_value(&algo.hmac(key.as_slice(), text.as_slice())?))
    }
}

pub fn hmac_factory(
    _acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(HmacCap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_digests() {
        let mut h = Hash;
        assert_eq!(
            h.call("sha1_hex", vec![json!("hello world")]).unwrap(),
            json!("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
        assert_eq!(
            h.call("md5_hex", vec![json!("")]).unwrap(),
            json!("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(
            h.call("sha256_hex", vec![json!("abc")]).unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        let raw = h.call("sha512", vec![json!("abc")]).unwrap();
        assert_eq!(raw.as_array().unwrap().len(), 64);
        // url-safe, no padding
        let b64 = h.call("sha256_base64", vec![json!("abc")]).unwrap();
        assert_eq!(b64, json!("ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0"));
        assert!(h.call("sha3", vec![json!("x")]).is_err());
    }

    #[test]
    fn hmac_sha256_vector() {
        // RFC 4231 test case 2
        let mut m = HmacCap;
        let out = m
            .call("sha256", vec![json!("Jefe"), json!("what do ya want for nothing?")])
            .unwrap();
        let bytes: Vec<u8> = serde_json::from_value(out).unwrap();
        assert_eq!(
            hex::encode(bytes),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
