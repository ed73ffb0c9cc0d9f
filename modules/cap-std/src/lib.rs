//! Standard capabilities every alertscript host ships.
//!
//! | name | what |
//! |---|---|
//! | `std/web` | HTTP requests (+ `get`, `post`, `post_json`, `post_urlencoded` helpers) |
//! | `std/encoding/base64`, `std/encoding/base32`, `std/encoding/hex` | byte encodings |
//! | `std/crypto/hash`, `std/crypto/hmac` | md5 / sha1 / sha256 / sha512 |
//! | `std/store` | in-memory key/value store |
//! | `std/syslog` | RFC 5424 / 3164 messages over udp, tcp or tls |
//! | `std/smtp` | mail through an SMTP relay |
//!
//! Byte values cross into scripts as arrays of numbers; byte arguments accept
//! either such an array or a string (taken as UTF-8).

use alertscript_runner::{CapRegistry, RegistryError};

pub mod bytes;
pub mod crypto;
pub mod encoding;
pub mod smtp;
pub mod store;
pub mod syslog;
pub mod web;

/// Register every standard capability.
pub fn register(reg: &mut CapRegistry) -> Result<(), RegistryError> {
    reg.register_with_prelude("std/web", web::factory, web::PRELUDE)?;
    reg.register("std/encoding/base64", encoding::base64_factory)?;
    reg.register("std/encoding/base32", encoding::base32_factory)?;
    reg.register("std/encoding/hex", encoding::hex_factory)?;
    reg.register("std/crypto/hash", crypto::hash_factory)?;
    reg.register("std/crypto/hmac", crypto::hmac_factory)?;
    reg.register("std/store", store::factory)?;
    reg.register("std/syslog", syslog::factory)?;
    reg.register("std/smtp", smtp::factory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_names_once() {
        let mut reg = CapRegistry::new();
        register(&mut reg).unwrap();
        assert_eq!(reg.names().count(), 9);
        assert!(reg.contains("std/smtp"));
        assert!(reg.get("std/web").unwrap().prelude.is_some());
        assert!(matches!(register(&mut reg), Err(RegistryError::Duplicate(_))));
    }
}
