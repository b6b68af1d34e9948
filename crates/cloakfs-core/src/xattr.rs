//! Extended-attribute encryption.
//!
//! Attribute names in the `user.` namespace map to
//! `user.gocryptfs.<base64url(name-cipher(suffix, zero IV))>`; names are not
//! scoped to a directory, so the IV is all zeros. Values are AEAD-encrypted
//! with a fresh nonce and empty associated data and stored as raw binary
//! `nonce || ciphertext || tag`. Older versions stored the same record
//! base64url-encoded; the decoder accepts both, raw first.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::crypto::CryptoCore;
use crate::error::{CoreError, Result};

/// Namespace of attributes the encrypted view translates.
pub const USER_PREFIX: &str = "user.";
/// On-disk prefix of encrypted attribute names.
pub const STORE_PREFIX: &str = "user.gocryptfs.";

const ZERO_IV: [u8; 16] = [0u8; 16];

pub struct XattrCodec {
    core: Arc<CryptoCore>,
}

impl XattrCodec {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        XattrCodec { core }
    }

    /// Map `user.foo` to its on-disk encrypted name. Attributes outside the
    /// `user.` namespace are not translated.
    pub fn encrypt_name(&self, plain: &str) -> Result<String> {
        let suffix = plain
            .strip_prefix(USER_PREFIX)
            .ok_or(CoreError::Unsupported("only user. xattrs are encrypted"))?;
        if suffix.is_empty() {
            return Err(CoreError::Unsupported("empty xattr name"));
        }
        let blob = self.core.encrypt_name(suffix.as_bytes(), &ZERO_IV);
        Ok(format!("{STORE_PREFIX}{}", URL_SAFE_NO_PAD.encode(blob)))
    }

    /// Map an on-disk encrypted name back to `user.foo`.
    pub fn decrypt_name(&self, stored: &str) -> Result<String> {
        let encoded = stored
            .strip_prefix(STORE_PREFIX)
            .ok_or_else(|| CoreError::name(stored))?;
        let blob = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CoreError::name(stored))?;
        let plain = self
            .core
            .decrypt_name(&blob, &ZERO_IV)
            .map_err(|_| CoreError::name(stored))?;
        let suffix = String::from_utf8(plain).map_err(|_| CoreError::name(stored))?;
        Ok(format!("{USER_PREFIX}{suffix}"))
    }

    pub fn is_encrypted_name(stored: &str) -> bool {
        stored.starts_with(STORE_PREFIX)
    }

    /// Encrypt a value. Empty values are allowed and round-trip; their
    /// record is just `nonce || tag`.
    pub fn encrypt_value(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.core.random_nonce()?;
        let sealed = self.core.seal(&nonce, b"", plain)?;
        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a stored value. Raw binary is tried first when the length
    /// permits a record at all; otherwise, and when the raw parse fails
    /// authentication, the bytes are treated as a base64url-encoded record
    /// and retried. If neither form authenticates, the value is corrupt.
    pub fn decrypt_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let min = self.core.block_overhead();
        if stored.len() >= min {
            if let Ok(plain) = self.open_record(stored) {
                return Ok(plain);
            }
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(stored)
            .map_err(|_| CoreError::auth("xattr value is neither a binary record nor base64"))?;
        if decoded.len() < min {
            return Err(CoreError::auth("xattr value too short for a record"));
        }
        self.open_record(&decoded)
    }

    fn open_record(&self, record: &[u8]) -> Result<Vec<u8>> {
        let (nonce, rest) = record.split_at(self.core.nonce_len());
        self.core.open(nonce, b"", rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BackendKind, KeySchedule, MasterKey};

    fn codec() -> XattrCodec {
        let master = MasterKey::from_bytes([4u8; 32]);
        let core = Arc::new(CryptoCore::new(
            &master,
            BackendKind::AesGcm256,
            KeySchedule::Hkdf,
        ));
        XattrCodec::new(core)
    }

    #[test]
    fn name_roundtrip() {
        let c = codec();
        let stored = c.encrypt_name("user.foo").unwrap();
        assert!(stored.starts_with(STORE_PREFIX));
        assert_eq!(c.decrypt_name(&stored).unwrap(), "user.foo");
    }

    #[test]
    fn name_encryption_is_deterministic() {
        let c = codec();
        assert_eq!(
            c.encrypt_name("user.foo").unwrap(),
            c.encrypt_name("user.foo").unwrap()
        );
    }

    #[test]
    fn non_user_names_are_unsupported() {
        let c = codec();
        assert!(matches!(
            c.encrypt_name("security.selinux"),
            Err(CoreError::Unsupported(_))
        ));
        assert!(matches!(
            c.encrypt_name("user."),
            Err(CoreError::Unsupported(_))
        ));
    }

    #[test]
    fn value_roundtrip_raw() {
        let c = codec();
        let stored = c.encrypt_value(b"123456789").unwrap();
        assert_eq!(stored.len(), 16 + 9 + 16);
        assert_eq!(c.decrypt_value(&stored).unwrap(), b"123456789");
    }

    #[test]
    fn empty_value_roundtrip() {
        let c = codec();
        let stored = c.encrypt_value(b"").unwrap();
        assert_eq!(stored.len(), 32);
        assert_eq!(c.decrypt_value(&stored).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn legacy_base64_value_decodes() {
        let c = codec();
        let raw = c.encrypt_value(b"legacy payload").unwrap();
        let legacy = URL_SAFE_NO_PAD.encode(&raw).into_bytes();
        assert_eq!(c.decrypt_value(&legacy).unwrap(), b"legacy payload");
    }

    #[test]
    fn broken_values_are_rejected() {
        let c = codec();
        let broken: [&[u8]; 4] = [
            b"111",
            b"raw-test-long-block123",
            b"raw-test-long-block123-xyz11111111111111111111111111111111111111",
            b"$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$$",
        ];
        for val in broken {
            let err = c.decrypt_value(val).unwrap_err();
            assert_eq!(
                err.io_kind(),
                std::io::ErrorKind::InvalidData,
                "value {:?} must be rejected",
                String::from_utf8_lossy(val)
            );
        }
    }

    #[test]
    fn undecodable_stored_names_hide_not_panic() {
        let c = codec();
        assert!(c.decrypt_name("user.gocryptfs.!!!not-base64!!!").is_err());
        assert!(c.decrypt_name("user.other").is_err());
    }
}
