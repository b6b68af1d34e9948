//! Directory-IV-scoped filename encryption.
//!
//! A plaintext component encrypts deterministically under its parent's
//! directory IV (AES-SIV, then base64url without padding), so the same name
//! in two directories yields unrelated ciphertext while lookups inside one
//! directory stay exact. Encrypted names whose encoded form exceeds
//! [`NAME_MAX`] fall back to the long-name protocol: the directory entry is
//! `gocryptfs.longname.<sha256>` and a `.name` sidecar stores the full
//! encrypted name.

pub mod diriv;

pub use diriv::{DirIvCache, DIRIV_LEN, DIRIV_NAME};

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::crypto::CryptoCore;
use crate::error::{CoreError, Result};

/// Longest on-disk name component we will produce.
pub const NAME_MAX: usize = 255;
/// Prefix of hashed stand-in names for overlong encrypted names.
pub const LONGNAME_PREFIX: &str = "gocryptfs.longname.";
/// Suffix of the sidecar file storing the full encrypted name.
pub const LONGNAME_SUFFIX: &str = ".name";
/// Reserved control-file names in the ciphertext namespace. Encrypted names
/// are base64url and can never contain a dot, so no collision is possible.
pub const RESERVED_PREFIX: &str = "gocryptfs.";
pub const CONF_NAME: &str = "gocryptfs.conf";
pub const CONF_REVERSE_NAME: &str = ".gocryptfs.reverse.conf";

/// Upper bound on sidecar contents; anything bigger is garbage.
const LONGNAME_CONTENT_MAX: u64 = 4096;

pub struct NameTransform {
    core: Arc<CryptoCore>,
    /// `(dir_iv, plain) -> encrypted`; SIV is deterministic, so entries
    /// never go stale.
    cache: DashMap<([u8; DIRIV_LEN], String), String>,
}

impl NameTransform {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        NameTransform {
            core,
            cache: DashMap::new(),
        }
    }

    /// Encrypt one path component under `iv`.
    pub fn encrypt_name(&self, plain: &str, iv: &[u8; DIRIV_LEN]) -> Result<String> {
        validate_plain_name(plain)?;
        let key = (*iv, plain.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let encrypted = URL_SAFE_NO_PAD.encode(self.core.encrypt_name(plain.as_bytes(), iv));
        self.cache.insert(key, encrypted.clone());
        Ok(encrypted)
    }

    /// Decrypt one on-disk component under `iv`. Anything that does not
    /// decode back to a valid plaintext component is `NameDecodeFail`.
    pub fn decrypt_name(&self, encrypted: &str, iv: &[u8; DIRIV_LEN]) -> Result<String> {
        let blob = URL_SAFE_NO_PAD
            .decode(encrypted)
            .map_err(|_| CoreError::name(encrypted))?;
        let plain_bytes = self
            .core
            .decrypt_name(&blob, iv)
            .map_err(|_| CoreError::name(encrypted))?;
        let plain = String::from_utf8(plain_bytes).map_err(|_| CoreError::name(encrypted))?;
        if validate_plain_name(&plain).is_err() {
            return Err(CoreError::name(encrypted));
        }
        Ok(plain)
    }

    /// Whether an encrypted name needs the long-name protocol.
    pub fn is_long_name(encrypted: &str) -> bool {
        encrypted.len() > NAME_MAX
    }

    /// The hashed stand-in for an overlong encrypted name.
    pub fn hash_long_name(encrypted: &str) -> String {
        let digest = Sha256::digest(encrypted.as_bytes());
        format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
    }

    /// A `gocryptfs.longname.*` payload entry (not the sidecar itself).
    pub fn is_long_stem(name: &str) -> bool {
        name.starts_with(LONGNAME_PREFIX) && !name.ends_with(LONGNAME_SUFFIX)
    }

    pub fn is_long_sidecar(name: &str) -> bool {
        name.starts_with(LONGNAME_PREFIX) && name.ends_with(LONGNAME_SUFFIX)
    }

    /// Recover the full encrypted name of `stem` from its sidecar.
    pub fn read_long_name(&self, dir: &Path, stem: &str) -> Result<String> {
        let path = dir.join(format!("{stem}{LONGNAME_SUFFIX}"));
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CoreError::LongNameMissing {
                    stem: stem.to_string(),
                }
            } else {
                CoreError::Backing(e)
            }
        })?;
        if meta.len() > LONGNAME_CONTENT_MAX {
            return Err(CoreError::name(stem));
        }
        let content = fs::read(&path)?;
        let full = String::from_utf8(content).map_err(|_| CoreError::name(stem))?;
        if full.is_empty() || full.len() <= NAME_MAX {
            return Err(CoreError::name(stem));
        }
        Ok(full)
    }

    /// Atomically publish the sidecar for `stem`.
    pub fn write_long_name(&self, dir: &Path, stem: &str, full: &str) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(full.as_bytes())?;
        tmp.persist(dir.join(format!("{stem}{LONGNAME_SUFFIX}")))
            .map_err(|e| e.error)?;
        Ok(())
    }

    pub fn remove_long_name(&self, dir: &Path, stem: &str) -> Result<()> {
        fs::remove_file(dir.join(format!("{stem}{LONGNAME_SUFFIX}")))?;
        Ok(())
    }
}

/// A valid plaintext component: non-empty, not `.`/`..`, free of `/` and
/// NUL, and short enough to encrypt.
fn validate_plain_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::Backing(io::Error::from_raw_os_error(
            libc::EINVAL,
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CoreError::Backing(io::Error::from_raw_os_error(
            libc::EINVAL,
        )));
    }
    if name.len() > NAME_MAX {
        return Err(CoreError::Backing(io::Error::from_raw_os_error(
            libc::ENAMETOOLONG,
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BackendKind, KeySchedule, MasterKey};

    fn transform() -> NameTransform {
        let master = MasterKey::from_bytes([3u8; 32]);
        let core = Arc::new(CryptoCore::new(
            &master,
            BackendKind::AesGcm256,
            KeySchedule::Hkdf,
        ));
        NameTransform::new(core)
    }

    #[test]
    fn roundtrip_and_determinism() {
        let t = transform();
        let iv = [7u8; DIRIV_LEN];
        let enc1 = t.encrypt_name("hello.txt", &iv).unwrap();
        let enc2 = t.encrypt_name("hello.txt", &iv).unwrap();
        assert_eq!(enc1, enc2);
        assert!(!enc1.contains('.'));
        assert_eq!(t.decrypt_name(&enc1, &iv).unwrap(), "hello.txt");
    }

    #[test]
    fn different_iv_different_name() {
        let t = transform();
        let a = t.encrypt_name("file", &[1u8; DIRIV_LEN]).unwrap();
        let b = t.encrypt_name("file", &[2u8; DIRIV_LEN]).unwrap();
        assert_ne!(a, b);
        assert!(t.decrypt_name(&a, &[2u8; DIRIV_LEN]).is_err());
    }

    #[test]
    fn invalid_plain_names_rejected() {
        let t = transform();
        let iv = [0u8; DIRIV_LEN];
        for bad in ["", ".", "..", "a/b", "nul\0byte"] {
            assert!(t.encrypt_name(bad, &iv).is_err(), "accepted {bad:?}");
        }
        assert!(t.encrypt_name(&"x".repeat(256), &iv).is_err());
    }

    #[test]
    fn reserved_names_never_decode() {
        let t = transform();
        let iv = [7u8; DIRIV_LEN];
        assert!(t.decrypt_name(DIRIV_NAME, &iv).is_err());
        assert!(t.decrypt_name(CONF_NAME, &iv).is_err());
    }

    #[test]
    fn long_name_hash_is_stable_and_short() {
        let long = "A".repeat(300);
        let stem = NameTransform::hash_long_name(&long);
        assert_eq!(stem, NameTransform::hash_long_name(&long));
        assert!(stem.len() <= NAME_MAX);
        assert!(NameTransform::is_long_stem(&stem));
        assert!(!NameTransform::is_long_stem(&format!(
            "{stem}{LONGNAME_SUFFIX}"
        )));
        assert!(NameTransform::is_long_sidecar(&format!(
            "{stem}{LONGNAME_SUFFIX}"
        )));
    }

    #[test]
    fn sidecar_roundtrip_and_missing_sidecar() {
        let t = transform();
        let dir = tempfile::tempdir().unwrap();
        let full = "B".repeat(300);
        let stem = NameTransform::hash_long_name(&full);

        assert!(matches!(
            t.read_long_name(dir.path(), &stem),
            Err(CoreError::LongNameMissing { .. })
        ));

        t.write_long_name(dir.path(), &stem, &full).unwrap();
        assert_eq!(t.read_long_name(dir.path(), &stem).unwrap(), full);

        t.remove_long_name(dir.path(), &stem).unwrap();
        assert!(t.read_long_name(dir.path(), &stem).is_err());
    }

    #[test]
    fn long_plain_names_overflow_name_max() {
        let t = transform();
        let iv = [7u8; DIRIV_LEN];
        let plain = "x".repeat(200);
        let enc = t.encrypt_name(&plain, &iv).unwrap();
        assert!(NameTransform::is_long_name(&enc));
        assert_eq!(t.decrypt_name(&enc, &iv).unwrap(), plain);
    }
}
