//! Master-key-derived cryptographic primitives.
//!
//! [`CryptoCore`] owns everything derived from the master key: the content
//! AEAD, the deterministic filename cipher, and the HKDF source used for
//! per-directory-IV and reverse-mode derivations. It is immutable for the
//! lifetime of a mount and freely shared across worker threads; all key
//! material is wiped on drop.

mod backend;
mod keys;

pub use backend::BackendKind;
pub use keys::{MasterKey, MASTER_KEY_LEN};

use std::io;

use aead::KeyInit;
use aes_siv::siv::Aes256Siv;
use generic_array::GenericArray;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::TryRngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};
use backend::AeadBackend;

/// HKDF info label for the content AEAD key.
const INFO_CONTENT: &[u8] = b"content";
/// HKDF info label for the filename cipher key.
const INFO_FILENAME: &[u8] = b"filename";

/// Roles for [`CryptoCore::derive`]. Each role owns a subkey expanded from
/// the master key at construction plus a per-value label, so derivations
/// can never collide across roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriveRole {
    /// Per-directory IVs in the reverse view (input: ciphertext directory
    /// path).
    DirIv,
    /// Synthesized file IDs (input: plaintext file path).
    FileId,
    /// Synthesized block nonces (input: plaintext path and block index).
    BlockNonce,
}

impl DeriveRole {
    /// HKDF info string for the role's subkey.
    fn subkey_info(self) -> &'static [u8] {
        match self {
            DeriveRole::DirIv => b"diriv",
            DeriveRole::FileId => b"fileid",
            DeriveRole::BlockNonce => b"nonce",
        }
    }

    /// Label prefixed to the input in the per-value expansion.
    fn label(self) -> &'static [u8] {
        match self {
            DeriveRole::DirIv => b"diriv:",
            DeriveRole::FileId => b"fileid:",
            DeriveRole::BlockNonce => b"nonce:",
        }
    }
}

/// How the content key relates to the master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySchedule {
    /// Content key derived with HKDF (current format).
    Hkdf,
    /// Content key is the master key used directly (legacy format).
    /// The filename key is still derived: AES-SIV needs 64 bytes.
    Legacy,
}

/// Fill `buf` from the OS entropy source, failing closed.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| CoreError::Rng)
}

/// HKDF-SHA256 expand with a nil salt.
///
/// Output lengths here are 16..64 bytes, far below the 8160-byte HKDF
/// ceiling, so expansion cannot fail.
fn hkdf_expand(ikm: &[u8], info: &[u8], out: &mut [u8]) {
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, out)
        .expect("HKDF output length within bounds");
}

pub struct CryptoCore {
    aead: AeadBackend,
    /// 512-bit AES-SIV key for filenames (MAC half first).
    name_key: Secret<[u8; 64]>,
    /// Subkeys for the reverse-mode derivations, one per [`DeriveRole`].
    /// The master key itself is not retained.
    diriv_subkey: Secret<[u8; 32]>,
    file_id_subkey: Secret<[u8; 32]>,
    nonce_subkey: Secret<[u8; 32]>,
}

impl CryptoCore {
    pub fn new(master: &MasterKey, backend: BackendKind, schedule: KeySchedule) -> Self {
        let aead = master.with_key(|mk| {
            let mut content_key = Zeroizing::new(vec![0u8; backend.key_len()]);
            match schedule {
                KeySchedule::Legacy if backend.key_len() == MASTER_KEY_LEN => {
                    content_key.copy_from_slice(mk);
                }
                _ => hkdf_expand(mk, INFO_CONTENT, &mut content_key),
            }
            AeadBackend::new(backend, &content_key)
        });

        let name_key = master.with_key(|mk| {
            let mut nk = [0u8; 64];
            hkdf_expand(mk, INFO_FILENAME, &mut nk);
            Secret::new(nk)
        });

        let subkey = |role: DeriveRole| {
            master.with_key(|mk| {
                let mut sk = [0u8; 32];
                hkdf_expand(mk, role.subkey_info(), &mut sk);
                Secret::new(sk)
            })
        };

        CryptoCore {
            aead,
            name_key,
            diriv_subkey: subkey(DeriveRole::DirIv),
            file_id_subkey: subkey(DeriveRole::FileId),
            nonce_subkey: subkey(DeriveRole::BlockNonce),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.aead.kind()
    }

    pub fn nonce_len(&self) -> usize {
        self.aead.kind().nonce_len()
    }

    pub fn tag_len(&self) -> usize {
        self.aead.kind().tag_len()
    }

    /// Per-block overhead: nonce plus tag.
    pub fn block_overhead(&self) -> usize {
        self.nonce_len() + self.tag_len()
    }

    /// A fresh random nonce of the backend's size.
    pub fn random_nonce(&self) -> Result<Vec<u8>> {
        let mut nonce = vec![0u8; self.nonce_len()];
        fill_random(&mut nonce)?;
        Ok(nonce)
    }

    /// Encrypt one unit bound to `ad`; returns the ciphertext-with-tag part
    /// (the stored block is `nonce || seal(..)`).
    pub fn seal(&self, nonce: &[u8], ad: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        self.aead
            .seal(nonce, ad, plain)
            .map_err(|_| CoreError::Backing(io::Error::other("content encryption failed")))
    }

    /// Decrypt and authenticate; tag mismatch is `AuthFail`.
    pub fn open(&self, nonce: &[u8], ad: &[u8], cipher_and_tag: &[u8]) -> Result<Vec<u8>> {
        self.aead
            .open(nonce, ad, cipher_and_tag)
            .map_err(|_| CoreError::auth("AEAD tag mismatch"))
    }

    /// Deterministic filename encryption: AES-SIV with the IV of the parent
    /// directory as associated data. Same `(name, iv)` always yields the
    /// same bytes, which is what makes lookups work.
    pub fn encrypt_name(&self, name: &[u8], iv: &[u8]) -> Vec<u8> {
        let mut cipher = Aes256Siv::new(GenericArray::from_slice(self.name_key.expose_secret()));
        let headers: &[&[u8]] = &[iv];
        // SIV accepts arbitrary-length plaintext with a single header.
        cipher
            .encrypt(headers, name)
            .expect("SIV filename encryption with one header cannot fail")
    }

    pub fn decrypt_name(&self, blob: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let mut cipher = Aes256Siv::new(GenericArray::from_slice(self.name_key.expose_secret()));
        let headers: &[&[u8]] = &[iv];
        cipher
            .decrypt(headers, blob)
            .map_err(|_| CoreError::auth("filename tag mismatch"))
    }

    /// Two-stage HKDF derivation for the deterministic reverse-mode values:
    /// the role's subkey (expanded from the master key at construction)
    /// feeds an expansion of `label || input`.
    pub fn derive(&self, role: DeriveRole, input: &[u8], out_len: usize) -> Vec<u8> {
        let subkey = match role {
            DeriveRole::DirIv => &self.diriv_subkey,
            DeriveRole::FileId => &self.file_id_subkey,
            DeriveRole::BlockNonce => &self.nonce_subkey,
        };
        let label = role.label();
        let mut info = Vec::with_capacity(label.len() + input.len());
        info.extend_from_slice(label);
        info.extend_from_slice(input);
        let mut out = vec![0u8; out_len];
        hkdf_expand(subkey.expose_secret(), &info, &mut out);
        out
    }
}
