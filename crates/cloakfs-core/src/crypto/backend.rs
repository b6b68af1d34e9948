//! AEAD backend selection for file content.
//!
//! The on-disk block format is `nonce || ciphertext || tag` for the nonce-based
//! backends; AES-SIV emits its synthetic IV in front of the ciphertext, so the
//! stored layout there is `nonce || tag || ciphertext` with the same total
//! overhead. Callers treat everything after the nonce as opaque.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{aes::Aes256, AesGcm};
use aes_siv::siv::Aes256Siv;
use chacha20poly1305::XChaCha20Poly1305;
use generic_array::{typenum::U16, GenericArray};
use secrecy::{ExposeSecret, Secret};

/// AES-256-GCM with 128-bit nonces, the default on-disk format.
type Aes256Gcm128Iv = AesGcm<Aes256, U16>;

/// Content encryption backend selector, fixed at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// AES-256-GCM, 16-byte nonce, 16-byte tag.
    AesGcm256,
    /// XChaCha20-Poly1305, 24-byte nonce, 16-byte tag.
    XChaCha20Poly1305,
    /// AES-SIV (RFC 5297) with a 512-bit key, 16-byte nonce, 16-byte tag.
    AesSiv512,
}

impl BackendKind {
    pub fn nonce_len(self) -> usize {
        match self {
            BackendKind::AesGcm256 | BackendKind::AesSiv512 => 16,
            BackendKind::XChaCha20Poly1305 => 24,
        }
    }

    pub fn tag_len(self) -> usize {
        16
    }

    /// Length of the content key the backend consumes.
    pub(crate) fn key_len(self) -> usize {
        match self {
            BackendKind::AesGcm256 | BackendKind::XChaCha20Poly1305 => 32,
            BackendKind::AesSiv512 => 64,
        }
    }
}

/// The instantiated content cipher.
///
/// SIV keeps raw key material (its cipher state is not reusable across
/// calls); the key is wrapped in [`Secret`] so it is zeroized on drop, same
/// as the other backends' key schedules inside the cipher structs.
pub(crate) enum AeadBackend {
    AesGcm(Box<Aes256Gcm128Iv>),
    XChaCha(Box<XChaCha20Poly1305>),
    AesSiv(Secret<[u8; 64]>),
}

impl AeadBackend {
    /// `key` must be `kind.key_len()` bytes.
    pub(crate) fn new(kind: BackendKind, key: &[u8]) -> Self {
        debug_assert_eq!(key.len(), kind.key_len());
        match kind {
            BackendKind::AesGcm256 => {
                AeadBackend::AesGcm(Box::new(Aes256Gcm128Iv::new(GenericArray::from_slice(key))))
            }
            BackendKind::XChaCha20Poly1305 => AeadBackend::XChaCha(Box::new(
                XChaCha20Poly1305::new(GenericArray::from_slice(key)),
            )),
            BackendKind::AesSiv512 => {
                let mut k = [0u8; 64];
                k.copy_from_slice(key);
                AeadBackend::AesSiv(Secret::new(k))
            }
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            AeadBackend::AesGcm(_) => BackendKind::AesGcm256,
            AeadBackend::XChaCha(_) => BackendKind::XChaCha20Poly1305,
            AeadBackend::AesSiv(_) => BackendKind::AesSiv512,
        }
    }

    /// Encrypt `plain` bound to `ad`. Returns the ciphertext-with-tag part
    /// of the block (the caller prepends the nonce).
    pub(crate) fn seal(
        &self,
        nonce: &[u8],
        ad: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, aead::Error> {
        match self {
            AeadBackend::AesGcm(cipher) => cipher.encrypt(
                GenericArray::from_slice(nonce),
                Payload { msg: plain, aad: ad },
            ),
            AeadBackend::XChaCha(cipher) => cipher.encrypt(
                GenericArray::from_slice(nonce),
                Payload { msg: plain, aad: ad },
            ),
            AeadBackend::AesSiv(key) => {
                let mut cipher = Aes256Siv::new(GenericArray::from_slice(key.expose_secret()));
                let headers: &[&[u8]] = &[ad, nonce];
                cipher.encrypt(headers, plain)
            }
        }
    }

    /// Decrypt and verify the ciphertext-with-tag part of a block.
    pub(crate) fn open(
        &self,
        nonce: &[u8],
        ad: &[u8],
        cipher_and_tag: &[u8],
    ) -> Result<Vec<u8>, aead::Error> {
        match self {
            AeadBackend::AesGcm(cipher) => cipher.decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: cipher_and_tag,
                    aad: ad,
                },
            ),
            AeadBackend::XChaCha(cipher) => cipher.decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: cipher_and_tag,
                    aad: ad,
                },
            ),
            AeadBackend::AesSiv(key) => {
                let mut cipher = Aes256Siv::new(GenericArray::from_slice(key.expose_secret()));
                let headers: &[&[u8]] = &[ad, nonce];
                cipher.decrypt(headers, cipher_and_tag)
            }
        }
    }
}
