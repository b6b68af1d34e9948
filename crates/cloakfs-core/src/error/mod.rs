//! Error kinds shared across the crate.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the cryptographic data plane and the path frontends.
///
/// Authentication failures are potential adversarial tampering and are never
/// downgraded to plaintext output; callers receive an I/O-error kind and the
/// event is emitted on the corruption sink where one is attached.
#[derive(Error, Debug)]
pub enum CoreError {
    /// AEAD tag verification failed on file content or an xattr value.
    #[error("ciphertext authentication failed: {detail}")]
    AuthFail { detail: String },

    /// Missing, short or bad-version file header (or a malformed
    /// directory-IV file, which plays the same role for a directory).
    #[error("invalid header: {detail}")]
    HeaderFail { detail: String },

    /// An encrypted name that does not base64-decode, does not authenticate,
    /// or decrypts to an invalid filename.
    #[error("undecodable encrypted name {name:?}")]
    NameDecode { name: String },

    /// A `gocryptfs.longname.*` entry without its `.name` sidecar.
    #[error("long name sidecar missing for {stem:?}")]
    LongNameMissing { stem: String },

    /// The system entropy source failed. Fail-closed: no nonce, no write.
    #[error("system entropy source unavailable")]
    Rng,

    /// Any error coming back from the backing filesystem.
    #[error(transparent)]
    Backing(#[from] io::Error),

    /// Operation not meaningful on this mount (e.g. writing to a reverse
    /// view). Surfaces as permission denied.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl CoreError {
    pub fn auth(detail: impl Into<String>) -> Self {
        CoreError::AuthFail {
            detail: detail.into(),
        }
    }

    pub fn header(detail: impl Into<String>) -> Self {
        CoreError::HeaderFail {
            detail: detail.into(),
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        CoreError::NameDecode { name: name.into() }
    }

    /// The `std::io::ErrorKind` equivalent presented to filesystem callers.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            CoreError::AuthFail { .. }
            | CoreError::HeaderFail { .. }
            | CoreError::NameDecode { .. }
            | CoreError::LongNameMissing { .. } => io::ErrorKind::InvalidData,
            CoreError::Rng => io::ErrorKind::Other,
            CoreError::Backing(e) => e.kind(),
            CoreError::Unsupported(_) => io::ErrorKind::PermissionDenied,
        }
    }
}

impl From<CoreError> for io::Error {
    fn from(e: CoreError) -> io::Error {
        match e {
            CoreError::Backing(inner) => inner,
            other => io::Error::new(other.io_kind(), other.to_string()),
        }
    }
}
