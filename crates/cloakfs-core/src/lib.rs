//! Core of the cloakfs encrypting overlay filesystem.
//!
//! cloakfs presents a plaintext view of a directory tree whose file contents,
//! file names and extended attributes are stored with authenticated
//! encryption. The crate covers the cryptographic data plane and the
//! name-mapping machinery; mounting (the FUSE binding), the CLI and
//! password-based key unsealing live in separate crates.
//!
//! Two mapping directions are supported:
//!
//! - [`fs::ForwardFs`]: the backing directory holds ciphertext, operations
//!   take plaintext paths.
//! - [`fs::ReverseFs`]: the backing directory holds plaintext, operations
//!   take ciphertext paths and the encrypted view is synthesized
//!   deterministically (for encrypted backups of an existing tree).

pub mod content;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod names;
pub mod report;
pub mod xattr;

pub use crypto::{BackendKind, CryptoCore, DeriveRole, KeySchedule, MasterKey};
pub use error::{CoreError, Result};
pub use report::{corruption_channel, CorruptionReport, CorruptionSink};
