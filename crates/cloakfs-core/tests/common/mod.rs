//! Shared harness for the integration suites.

use std::path::Path;

use cloakfs_core::fs::{ForwardFs, ForwardOptions};
use cloakfs_core::{CorruptionSink, MasterKey};
use tempfile::TempDir;

pub const TEST_KEY: [u8; 32] = [0x2a; 32];

pub fn master_key() -> MasterKey {
    MasterKey::from_bytes(TEST_KEY)
}

/// A forward view over a fresh ciphertext directory.
pub fn forward_fs() -> (TempDir, ForwardFs) {
    let dir = TempDir::new().expect("create backing dir");
    let fs = ForwardFs::new(dir.path(), &master_key(), ForwardOptions::default())
        .expect("mount forward view");
    (dir, fs)
}

/// Same, with a corruption sink attached.
pub fn forward_fs_with_sink(sink: CorruptionSink) -> (TempDir, ForwardFs) {
    let dir = TempDir::new().expect("create backing dir");
    let options = ForwardOptions {
        corruption_sink: Some(sink),
        ..Default::default()
    };
    let fs = ForwardFs::new(dir.path(), &master_key(), options).expect("mount forward view");
    (dir, fs)
}

/// `user.*` xattrs are unavailable on some test filesystems (tmpfs on older
/// kernels); suites that need them bail out quietly.
pub fn xattr_supported(path: &Path) -> bool {
    let probe = path.join("xattr-probe");
    std::fs::write(&probe, b"").expect("create probe file");
    let ok = xattr::set(&probe, "user.probe", b"1").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}
