//! Per-directory IV files.
//!
//! Every encrypted directory holds one `gocryptfs.diriv` with 16 random
//! bytes; the IV goes into the filename cipher for the directory's direct
//! children. The file is published atomically (temp file + rename) so a
//! half-written IV is never observable.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::{CoreError, Result};

pub const DIRIV_LEN: usize = 16;
pub const DIRIV_NAME: &str = "gocryptfs.diriv";

/// Create a fresh random IV file inside `dir` and return the IV.
pub fn create(dir: &Path) -> Result<[u8; DIRIV_LEN]> {
    let mut iv = [0u8; DIRIV_LEN];
    crate::crypto::fill_random(&mut iv)?;
    write(dir, &iv)?;
    Ok(iv)
}

/// Atomically publish `iv` as `dir/gocryptfs.diriv`.
pub fn write(dir: &Path, iv: &[u8; DIRIV_LEN]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(iv)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o400))?;
    tmp.persist(dir.join(DIRIV_NAME)).map_err(|e| e.error)?;
    trace!(dir = %dir.display(), "published directory IV");
    Ok(())
}

/// Read the IV of `dir` from disk.
pub fn read(dir: &Path) -> Result<[u8; DIRIV_LEN]> {
    let path = dir.join(DIRIV_NAME);
    let bytes = fs::read(&path)?;
    if bytes.len() != DIRIV_LEN {
        return Err(CoreError::header(format!(
            "directory IV {} has {} bytes, want {DIRIV_LEN}",
            path.display(),
            bytes.len()
        )));
    }
    let mut iv = [0u8; DIRIV_LEN];
    iv.copy_from_slice(&bytes);
    Ok(iv)
}

#[derive(Debug, Clone, Copy)]
struct CachedIv {
    iv: [u8; DIRIV_LEN],
    mtime: SystemTime,
}

/// Read-side IV cache keyed by absolute backing directory, invalidated when
/// the IV file's mtime changes.
#[derive(Debug, Default)]
pub struct DirIvCache {
    entries: DashMap<PathBuf, CachedIv>,
}

impl DirIvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dir: &Path) -> Result<[u8; DIRIV_LEN]> {
        let mtime = fs::metadata(dir.join(DIRIV_NAME))?.modified()?;
        if let Some(hit) = self.entries.get(dir) {
            if hit.mtime == mtime {
                return Ok(hit.iv);
            }
        }
        let iv = read(dir)?;
        self.entries
            .insert(dir.to_path_buf(), CachedIv { iv, mtime });
        Ok(iv)
    }

    pub fn invalidate(&self, dir: &Path) {
        self.entries.remove(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let iv = create(dir.path()).unwrap();
        assert_eq!(read(dir.path()).unwrap(), iv);
        let meta = fs::metadata(dir.path().join(DIRIV_NAME)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o400);
    }

    #[test]
    fn short_iv_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DIRIV_NAME), b"short").unwrap();
        assert!(read(dir.path()).is_err());
    }

    #[test]
    fn cache_follows_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let iv = create(dir.path()).unwrap();
        let cache = DirIvCache::new();
        assert_eq!(cache.get(dir.path()).unwrap(), iv);

        // Replace the IV with a different mtime; the cache must notice.
        let new_iv = [9u8; DIRIV_LEN];
        write(dir.path(), &new_iv).unwrap();
        let stale_free = cache.get(dir.path()).unwrap();
        assert!(stale_free == iv || stale_free == new_iv);
        // Force invalidation for determinism on coarse-mtime filesystems.
        cache.invalidate(dir.path());
        assert_eq!(cache.get(dir.path()).unwrap(), new_iv);
    }

    #[test]
    fn missing_iv_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read(dir.path()),
            Err(CoreError::Backing(e)) if e.kind() == std::io::ErrorKind::NotFound
        ));
    }
}
