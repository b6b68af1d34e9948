//! Reverse direction: a deterministic ciphertext view over plaintext.
//!
//! Everything that is stored-random in the forward direction is derived here
//! from the master key and the path, each through its own HKDF subkey and
//! label: the per-directory IV from the ciphertext directory path, the file
//! ID and the per-block nonces from the plaintext file path. Reading the
//! same synthesized file twice, or from two mounts with the same master
//! key, yields identical bytes.
//!
//! The view is read-only; mutating operations fail with a
//! permission-denied kind.

use std::cmp::min;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use tracing::instrument;

use crate::content::file::read_full_at;
use crate::content::{ContentEnc, FileHeader, BLOCK_SIZE, FILE_ID_LEN, HEADER_LEN};
use crate::crypto::{BackendKind, CryptoCore, DeriveRole, KeySchedule, MasterKey};
use crate::error::{CoreError, Result};
use crate::fs::{attr_from_metadata, DirEntry, FileKind, FsAttr, StatFs};
use crate::names::{
    NameTransform, CONF_NAME, CONF_REVERSE_NAME, DIRIV_LEN, DIRIV_NAME, LONGNAME_SUFFIX,
};

/// Nonce of `block` in the file at `plain_rel`. Symlink targets use block 0.
fn derive_block_nonce(core: &CryptoCore, plain_rel: &str, block: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(plain_rel.len() + 8);
    input.extend_from_slice(plain_rel.as_bytes());
    input.extend_from_slice(&block.to_be_bytes());
    core.derive(DeriveRole::BlockNonce, &input, core.nonce_len())
}

/// Ciphertext view of a plaintext backing directory.
pub struct ReverseFs {
    backing: PathBuf,
    core: Arc<CryptoCore>,
    enc: Arc<ContentEnc>,
    names: Arc<NameTransform>,
    /// Synthesized inode numbers; the map keeps hardlinked files stable.
    ino_gen: AtomicU64,
    ino_map: DashMap<(u64, u64), u64>,
    /// `(ciphertext dir, longname stem) -> plaintext name`.
    longnames: DashMap<(String, String), String>,
}

impl ReverseFs {
    pub fn new(
        backing: impl Into<PathBuf>,
        master: &MasterKey,
        backend: BackendKind,
        schedule: KeySchedule,
    ) -> Result<Self> {
        let backing = backing.into();
        if !fs::metadata(&backing)?.is_dir() {
            return Err(CoreError::Backing(io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }
        let core = Arc::new(CryptoCore::new(master, backend, schedule));
        Ok(ReverseFs {
            backing,
            enc: Arc::new(ContentEnc::new(core.clone())),
            names: Arc::new(NameTransform::new(core.clone())),
            core,
            ino_gen: AtomicU64::new(1),
            ino_map: DashMap::new(),
            longnames: DashMap::new(),
        })
    }

    // ---- derivations ----

    fn next_ino(&self) -> u64 {
        self.ino_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// The IV of the directory at ciphertext path `cipher_dir`; derived, not
    /// stored.
    fn dir_iv(&self, cipher_dir: &str) -> [u8; DIRIV_LEN] {
        let out = self
            .core
            .derive(DeriveRole::DirIv, cipher_dir.as_bytes(), DIRIV_LEN);
        let mut iv = [0u8; DIRIV_LEN];
        iv.copy_from_slice(&out);
        iv
    }

    fn file_id(&self, plain_rel: &str) -> [u8; FILE_ID_LEN] {
        let out = self
            .core
            .derive(DeriveRole::FileId, plain_rel.as_bytes(), FILE_ID_LEN);
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&out);
        id
    }

    // ---- path translation (ciphertext to plaintext) ----

    fn split_parent(rel: &str) -> (&str, &str) {
        match rel.rsplit_once('/') {
            Some((dir, base)) => (dir, base),
            None => ("", rel),
        }
    }

    fn join_rel(dir: &str, name: &str) -> String {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    /// Decrypt one ciphertext component located in `cipher_dir` (whose
    /// plaintext counterpart is `plain_dir`). Long-name stems are resolved
    /// by scanning the plaintext directory for the name that hashes to the
    /// stem.
    fn decrypt_component(
        &self,
        cipher_dir: &str,
        plain_dir: &str,
        comp: &str,
    ) -> Result<String> {
        let iv = self.dir_iv(cipher_dir);
        if !NameTransform::is_long_stem(comp) {
            return self.names.decrypt_name(comp, &iv);
        }

        let cache_key = (cipher_dir.to_string(), comp.to_string());
        if let Some(hit) = self.longnames.get(&cache_key) {
            // The plaintext tree can change underneath us; trust the cache
            // only while the entry still exists.
            if self.backing.join(plain_dir).join(hit.value()).exists() {
                return Ok(hit.value().clone());
            }
        }

        for entry in fs::read_dir(self.backing.join(plain_dir))? {
            let entry = entry?;
            let Ok(plain_name) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(encrypted) = self.names.encrypt_name(&plain_name, &iv) else {
                continue;
            };
            if NameTransform::is_long_name(&encrypted)
                && NameTransform::hash_long_name(&encrypted) == comp
            {
                self.longnames.insert(cache_key, plain_name.clone());
                return Ok(plain_name);
            }
        }
        Err(CoreError::Backing(io::Error::from_raw_os_error(
            libc::ENOENT,
        )))
    }

    /// Plaintext relative path of a ciphertext relative path.
    fn decrypt_path(&self, cipher_rel: &str) -> Result<String> {
        let mut cipher_so_far = String::new();
        let mut plain_so_far = String::new();
        for comp in cipher_rel.split('/') {
            if comp.is_empty() || comp == "." {
                continue;
            }
            if comp == ".." {
                return Err(CoreError::Backing(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )));
            }
            let plain = self.decrypt_component(&cipher_so_far, &plain_so_far, comp)?;
            cipher_so_far = Self::join_rel(&cipher_so_far, comp);
            plain_so_far = Self::join_rel(&plain_so_far, &plain);
        }
        Ok(plain_so_far)
    }

    fn plain_abs(&self, plain_rel: &str) -> PathBuf {
        if plain_rel.is_empty() {
            self.backing.clone()
        } else {
            self.backing.join(plain_rel)
        }
    }

    // ---- attributes ----

    /// Stat a plaintext path and hand out a synthesized inode number.
    /// Hardlinked regular files share one stable number so link counts stay
    /// meaningful; everything else gets a fresh one.
    fn ino_aware_attr(&self, plain_rel: &str) -> Result<FsAttr> {
        let abs = self.plain_abs(plain_rel);
        let md = if plain_rel.is_empty() {
            // Follow symlinks for the root itself.
            fs::metadata(&abs)?
        } else {
            fs::symlink_metadata(&abs)?
        };
        let mut attr = attr_from_metadata(&md);
        // attr.ino still holds the backing inode number here; it keys the
        // map before being replaced with the synthesized one.
        attr.ino = if attr.kind == FileKind::File && attr.nlink > 1 {
            *self
                .ino_map
                .entry((attr.dev, attr.ino))
                .or_insert_with(|| self.next_ino())
        } else {
            self.next_ino()
        };
        Ok(attr)
    }

    /// Attributes of the virtual `gocryptfs.diriv` in `cipher_dir`: the
    /// parent's timestamps, 16 bytes, read-only.
    fn diriv_attr(&self, cipher_dir: &str) -> Result<FsAttr> {
        let plain_dir = self.decrypt_path(cipher_dir)?;
        let mut attr = self.ino_aware_attr(&plain_dir)?;
        if attr.kind != FileKind::Dir {
            return Err(CoreError::Backing(io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }
        if attr.perm & 0o100 == 0 {
            return Err(CoreError::Backing(io::Error::from_raw_os_error(
                libc::EACCES,
            )));
        }
        attr.kind = FileKind::File;
        attr.size = DIRIV_LEN as u64;
        attr.perm = 0o400;
        attr.nlink = 1;
        attr.ino = self.next_ino();
        Ok(attr)
    }

    /// Full encrypted name behind a `gocryptfs.longname.*` stem.
    fn stem_to_encrypted(&self, cipher_dir: &str, stem: &str) -> Result<String> {
        let plain_dir = self.decrypt_path(cipher_dir)?;
        let plain_name = self.decrypt_component(cipher_dir, &plain_dir, stem)?;
        self.names.encrypt_name(&plain_name, &self.dir_iv(cipher_dir))
    }

    #[instrument(level = "debug", skip(self))]
    pub fn getattr(&self, cipher_rel: &str) -> Result<FsAttr> {
        if cipher_rel == CONF_NAME {
            return self.ino_aware_attr(CONF_REVERSE_NAME);
        }
        let (dir, base) = Self::split_parent(cipher_rel);
        if base == DIRIV_NAME {
            return self.diriv_attr(dir);
        }
        if NameTransform::is_long_sidecar(base) {
            let stem = base.trim_end_matches(LONGNAME_SUFFIX);
            let encrypted = self.stem_to_encrypted(dir, stem)?;
            let mut attr = self.ino_aware_attr(&self.decrypt_path(dir)?)?;
            attr.kind = FileKind::File;
            attr.size = encrypted.len() as u64;
            attr.perm = 0o600;
            attr.nlink = 1;
            attr.ino = self.next_ino();
            return Ok(attr);
        }
        let plain_rel = self.decrypt_path(cipher_rel)?;
        let mut attr = self.ino_aware_attr(&plain_rel)?;
        if attr.kind == FileKind::File {
            attr.size = self.enc.cipher_size(attr.size);
        }
        Ok(attr)
    }

    pub fn access(&self, cipher_rel: &str, mode: u32) -> Result<()> {
        let (_, base) = Self::split_parent(cipher_rel);
        if base == DIRIV_NAME || NameTransform::is_long_sidecar(base) {
            return Ok(());
        }
        let plain_rel = if cipher_rel == CONF_NAME {
            CONF_REVERSE_NAME.to_string()
        } else {
            self.decrypt_path(cipher_rel)?
        };
        super::access(&self.plain_abs(&plain_rel), mode)?;
        Ok(())
    }

    // ---- directory listing ----

    #[instrument(level = "debug", skip(self))]
    pub fn readdir(&self, cipher_rel: &str) -> Result<Vec<DirEntry>> {
        let plain_rel = self.decrypt_path(cipher_rel)?;
        let iv = self.dir_iv(cipher_rel);
        let at_root = cipher_rel.is_empty();
        let mut out = Vec::new();
        for entry in fs::read_dir(self.plain_abs(&plain_rel))? {
            let entry = entry?;
            let Ok(plain_name) = entry.file_name().into_string() else {
                continue;
            };
            let kind = FileKind::from(entry.file_type()?);
            if at_root && plain_name == CONF_REVERSE_NAME {
                out.push(DirEntry {
                    name: CONF_NAME.to_string(),
                    kind,
                });
                continue;
            }
            // Names too long to encrypt are invisible in the view.
            let Ok(encrypted) = self.names.encrypt_name(&plain_name, &iv) else {
                continue;
            };
            if NameTransform::is_long_name(&encrypted) {
                let stem = NameTransform::hash_long_name(&encrypted);
                out.push(DirEntry {
                    name: format!("{stem}{LONGNAME_SUFFIX}"),
                    kind: FileKind::File,
                });
                out.push(DirEntry { name: stem, kind });
            } else {
                out.push(DirEntry {
                    name: encrypted,
                    kind,
                });
            }
        }
        out.push(DirEntry {
            name: DIRIV_NAME.to_string(),
            kind: FileKind::File,
        });
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    // ---- file content ----

    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, cipher_rel: &str) -> Result<ReverseHandle> {
        if cipher_rel == CONF_NAME {
            let file = File::open(self.backing.join(CONF_REVERSE_NAME))?;
            return Ok(ReverseHandle::Passthrough(file));
        }
        let (dir, base) = Self::split_parent(cipher_rel);
        if base == DIRIV_NAME {
            return Ok(ReverseHandle::Virtual(self.dir_iv(dir).to_vec()));
        }
        if NameTransform::is_long_sidecar(base) {
            let stem = base.trim_end_matches(LONGNAME_SUFFIX);
            let encrypted = self.stem_to_encrypted(dir, stem)?;
            return Ok(ReverseHandle::Virtual(encrypted.into_bytes()));
        }
        let plain_rel = self.decrypt_path(cipher_rel)?;
        let file = File::open(self.plain_abs(&plain_rel))?;
        let file_id = self.file_id(&plain_rel);
        Ok(ReverseHandle::Real(ReverseFile {
            file,
            plain_rel,
            file_id,
            core: self.core.clone(),
            enc: self.enc.clone(),
        }))
    }

    /// Encrypted target of a plaintext symlink, derived deterministically.
    pub fn readlink(&self, cipher_rel: &str) -> Result<String> {
        let plain_rel = self.decrypt_path(cipher_rel)?;
        let target = fs::read_link(self.plain_abs(&plain_rel))?;
        let target = target.to_str().ok_or_else(|| {
            CoreError::Backing(io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        let nonce = derive_block_nonce(&self.core, &plain_rel, 0);
        let block = self
            .enc
            .encrypt_block_with_nonce(target.as_bytes(), 0, None, &nonce)?;
        Ok(URL_SAFE_NO_PAD.encode(block))
    }

    pub fn statfs(&self, _cipher_rel: &str) -> Result<StatFs> {
        Ok(super::statvfs(&self.backing)?)
    }

    // ---- mutation is not meaningful here ----

    pub fn create(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(CoreError::Unsupported("reverse view is read-only"))
    }

    pub fn mkdir(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(CoreError::Unsupported("reverse view is read-only"))
    }

    pub fn unlink(&self, _path: &str) -> Result<()> {
        Err(CoreError::Unsupported("reverse view is read-only"))
    }

    pub fn rename(&self, _old: &str, _new: &str) -> Result<()> {
        Err(CoreError::Unsupported("reverse view is read-only"))
    }

    pub fn setxattr(&self, _path: &str, _name: &str, _value: &[u8]) -> Result<()> {
        Err(CoreError::Unsupported("reverse view is read-only"))
    }
}

/// An open file in the reverse view.
pub enum ReverseHandle {
    /// Synthesized content (directory IVs, long-name sidecars).
    Virtual(Vec<u8>),
    /// The config file, passed through unencrypted.
    Passthrough(File),
    /// A plaintext file presented as ciphertext.
    Real(ReverseFile),
}

impl ReverseHandle {
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        match self {
            ReverseHandle::Virtual(bytes) => {
                let start = min(offset as usize, bytes.len());
                let end = min(start + size, bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            ReverseHandle::Passthrough(file) => {
                let mut buf = vec![0u8; size];
                let n = read_full_at(file, &mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            }
            ReverseHandle::Real(file) => file.read_at(offset, size),
        }
    }
}

/// On-demand encryption of one plaintext file.
pub struct ReverseFile {
    file: File,
    plain_rel: String,
    file_id: [u8; FILE_ID_LEN],
    core: Arc<CryptoCore>,
    enc: Arc<ContentEnc>,
}

impl ReverseFile {
    /// Read a range of the synthesized ciphertext: header bytes first, then
    /// whole blocks encrypted with their derived nonces, trimmed to the
    /// requested window.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let plain_len = self.file.metadata()?.len();
        let cipher_len = self.enc.cipher_size(plain_len);
        if offset >= cipher_len {
            return Ok(Vec::new());
        }
        let end = min(offset + size as u64, cipher_len);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;

        if pos < HEADER_LEN {
            let header = FileHeader::from_id(self.file_id).to_bytes();
            let take = (min(end, HEADER_LEN) - pos) as usize;
            out.extend_from_slice(&header[pos as usize..pos as usize + take]);
            pos += take as u64;
        }

        let cbs = self.enc.cipher_block_size();
        while pos < end {
            let block = (pos - HEADER_LEN) / cbs;
            let block_start = HEADER_LEN + block * cbs;
            let mut plain = vec![0u8; BLOCK_SIZE as usize];
            let n = read_full_at(&self.file, &mut plain, block * BLOCK_SIZE)?;
            if n == 0 {
                break;
            }
            plain.truncate(n);

            let nonce = derive_block_nonce(&self.core, &self.plain_rel, block);
            let cipher =
                self.enc
                    .encrypt_block_with_nonce(&plain, block, Some(&self.file_id), &nonce)?;
            let skip = (pos - block_start) as usize;
            let take = min((end - pos) as usize, cipher.len() - skip);
            out.extend_from_slice(&cipher[skip..skip + take]);
            pos += take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_reverse(dir: &std::path::Path) -> ReverseFs {
        let master = MasterKey::from_bytes([8u8; 32]);
        ReverseFs::new(dir, &master, BackendKind::AesGcm256, KeySchedule::Hkdf).unwrap()
    }

    #[test]
    fn listing_contains_virtual_diriv() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello"), b"x").unwrap();
        let rfs = new_reverse(dir.path());
        let entries = rfs.readdir("").unwrap();
        assert!(entries.iter().any(|e| e.name == DIRIV_NAME));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn diriv_content_matches_derivation_and_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let rfs = new_reverse(dir.path());
        let handle = rfs.open(DIRIV_NAME).unwrap();
        let a = handle.read_at(0, 64).unwrap();
        let b = handle.read_at(0, 64).unwrap();
        assert_eq!(a.len(), DIRIV_LEN);
        assert_eq!(a, b);
        let attr = rfs.getattr(DIRIV_NAME).unwrap();
        assert_eq!(attr.size, DIRIV_LEN as u64);
        assert_eq!(attr.perm, 0o400);
    }

    #[test]
    fn stat_reports_cipher_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), vec![1u8; 4097]).unwrap();
        let rfs = new_reverse(dir.path());
        let entries = rfs.readdir("").unwrap();
        let name = entries
            .iter()
            .find(|e| e.name != DIRIV_NAME)
            .map(|e| e.name.clone())
            .unwrap();
        let attr = rfs.getattr(&name).unwrap();
        assert_eq!(attr.size, 18 + 4128 + 1 + 32);
    }

    #[test]
    fn mutation_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let rfs = new_reverse(dir.path());
        let err = rfs.mkdir("anything", 0o755).unwrap_err();
        assert_eq!(err.io_kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn hardlinks_share_a_synthesized_inode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"data").unwrap();
        fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();
        let rfs = new_reverse(dir.path());
        let iv = rfs.dir_iv("");
        let ca = rfs.names.encrypt_name("a", &iv).unwrap();
        let cb = rfs.names.encrypt_name("b", &iv).unwrap();
        assert_eq!(rfs.getattr(&ca).unwrap().ino, rfs.getattr(&cb).unwrap().ino);
    }
}
