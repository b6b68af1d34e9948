//! Forward direction: plaintext operations over a ciphertext backing tree.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use filetime::FileTime;
use tracing::{instrument, warn};

use crate::content::{ContentEnc, CryptFile, OpenFileTable};
use crate::crypto::{BackendKind, CryptoCore, KeySchedule, MasterKey};
use crate::error::{CoreError, Result};
use crate::fs::{attr_from_metadata, DirEntry, FileKind, FsAttr, StatFs};
use crate::names::{diriv, DirIvCache, NameTransform, CONF_NAME, DIRIV_NAME};
use crate::report::{CorruptionSink, Reporter};
use crate::xattr::XattrCodec;

/// Mount-time configuration of a forward view.
pub struct ForwardOptions {
    pub backend: BackendKind,
    pub key_schedule: KeySchedule,
    /// Compatibility behavior: abort the process on any authentication
    /// failure instead of failing the single operation.
    pub abort_on_auth_failure: bool,
    pub corruption_sink: Option<CorruptionSink>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        ForwardOptions {
            backend: BackendKind::AesGcm256,
            key_schedule: KeySchedule::Hkdf,
            abort_on_auth_failure: false,
            corruption_sink: None,
        }
    }
}

/// Plaintext view of a ciphertext backing directory.
///
/// Paths are relative to the view root; `""` is the root itself. Every
/// operation resolves the plaintext path component-by-component: look up the
/// parent's directory IV, encrypt the component, apply the long-name
/// protocol, then run the real operation against the backing filesystem.
pub struct ForwardFs {
    backing: PathBuf,
    enc: Arc<ContentEnc>,
    names: Arc<NameTransform>,
    xattrs: XattrCodec,
    dirivs: DirIvCache,
    files: OpenFileTable,
    reporter: Reporter,
    abort_on_auth_failure: bool,
}

impl ForwardFs {
    pub fn new(
        backing: impl Into<PathBuf>,
        master: &MasterKey,
        options: ForwardOptions,
    ) -> Result<Self> {
        let backing = backing.into();
        if !fs::metadata(&backing)?.is_dir() {
            return Err(CoreError::Backing(io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }
        let core = Arc::new(CryptoCore::new(
            master,
            options.backend,
            options.key_schedule,
        ));
        // A fresh backing tree gets its root IV here; existing trees keep
        // theirs.
        if !backing.join(DIRIV_NAME).exists() {
            diriv::create(&backing)?;
        }
        Ok(ForwardFs {
            backing,
            enc: Arc::new(ContentEnc::new(core.clone())),
            names: Arc::new(NameTransform::new(core.clone())),
            xattrs: XattrCodec::new(core),
            dirivs: DirIvCache::new(),
            files: OpenFileTable::new(),
            reporter: Reporter::new(options.corruption_sink),
            abort_on_auth_failure: options.abort_on_auth_failure,
        })
    }

    // ---- path translation ----

    fn components(path: &str) -> Result<Vec<&str>> {
        let mut out = Vec::new();
        for comp in path.split('/') {
            if comp.is_empty() || comp == "." {
                continue;
            }
            if comp == ".." {
                return Err(CoreError::Backing(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )));
            }
            out.push(comp);
        }
        Ok(out)
    }

    /// On-disk name of `plain` inside backing directory `dir`, for lookups.
    fn lookup_name(&self, dir: &Path, plain: &str) -> Result<String> {
        let iv = self.dirivs.get(dir)?;
        let encrypted = self.names.encrypt_name(plain, &iv)?;
        if NameTransform::is_long_name(&encrypted) {
            Ok(NameTransform::hash_long_name(&encrypted))
        } else {
            Ok(encrypted)
        }
    }

    /// On-disk name of `plain` for entry creation; publishes the sidecar
    /// when the encrypted name overflows. Returns the name and whether a
    /// sidecar was written (for cleanup on failure).
    fn creation_name(&self, dir: &Path, plain: &str) -> Result<(String, bool)> {
        let iv = self.dirivs.get(dir)?;
        let encrypted = self.names.encrypt_name(plain, &iv)?;
        if NameTransform::is_long_name(&encrypted) {
            let stem = NameTransform::hash_long_name(&encrypted);
            self.names.write_long_name(dir, &stem, &encrypted)?;
            Ok((stem, true))
        } else {
            Ok((encrypted, false))
        }
    }

    /// Backing path of a plaintext path.
    fn resolve(&self, plain: &str) -> Result<PathBuf> {
        let mut p = self.backing.clone();
        for comp in Self::components(plain)? {
            let name = self.lookup_name(&p, comp)?;
            p.push(name);
        }
        Ok(p)
    }

    /// Backing path of the parent directory plus the final plaintext
    /// component.
    fn resolve_parent<'a>(&self, plain: &'a str) -> Result<(PathBuf, &'a str)> {
        let comps = Self::components(plain)?;
        let (last, parents) = comps
            .split_last()
            .ok_or_else(|| CoreError::Backing(io::Error::from_raw_os_error(libc::EINVAL)))?;
        let mut p = self.backing.clone();
        for comp in parents {
            let name = self.lookup_name(&p, comp)?;
            p.push(name);
        }
        Ok((p, last))
    }

    fn drop_sidecar_quietly(&self, dir: &Path, stem: &str) {
        if let Err(e) = self.names.remove_long_name(dir, stem) {
            self.reporter
                .corrupt(dir.join(stem), format!("dangling long-name sidecar: {e}"));
        }
    }

    // ---- metadata operations ----

    #[instrument(level = "debug", skip(self))]
    pub fn getattr(&self, path: &str) -> Result<FsAttr> {
        let backing = self.resolve(path)?;
        let md = fs::symlink_metadata(&backing)?;
        let mut attr = attr_from_metadata(&md);
        if attr.kind == FileKind::File {
            attr.size = self.enc.plain_size(attr.size).map_err(|e| {
                self.reporter
                    .corrupt(&backing, format!("stat size: {e}"));
                e
            })?;
        }
        Ok(attr)
    }

    pub fn access(&self, path: &str, mode: u32) -> Result<()> {
        let backing = self.resolve(path)?;
        super::access(&backing, mode)?;
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let backing = self.resolve(path)?;
        fs::set_permissions(&backing, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let backing = self.resolve(path)?;
        super::lchown(&backing, uid, gid)?;
        Ok(())
    }

    pub fn utimens(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        let backing = self.resolve(path)?;
        filetime::set_symlink_file_times(
            &backing,
            FileTime::from_system_time(atime),
            FileTime::from_system_time(mtime),
        )?;
        Ok(())
    }

    pub fn statfs(&self, path: &str) -> Result<StatFs> {
        let backing = self.resolve(path)?;
        Ok(super::statvfs(&backing)?)
    }

    // ---- file operations ----

    /// Open an existing file. The returned handle does all content
    /// translation; reads and writes on it are positioned.
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, path: &str, write: bool) -> Result<CryptFile> {
        let backing = self.resolve(path)?;
        Ok(
            CryptFile::open(backing, write, self.enc.clone(), &self.files)?
                .with_reporter(self.reporter.clone())
                .with_abort_on_auth_failure(self.abort_on_auth_failure),
        )
    }

    /// Create a new regular file.
    #[instrument(level = "debug", skip(self))]
    pub fn create(&self, path: &str, mode: u32) -> Result<CryptFile> {
        let (parent, name) = self.resolve_parent(path)?;
        let (cname, sidecar) = self.creation_name(&parent, name)?;
        match CryptFile::create(parent.join(&cname), mode, self.enc.clone(), &self.files) {
            Ok(file) => Ok(file
                .with_reporter(self.reporter.clone())
                .with_abort_on_auth_failure(self.abort_on_auth_failure)),
            Err(e) => {
                if sidecar {
                    self.drop_sidecar_quietly(&parent, &cname);
                }
                Err(e)
            }
        }
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let cname = self.lookup_name(&parent, name)?;
        fs::remove_file(parent.join(&cname))?;
        if NameTransform::is_long_stem(&cname) {
            self.drop_sidecar_quietly(&parent, &cname);
        }
        Ok(())
    }

    // ---- directories ----

    #[instrument(level = "debug", skip(self))]
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let (cname, sidecar) = self.creation_name(&parent, name)?;
        let dir = parent.join(&cname);
        // The directory is born inaccessible, gets its IV, and only then
        // its final permissions.
        let populate = || -> Result<()> {
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700);
            builder.create(&dir)?;
            diriv::create(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o7777))?;
            Ok(())
        };
        if let Err(e) = populate() {
            let _ = fs::remove_dir_all(&dir);
            if sidecar {
                self.drop_sidecar_quietly(&parent, &cname);
            }
            return Err(e);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let cname = self.lookup_name(&parent, name)?;
        let dir = parent.join(&cname);

        let mut has_iv = false;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name() == OsStr::new(DIRIV_NAME) {
                has_iv = true;
            } else {
                return Err(CoreError::Backing(io::Error::from_raw_os_error(
                    libc::ENOTEMPTY,
                )));
            }
        }
        // The IV goes last: remember its bytes so it can be restored if the
        // directory gains entries between our check and the rmdir.
        let iv_bytes = if has_iv {
            let bytes = fs::read(dir.join(DIRIV_NAME)).ok();
            fs::remove_file(dir.join(DIRIV_NAME))?;
            bytes
        } else {
            None
        };
        match fs::remove_dir(&dir) {
            Ok(()) => {
                self.dirivs.invalidate(&dir);
                if NameTransform::is_long_stem(&cname) {
                    self.drop_sidecar_quietly(&parent, &cname);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(bytes) = iv_bytes {
                    if bytes.len() == diriv::DIRIV_LEN {
                        let mut iv = [0u8; diriv::DIRIV_LEN];
                        iv.copy_from_slice(&bytes);
                        let _ = diriv::write(&dir, &iv);
                    }
                }
                Err(e.into())
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(path)?;
        let iv = self.dirivs.get(&dir)?;
        let at_root = dir == self.backing;
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let cname = match entry.file_name().into_string() {
                Ok(s) => s,
                Err(name) => {
                    self.reporter
                        .corrupt(entry.path(), format!("non-UTF-8 entry {name:?}"));
                    continue;
                }
            };
            if cname == DIRIV_NAME || NameTransform::is_long_sidecar(&cname) {
                continue;
            }
            if at_root && cname == CONF_NAME {
                continue;
            }
            // Temp files from atomic publishes are dot-prefixed.
            if cname.starts_with('.') {
                continue;
            }
            let kind = FileKind::from(entry.file_type()?);
            let full = if NameTransform::is_long_stem(&cname) {
                match self.names.read_long_name(&dir, &cname) {
                    Ok(full) => full,
                    Err(e) => {
                        self.reporter.corrupt(entry.path(), e.to_string());
                        continue;
                    }
                }
            } else {
                cname
            };
            match self.names.decrypt_name(&full, &iv) {
                Ok(plain) => out.push(DirEntry { name: plain, kind }),
                Err(e) => self.reporter.corrupt(entry.path(), e.to_string()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    // ---- links ----

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old_parent, old_name) = self.resolve_parent(old)?;
        let old_c = self.lookup_name(&old_parent, old_name)?;
        let (new_parent, new_name) = self.resolve_parent(new)?;
        let (new_c, new_sidecar) = self.creation_name(&new_parent, new_name)?;
        let old_backing = old_parent.join(&old_c);
        match fs::rename(&old_backing, new_parent.join(&new_c)) {
            Ok(()) => {
                if NameTransform::is_long_stem(&old_c) {
                    self.drop_sidecar_quietly(&old_parent, &old_c);
                }
                self.dirivs.invalidate(&old_backing);
                Ok(())
            }
            Err(e) => {
                if new_sidecar {
                    self.drop_sidecar_quietly(&new_parent, &new_c);
                }
                Err(e.into())
            }
        }
    }

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let old_backing = self.resolve(old)?;
        let (new_parent, new_name) = self.resolve_parent(new)?;
        let (new_c, new_sidecar) = self.creation_name(&new_parent, new_name)?;
        match fs::hard_link(&old_backing, new_parent.join(&new_c)) {
            Ok(()) => Ok(()),
            Err(e) => {
                if new_sidecar {
                    self.drop_sidecar_quietly(&new_parent, &new_c);
                }
                Err(e.into())
            }
        }
    }

    pub fn symlink(&self, target: &str, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let (cname, sidecar) = self.creation_name(&parent, name)?;
        let ctarget = self.enc.encrypt_symlink_target(target)?;
        match std::os::unix::fs::symlink(&ctarget, parent.join(&cname)) {
            Ok(()) => Ok(()),
            Err(e) => {
                if sidecar {
                    self.drop_sidecar_quietly(&parent, &cname);
                }
                Err(e.into())
            }
        }
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let backing = self.resolve(path)?;
        let raw = fs::read_link(&backing)?;
        let stored = raw.to_str().ok_or_else(|| {
            self.reporter
                .corrupt(&backing, "symlink target is not UTF-8");
            CoreError::auth("symlink target is not UTF-8")
        })?;
        self.enc.decrypt_symlink_target(stored).map_err(|e| {
            self.reporter.corrupt(&backing, e.to_string());
            self.maybe_abort(&e);
            e
        })
    }

    // ---- extended attributes ----

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        let backing = self.resolve(path)?;
        let cname = self.xattrs.encrypt_name(name)?;
        let cvalue = self.xattrs.encrypt_value(value)?;
        xattr::set(&backing, &cname, &cvalue)?;
        Ok(())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let backing = self.resolve(path)?;
        let cname = self.xattrs.encrypt_name(name)?;
        let stored = xattr::get(&backing, &cname)?.ok_or_else(|| {
            CoreError::Backing(io::Error::from_raw_os_error(libc::ENODATA))
        })?;
        self.xattrs.decrypt_value(&stored).map_err(|e| {
            self.reporter
                .corrupt(&backing, format!("xattr {name}: {e}"));
            self.maybe_abort(&e);
            e
        })
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        let backing = self.resolve(path)?;
        let cname = self.xattrs.encrypt_name(name)?;
        xattr::remove(&backing, &cname)?;
        Ok(())
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let backing = self.resolve(path)?;
        let mut out = Vec::new();
        for stored in xattr::list(&backing)? {
            let Some(stored) = stored.to_str() else {
                continue;
            };
            if !XattrCodec::is_encrypted_name(stored) {
                // Attributes we did not write are invisible in this view.
                continue;
            }
            match self.xattrs.decrypt_name(stored) {
                Ok(plain) => out.push(plain),
                Err(e) => {
                    self.reporter
                        .corrupt(&backing, format!("xattr name {stored}: {e}"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn maybe_abort(&self, err: &CoreError) {
        if self.abort_on_auth_failure && matches!(err, CoreError::AuthFail { .. }) {
            warn!("aborting on authentication failure as configured");
            std::process::abort();
        }
    }
}
