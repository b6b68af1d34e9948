//! Path-level filesystem frontends.
//!
//! These are the operation surfaces a kernel-filesystem binding drives:
//! [`ForwardFs`] exposes plaintext semantics over a ciphertext backing tree,
//! [`ReverseFs`] synthesizes a deterministic ciphertext view over a
//! plaintext tree. Both speak relative paths with `""` as the root, like the
//! path-based FUSE APIs they sit beneath.

pub mod forward;
pub mod reverse;

pub use forward::{ForwardFs, ForwardOptions};
pub use reverse::{ReverseFs, ReverseHandle};

use std::ffi::CString;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Fifo,
    Socket,
    BlockDev,
    CharDev,
}

impl From<std::fs::FileType> for FileKind {
    fn from(t: std::fs::FileType) -> Self {
        if t.is_dir() {
            FileKind::Dir
        } else if t.is_symlink() {
            FileKind::Symlink
        } else if t.is_fifo() {
            FileKind::Fifo
        } else if t.is_socket() {
            FileKind::Socket
        } else if t.is_block_device() {
            FileKind::BlockDev
        } else if t.is_char_device() {
            FileKind::CharDev
        } else {
            FileKind::File
        }
    }
}

/// File attributes as presented by the encrypted view. Sizes of regular
/// files are already translated to the view's side of the mapping.
#[derive(Debug, Clone)]
pub struct FsAttr {
    pub ino: u64,
    pub dev: u64,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub perm: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Filesystem statistics, passed through from the backing filesystem.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u64,
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn attr_from_metadata(md: &Metadata) -> FsAttr {
    FsAttr {
        ino: md.ino(),
        dev: md.dev(),
        kind: FileKind::from(md.file_type()),
        size: md.len(),
        blocks: md.blocks(),
        perm: md.mode() & 0o7777,
        nlink: md.nlink(),
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev(),
        atime: unix_time(md.atime(), md.atime_nsec()),
        mtime: unix_time(md.mtime(), md.mtime_nsec()),
        ctime: unix_time(md.ctime(), md.ctime_nsec()),
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

pub(crate) fn access(path: &Path, mode: u32) -> io::Result<()> {
    let c = cstring(path)?;
    // SAFETY: `c` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::access(c.as_ptr(), mode as libc::c_int) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let c = cstring(path)?;
    let uid = uid.map_or(u32::MAX, |v| v) as libc::uid_t;
    let gid = gid.map_or(u32::MAX, |v| v) as libc::gid_t;
    // SAFETY: as above; -1 (u32::MAX) leaves the respective id unchanged.
    let rc = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn statvfs(path: &Path) -> io::Result<StatFs> {
    let c = cstring(path)?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `vfs` is a properly aligned out-parameter.
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(StatFs {
        block_size: vfs.f_bsize as u64,
        fragment_size: vfs.f_frsize as u64,
        blocks: vfs.f_blocks as u64,
        blocks_free: vfs.f_bfree as u64,
        blocks_avail: vfs.f_bavail as u64,
        files: vfs.f_files as u64,
        files_free: vfs.f_ffree as u64,
        name_max: vfs.f_namemax as u64,
    })
}
