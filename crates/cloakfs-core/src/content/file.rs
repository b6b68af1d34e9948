//! Encrypted file handles for the forward direction.
//!
//! A [`CryptFile`] wraps an open backing file and translates positioned
//! reads and writes across the block grid. Partial-block writes are
//! read-modify-write; each rewritten block goes to disk with a single
//! `pwrite` so a failed write never leaves a half-encrypted block visible.
//!
//! Per-inode state (the cached file ID and the lock that serializes
//! read-modify-write) lives in [`OpenFileTable`], keyed by backing
//! `(dev, ino)`, so several handles to one file cannot tear each other's
//! blocks.

use std::cmp::min;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace};

use crate::content::{ContentEnc, FileHeader, BLOCK_SIZE, FILE_ID_LEN, HEADER_LEN};
use crate::error::{CoreError, Result};
use crate::report::Reporter;

/// Shared state of one backing inode.
#[derive(Debug, Default)]
struct InodeState {
    /// Readers shared, writers exclusive; serializes read-modify-write.
    rw: RwLock<()>,
    /// File ID from the header, cached after the first access. `None`
    /// until the header exists.
    file_id: Mutex<Option<[u8; FILE_ID_LEN]>>,
}

/// Registry of per-inode state for all open encrypted files.
#[derive(Debug, Default)]
pub struct OpenFileTable {
    entries: DashMap<(u64, u64), Weak<InodeState>>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, dev: u64, ino: u64) -> Arc<InodeState> {
        // Dead entries pile up as files are closed; sweep once the map
        // grows past a small bound.
        if self.entries.len() > 256 {
            self.entries.retain(|_, weak| weak.strong_count() > 0);
        }
        match self.entries.entry((dev, ino)) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if let Some(alive) = slot.get().upgrade() {
                    alive
                } else {
                    let fresh = Arc::new(InodeState::default());
                    slot.insert(Arc::downgrade(&fresh));
                    fresh
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let fresh = Arc::new(InodeState::default());
                slot.insert(Arc::downgrade(&fresh));
                fresh
            }
        }
    }
}

/// An open encrypted file.
pub struct CryptFile {
    file: File,
    enc: Arc<ContentEnc>,
    state: Arc<InodeState>,
    path: PathBuf,
    reporter: Reporter,
    abort_on_auth_failure: bool,
}

impl CryptFile {
    /// Open an existing backing file.
    pub fn open(
        path: impl AsRef<Path>,
        write: bool,
        enc: Arc<ContentEnc>,
        table: &OpenFileTable,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(write).open(&path)?;
        Self::from_file(file, path, enc, table)
    }

    /// Create a new backing file. Fails if it already exists.
    pub fn create(
        path: impl AsRef<Path>,
        mode: u32,
        enc: Arc<ContentEnc>,
        table: &OpenFileTable,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)?;
        Self::from_file(file, path, enc, table)
    }

    fn from_file(
        file: File,
        path: PathBuf,
        enc: Arc<ContentEnc>,
        table: &OpenFileTable,
    ) -> Result<Self> {
        let meta = file.metadata()?;
        let state = table.register(meta.dev(), meta.ino());
        Ok(CryptFile {
            file,
            enc,
            state,
            path,
            reporter: Reporter::default(),
            abort_on_auth_failure: false,
        })
    }

    pub(crate) fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub(crate) fn with_abort_on_auth_failure(mut self, flag: bool) -> Self {
        self.abort_on_auth_failure = flag;
        self
    }

    /// Read up to `size` plaintext bytes at `offset`. Short reads happen at
    /// end of file only.
    #[instrument(level = "trace", skip(self), fields(path = %self.path.display()))]
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let _shared = self.state.rw.read();
        if size == 0 {
            return Ok(Vec::new());
        }
        let file_id = match self.load_file_id()? {
            Some(id) => id,
            // No header, no content.
            None => return Ok(Vec::new()),
        };

        let end = offset + size as u64;
        let first = self.enc.block_of(offset);
        let last = self.enc.block_of(end - 1);
        let mut plain = Vec::with_capacity(size + BLOCK_SIZE as usize);
        for block in first..=last {
            let cipher = self.read_cipher_block(block)?;
            if cipher.is_empty() {
                break;
            }
            let part = match self.enc.decrypt_block(&cipher, block, Some(&file_id)) {
                Ok(part) => part,
                Err(e) => {
                    self.auth_failed(block, &e);
                    if block == first {
                        return Err(e);
                    }
                    // Later blocks: hand back the verified prefix; the next
                    // read attempt starts at the bad block and fails there.
                    break;
                }
            };
            let complete = part.len() == BLOCK_SIZE as usize;
            plain.extend_from_slice(&part);
            if !complete {
                break;
            }
        }

        let skip = (offset - first * BLOCK_SIZE) as usize;
        if skip >= plain.len() {
            return Ok(Vec::new());
        }
        plain.drain(..skip);
        plain.truncate(size);
        Ok(plain)
    }

    /// Write `data` at plaintext `offset`, extending the file (zero-filled)
    /// if the offset lies past the current end.
    #[instrument(level = "trace", skip(self, data), fields(path = %self.path.display(), len = data.len()))]
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let _excl = self.state.rw.write();
        if data.is_empty() {
            return Ok(0);
        }
        let file_id = self.ensure_file_id()?;
        let current = self.plain_size_locked()?;
        if offset > current {
            self.zero_extend(current, offset, &file_id)?;
        }
        self.write_span(data, offset, &file_id)?;
        Ok(data.len())
    }

    /// Change the plaintext length, re-encrypting the final block when it
    /// becomes partial and appending encrypted zeros when growing.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let _excl = self.state.rw.write();
        let current = self.plain_size_locked()?;
        if new_size == current {
            return Ok(());
        }
        if new_size == 0 {
            self.file.set_len(0)?;
            // The next write mints a fresh file ID.
            *self.state.file_id.lock() = None;
            return Ok(());
        }
        let file_id = self.ensure_file_id()?;
        if new_size < current {
            let last_block = (new_size - 1) / BLOCK_SIZE;
            let keep = (new_size - last_block * BLOCK_SIZE) as usize;
            if keep != BLOCK_SIZE as usize {
                let mut plain = self.read_block_for_update(last_block, &file_id)?;
                plain.truncate(keep);
                self.write_block(last_block, &plain, &file_id)?;
            }
            self.file.set_len(self.enc.cipher_size(new_size))?;
        } else {
            self.zero_extend(current, new_size, &file_id)?;
        }
        Ok(())
    }

    /// Current plaintext size, from the backing file's length.
    pub fn plain_size(&self) -> Result<u64> {
        let _shared = self.state.rw.read();
        self.plain_size_locked()
    }

    pub fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    // ---- internals, called with the appropriate lock held ----

    fn plain_size_locked(&self) -> Result<u64> {
        let cipher_len = self.file.metadata()?.len();
        self.enc.plain_size(cipher_len).map_err(|e| {
            self.reporter
                .corrupt(&self.path, format!("ciphertext size {cipher_len}: {e}"));
            e
        })
    }

    /// Read the cached file ID, establishing it from the header on first
    /// use. `None` means the file is empty and has no header yet.
    fn load_file_id(&self) -> Result<Option<[u8; FILE_ID_LEN]>> {
        let mut cached = self.state.file_id.lock();
        if let Some(id) = *cached {
            return Ok(Some(id));
        }
        let mut buf = [0u8; HEADER_LEN as usize];
        let n = read_full_at(&self.file, &mut buf, 0)?;
        if n == 0 {
            return Ok(None);
        }
        let header = FileHeader::parse(&buf[..n]).map_err(|e| {
            self.reporter.corrupt(&self.path, e.to_string());
            e
        })?;
        *cached = Some(header.file_id);
        Ok(Some(header.file_id))
    }

    /// Get the file ID, writing a fresh header first if the file is empty.
    fn ensure_file_id(&self) -> Result<[u8; FILE_ID_LEN]> {
        if let Some(id) = self.load_file_id()? {
            return Ok(id);
        }
        let mut cached = self.state.file_id.lock();
        if let Some(id) = *cached {
            return Ok(id);
        }
        let header = FileHeader::random()?;
        self.file.write_all_at(&header.to_bytes(), 0)?;
        trace!(path = %self.path.display(), "wrote file header");
        *cached = Some(header.file_id);
        Ok(header.file_id)
    }

    /// Read one raw ciphertext block; empty at or past end of file.
    fn read_cipher_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.enc.cipher_block_size() as usize];
        let n = read_full_at(&self.file, &mut buf, self.enc.block_cipher_off(block))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Decrypt an existing block for read-modify-write; empty if absent.
    fn read_block_for_update(
        &self,
        block: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> Result<Vec<u8>> {
        let cipher = self.read_cipher_block(block)?;
        self.enc
            .decrypt_block(&cipher, block, Some(file_id))
            .map_err(|e| {
                self.auth_failed(block, &e);
                e
            })
    }

    /// Encrypt and store one block with a single `pwrite`.
    fn write_block(&self, block: u64, plain: &[u8], file_id: &[u8; FILE_ID_LEN]) -> Result<()> {
        let cipher = self.enc.encrypt_block(plain, block, Some(file_id))?;
        self.file
            .write_all_at(&cipher, self.enc.block_cipher_off(block))?;
        Ok(())
    }

    fn write_span(&self, data: &[u8], offset: u64, file_id: &[u8; FILE_ID_LEN]) -> Result<()> {
        let mut pos = 0usize;
        while pos < data.len() {
            let off = offset + pos as u64;
            let block = off / BLOCK_SIZE;
            let intra = (off % BLOCK_SIZE) as usize;
            let take = min(BLOCK_SIZE as usize - intra, data.len() - pos);
            if intra == 0 && take == BLOCK_SIZE as usize {
                self.write_block(block, &data[pos..pos + take], file_id)?;
            } else {
                let mut plain = self.read_block_for_update(block, file_id)?;
                if plain.len() < intra + take {
                    plain.resize(intra + take, 0);
                }
                plain[intra..intra + take].copy_from_slice(&data[pos..pos + take]);
                self.write_block(block, &plain, file_id)?;
            }
            pos += take;
        }
        Ok(())
    }

    /// Fill `[from, to)` with encrypted zeros, block by block.
    fn zero_extend(&self, from: u64, to: u64, file_id: &[u8; FILE_ID_LEN]) -> Result<()> {
        let zeros = [0u8; BLOCK_SIZE as usize];
        let mut pos = from;
        while pos < to {
            let intra = pos % BLOCK_SIZE;
            let take = min(BLOCK_SIZE - intra, to - pos) as usize;
            self.write_span(&zeros[..take], pos, file_id)?;
            pos += take as u64;
        }
        Ok(())
    }

    fn auth_failed(&self, block: u64, err: &CoreError) {
        self.reporter
            .corrupt(&self.path, format!("block {block}: {err}"));
        if self.abort_on_auth_failure {
            debug!("aborting on authentication failure as configured");
            std::process::abort();
        }
    }
}

/// `pread` until `buf` is full or end of file.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0usize;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}
