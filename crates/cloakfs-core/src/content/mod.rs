//! Plaintext/ciphertext block translation.
//!
//! On-disk layout of a non-empty file: `HEADER(18) || block_0 || block_1 ...`
//! The header is a 2-byte big-endian version followed by the 16-byte random
//! file ID. Each plaintext block of up to [`BLOCK_SIZE`] bytes becomes
//! `nonce || ciphertext || tag`; the AEAD associated data binds the block to
//! its index and to the file ID, so blocks cannot be swapped between
//! positions or between files.

pub mod file;

pub use file::{CryptFile, OpenFileTable};

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::crypto::CryptoCore;
use crate::error::{CoreError, Result};

/// Plaintext block size.
pub const BLOCK_SIZE: u64 = 4096;
/// File header: version (2 bytes, big-endian) plus file ID.
pub const HEADER_LEN: u64 = 18;
pub const HEADER_VERSION: u16 = 2;
pub const FILE_ID_LEN: usize = 16;

/// Parsed 18-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// Mint a header with a fresh random file ID.
    pub fn random() -> Result<Self> {
        let mut file_id = [0u8; FILE_ID_LEN];
        crate::crypto::fill_random(&mut file_id)?;
        Ok(FileHeader { file_id })
    }

    pub fn from_id(file_id: [u8; FILE_ID_LEN]) -> Self {
        FileHeader { file_id }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        out[2..].copy_from_slice(&self.file_id);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_LEN as usize {
            return Err(CoreError::header(format!(
                "expected {HEADER_LEN}-byte header, got {}",
                buf.len()
            )));
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            return Err(CoreError::header(format!(
                "unsupported header version {version}"
            )));
        }
        let mut file_id = [0u8; FILE_ID_LEN];
        file_id.copy_from_slice(&buf[2..]);
        if file_id == [0u8; FILE_ID_LEN] {
            return Err(CoreError::header("all-zero file ID"));
        }
        Ok(FileHeader { file_id })
    }
}

/// Block-level encryption and the size arithmetic that goes with it.
pub struct ContentEnc {
    core: Arc<CryptoCore>,
    cipher_bs: u64,
}

impl ContentEnc {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        let cipher_bs = BLOCK_SIZE + core.block_overhead() as u64;
        ContentEnc { core, cipher_bs }
    }

    pub fn core(&self) -> &Arc<CryptoCore> {
        &self.core
    }

    pub fn plain_block_size(&self) -> u64 {
        BLOCK_SIZE
    }

    pub fn cipher_block_size(&self) -> u64 {
        self.cipher_bs
    }

    /// Ciphertext size of a `plain`-byte file. Zero stays zero: empty files
    /// carry no header.
    pub fn cipher_size(&self, plain: u64) -> u64 {
        if plain == 0 {
            return 0;
        }
        let overhead = self.core.block_overhead() as u64;
        let blocks = plain.div_ceil(BLOCK_SIZE);
        let last = plain - (blocks - 1) * BLOCK_SIZE;
        HEADER_LEN + (blocks - 1) * self.cipher_bs + last + overhead
    }

    /// Inverse of [`Self::cipher_size`]. Sizes that no plaintext length can
    /// produce are corruption.
    pub fn plain_size(&self, cipher: u64) -> Result<u64> {
        if cipher == 0 {
            return Ok(0);
        }
        if cipher < HEADER_LEN {
            return Err(CoreError::header(format!(
                "ciphertext of {cipher} bytes is smaller than the file header"
            )));
        }
        // A header with no blocks can be left behind by an interrupted
        // first write; it reads as an empty file.
        let body = cipher - HEADER_LEN;
        if body == 0 {
            return Ok(0);
        }
        let overhead = self.core.block_overhead() as u64;
        let full = body / self.cipher_bs;
        let rem = body % self.cipher_bs;
        if rem == 0 {
            Ok(full * BLOCK_SIZE)
        } else if rem > overhead {
            Ok(full * BLOCK_SIZE + rem - overhead)
        } else {
            Err(CoreError::header(format!(
                "ciphertext size {cipher} does not map to any plaintext size"
            )))
        }
    }

    /// Index of the block covering plaintext offset `off`.
    pub fn block_of(&self, off: u64) -> u64 {
        off / BLOCK_SIZE
    }

    /// Offset of block `block` in the ciphertext file.
    pub fn block_cipher_off(&self, block: u64) -> u64 {
        HEADER_LEN + block * self.cipher_bs
    }

    /// Associated data for a block: `u64_be(block) || file_id`. Entities
    /// without a file ID (symlink targets) bind the index only.
    fn ad(block: u64, file_id: Option<&[u8; FILE_ID_LEN]>) -> Vec<u8> {
        let mut ad = Vec::with_capacity(8 + FILE_ID_LEN);
        ad.extend_from_slice(&block.to_be_bytes());
        if let Some(id) = file_id {
            ad.extend_from_slice(id);
        }
        ad
    }

    /// Encrypt one plaintext block with a fresh random nonce.
    pub fn encrypt_block(
        &self,
        plain: &[u8],
        block: u64,
        file_id: Option<&[u8; FILE_ID_LEN]>,
    ) -> Result<Vec<u8>> {
        let nonce = self.core.random_nonce()?;
        self.encrypt_block_with_nonce(plain, block, file_id, &nonce)
    }

    /// Encrypt one plaintext block with a caller-chosen nonce. The reverse
    /// view uses this with HKDF-derived nonces to stay deterministic.
    pub fn encrypt_block_with_nonce(
        &self,
        plain: &[u8],
        block: u64,
        file_id: Option<&[u8; FILE_ID_LEN]>,
        nonce: &[u8],
    ) -> Result<Vec<u8>> {
        if plain.is_empty() {
            return Ok(Vec::new());
        }
        debug_assert_eq!(nonce.len(), self.core.nonce_len());
        let sealed = self.core.seal(nonce, &Self::ad(block, file_id), plain)?;
        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt and verify one stored block.
    pub fn decrypt_block(
        &self,
        block_bytes: &[u8],
        block: u64,
        file_id: Option<&[u8; FILE_ID_LEN]>,
    ) -> Result<Vec<u8>> {
        if block_bytes.is_empty() {
            return Ok(Vec::new());
        }
        let nonce_len = self.core.nonce_len();
        if block_bytes.len() <= self.core.block_overhead() {
            return Err(CoreError::auth(format!(
                "block {block} is {} bytes, shorter than nonce and tag",
                block_bytes.len()
            )));
        }
        let (nonce, rest) = block_bytes.split_at(nonce_len);
        if nonce.iter().all(|&b| b == 0) {
            return Err(CoreError::auth(format!("block {block} has an all-zero nonce")));
        }
        self.core.open(nonce, &Self::ad(block, file_id), rest)
    }

    /// Symlink targets are encrypted as a single block with no file ID and
    /// stored base64url-encoded in the backing link.
    pub fn encrypt_symlink_target(&self, target: &str) -> Result<String> {
        let block = self.encrypt_block(target.as_bytes(), 0, None)?;
        Ok(URL_SAFE_NO_PAD.encode(block))
    }

    pub fn decrypt_symlink_target(&self, stored: &str) -> Result<String> {
        let block = URL_SAFE_NO_PAD
            .decode(stored)
            .map_err(|_| CoreError::auth("symlink target is not base64url"))?;
        let plain = self.decrypt_block(&block, 0, None)?;
        String::from_utf8(plain).map_err(|_| CoreError::auth("symlink target is not UTF-8"))
    }
}
