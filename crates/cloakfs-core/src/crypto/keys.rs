//! Master key handling.

use secrecy::{ExposeSecret, Secret};

use crate::error::Result;

pub const MASTER_KEY_LEN: usize = 32;

/// The 256-bit master key, established outside this crate (password
/// unsealing, key files) and passed in once at mount time.
///
/// The key is held behind [`Secret`] so it cannot leak through `Debug`
/// output and is zeroized when dropped.
pub struct MasterKey(Secret<[u8; MASTER_KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        MasterKey(Secret::new(bytes))
    }

    /// Generate a fresh random master key. Fails closed if the system
    /// entropy source is unavailable.
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        super::fill_random(&mut bytes)?;
        Ok(MasterKey::from_bytes(bytes))
    }

    /// Scoped access to the raw key material. The reference cannot escape
    /// the callback.
    pub fn with_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; MASTER_KEY_LEN]) -> R,
    {
        f(self.0.expose_secret())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_access_sees_the_key() {
        let key = MasterKey::from_bytes([7u8; 32]);
        key.with_key(|k| assert_eq!(k, &[7u8; 32]));
    }

    #[test]
    fn random_keys_differ() {
        let a = MasterKey::random().unwrap();
        let b = MasterKey::random().unwrap();
        let equal = a.with_key(|ka| b.with_key(|kb| ka == kb));
        assert!(!equal);
    }
}
