//! Key material.
//!
//! [`LocalKey`] is the static 16-byte key the vendor cloud assigns to a
//! device. [`ActiveKey`] is the single mutable cell holding whichever key is
//! currently in force on a connection: the local key until a session key has
//! been negotiated, the session key afterwards.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use zeroize::Zeroize;

use crate::core::{AES_KEY_SIZE, CryptoError};

/// A 16-byte AES key.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalKey {
    key: [u8; AES_KEY_SIZE],
}

impl LocalKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; AES_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Create a key from a slice, which must be exactly 16 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AES_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { key })
    }

    /// Raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.key
    }
}

impl TryFrom<&str> for LocalKey {
    type Error = CryptoError;

    /// Local keys are usually distributed as 16 ASCII characters.
    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::from_slice(key.as_bytes())
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalKey(..)")
    }
}

impl Drop for LocalKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Shared handle to the key currently in force on a connection.
///
/// Clones share the same cell: the transport replaces the key once a session
/// key is derived and every reader observes the new key on its next
/// [`current`](Self::current) call.
#[derive(Clone)]
pub struct ActiveKey {
    local: LocalKey,
    current: Arc<RwLock<LocalKey>>,
}

impl ActiveKey {
    /// Start with the device's static key in force.
    pub fn new(local: LocalKey) -> Self {
        Self {
            current: Arc::new(RwLock::new(local.clone())),
            local,
        }
    }

    /// The static device key, used for negotiation frames.
    pub fn local(&self) -> &LocalKey {
        &self.local
    }

    /// Snapshot of the key currently in force.
    pub fn current(&self) -> LocalKey {
        self.current.read().clone()
    }

    /// Put a negotiated session key in force.
    pub fn install_session_key(&self, key: LocalKey) {
        *self.current.write() = key;
    }

    /// Fall back to the static key (connection reset).
    pub fn reset(&self) {
        *self.current.write() = self.local.clone();
    }

    /// Whether a session key is currently in force.
    pub fn has_session_key(&self) -> bool {
        *self.current.read() != self.local
    }
}

impl fmt::Debug for ActiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveKey")
            .field("session", &self.has_session_key())
            .finish()
    }
}
