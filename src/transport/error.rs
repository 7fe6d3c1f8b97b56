//! Transport layer error types.
//!
//! Errors on a single inbound frame never reach `exchange` callers: the
//! dispatcher logs and drops the frame and the caller times out.

use std::io;

use thiserror::Error;

use crate::core::{CryptoError, DecodeError, SessionKeyError};

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect failed at the OS level.
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        /// Target address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("timed out connecting to {addr}")]
    ConnectTimeout {
        /// Target address.
        addr: String,
    },

    /// I/O error on an established socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] DecodeError),

    /// Cipher failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Session key negotiation failed for good.
    #[error("session key negotiation failed: {0}")]
    Negotiation(#[from] SessionKeyError),

    /// No socket (never connected or already closed).
    #[error("not connected")]
    NotConnected,

    /// The connection was closed while the operation was in flight.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Errors after which the connection is unusable and a fresh connect
    /// is required.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::ConnectTimeout { .. }
                | TransportError::Io(_)
                | TransportError::NotConnected
                | TransportError::Closed
        )
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
