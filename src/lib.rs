//! # tuya-local
//!
//! Local-network protocol stack for Tuya smart-home devices.
//!
//! Devices speak a binary framing protocol over TCP port 6668 that exists in
//! four wire-incompatible revisions. This crate provides:
//!
//! - **Framing**: both envelopes (`55AA` with CRC32 or HMAC-SHA256, `6699` with AES-GCM)
//!   and a restartable stream scanner
//! - **Crypto**: AES-128 ECB/GCM, session key negotiation for 3.4/3.5, UDP broadcast keys
//! - **Payloads**: typed command templates per protocol version and device type
//! - **Transport**: an async connection with request/response correlation and heartbeat
//! - **Device API**: `status`, `set_dp`, `set_dps`, `detect_available_dps`, `reset`
//!
//! ## Feature Flags
//!
//! - `transport` (default): async dispatcher and connection (tokio)
//! - `client` (default): high-level device API
//!
//! Without features the crate still builds the pure codec and crypto layers.
//!
//! ## Modules
//!
//! - [`core`]: constants, protocol versions, config and error types
//! - [`crypto`]: ciphers, keys, session negotiation and UDP broadcast keys
//! - [`transport`]: message model, framing codec, payloads, dispatcher, connection
//! - [`client`]: device API (requires `client` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use tuya_local::prelude::*;
//!
//! let key = LocalKey::try_from("0123456789ABCDEF").unwrap();
//! let generator = PayloadGenerator::new("bf0123456789abcdef", ProtocolVersion::V33, DeviceType::Type0a);
//! let msg = generator.generate(Command::DpQuery, None, None);
//!
//! let frame = pack_message(&msg, 1, ProtocolVersion::V33, Some(&key)).unwrap();
//! let parsed = unpack_message(&frame, ProtocolVersion::V33, Some(&key)).unwrap();
//! assert!(parsed.crc_good);
//! assert_eq!(parsed.payload, msg.payload);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Crypto layer (always included)
pub mod crypto;

// Transport layer; the async parts are feature-gated inside
pub mod transport;

// Device API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::crypto::{AesCipher, LocalKey, SessionKeyNegotiator};

    pub use crate::transport::{
        MessagePayload, PayloadGenerator, TransportError, TransportResult, TuyaHeader,
        TuyaMessage, pack_message, parse_status_response, unpack_message,
    };

    #[cfg(feature = "transport")]
    pub use crate::transport::{ConnectionPhase, TuyaConnection};

    #[cfg(feature = "client")]
    pub use crate::client::{TuyaDevice, connect};
}

// Re-export commonly used items at crate root
pub use crate::core::{
    Command, DecodeError, DeviceConfig, DeviceType, Dps, ProtocolVersion, TuyaError,
    TuyaListener, TuyaResult,
};
pub use crate::crypto::LocalKey;

#[cfg(feature = "transport")]
pub use crate::transport::{ConnectionPhase, TuyaConnection};

#[cfg(feature = "client")]
pub use crate::client::{TuyaDevice, connect};
