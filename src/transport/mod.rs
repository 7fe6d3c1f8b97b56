//! Tuya local protocol - transport layer.
//!
//! - **Message model**: [`TuyaHeader`], [`MessagePayload`], [`TuyaMessage`]
//! - **Framing codec**: pack/unpack for both envelopes plus a stream scanner
//! - **Payload generation**: [`PayloadGenerator`] and per-version body sealing
//! - **Dispatcher**: [`MessageDispatcher`] correlating responses by sequence number
//! - **Connection**: [`TuyaConnection`] owning the socket, heartbeat and negotiation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Device API                   │
//! ├─────────────────────────────────────────┤
//! │   connection · dispatcher               │  ← async, feature "transport"
//! ├─────────────────────────────────────────┤
//! │   payload · frame · message             │  ← pure, always built
//! ├─────────────────────────────────────────┤
//! │   crypto (AES-ECB/GCM, HMAC, session)   │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod frame;
mod message;
mod payload;

#[cfg(feature = "transport")]
mod connection;
#[cfg(feature = "transport")]
mod dispatcher;

pub use error::*;
pub use frame::*;
pub use message::*;
pub use payload::*;

#[cfg(feature = "transport")]
pub use connection::{ConnectionPhase, TuyaConnection};
#[cfg(feature = "transport")]
pub use dispatcher::{MessageDispatcher, PendingResponse, WaitOutcome};
