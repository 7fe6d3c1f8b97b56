//! Error types for the Tuya local protocol.

use thiserror::Error;

/// Errors raised while parsing a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes for the structure being parsed.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// First four bytes are neither `000055AA` nor `00006699`.
    #[error("unknown frame prefix: 0x{0:08x}")]
    UnknownPrefix(u32),

    /// Declared length does not fit the frame structure.
    #[error("invalid declared length {declared} for {envelope} frame")]
    LengthMismatch {
        /// Length field value.
        declared: u32,
        /// Envelope name.
        envelope: &'static str,
    },

    /// Packing a 6699 frame requires a key.
    #[error("a key is required to pack a 6699 frame")]
    MissingKey,

    /// Payload is not the JSON shape expected.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    /// Cipher failure while sealing or opening a frame.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors in the cipher layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AES-128 key was not 16 bytes.
    #[error("AES key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// IV or tag had the wrong length.
    #[error("GCM {what} must be {expected} bytes, got {actual}")]
    InvalidParameterLength {
        /// Parameter name.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// ECB input was not a multiple of the block size.
    #[error("ECB ciphertext length {0} is not a multiple of 16")]
    InvalidCiphertextLength(usize),

    /// GCM tag verification failed.
    #[error("GCM authentication failed")]
    AuthenticationFailed,

    /// No broadcast decryption strategy produced text.
    #[error("all UDP broadcast decryption methods failed")]
    BroadcastUndecryptable,
}

/// Errors from session key negotiation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionKeyError {
    /// Device HMAC over the local nonce did not match (strict mode only).
    #[error("device HMAC doesn't match expected value")]
    HmacVerification,

    /// Derived key starts with `0x00`; restart with a fresh nonce.
    #[error("session key starts with 0x00 (attempt {attempt}), retry needed")]
    SessionKeyInvalid {
        /// Attempts consumed so far.
        attempt: u32,
    },

    /// Every derivation attempt produced a `0x00`-leading key.
    #[error("session key starts with 0x00 after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts consumed.
        attempts: u32,
    },

    /// Response payload shorter than nonce + HMAC.
    #[error("negotiation response too short: {0} bytes (expected 48)")]
    PayloadTooShort(usize),

    /// A step was run before its inputs were available.
    #[error("cannot {0}: nonces not set")]
    NoncesNotSet(&'static str),

    /// Cipher failure while deriving.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SessionKeyError {
    /// Whether the caller should restart negotiation from step one.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionKeyError::SessionKeyInvalid { .. })
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum TuyaError {
    /// Frame decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Cipher error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Negotiation error.
    #[error("session key error: {0}")]
    SessionKey(#[from] SessionKeyError),

    /// Unrecognized protocol version string.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Unrecognized device type string.
    #[error("unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    /// Connection error.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Device answered with an error code.
    #[error("device error {code}: {}", device_message(.code))]
    Device {
        /// One of the `ERR_*` codes.
        code: u32,
    },
}

// =============================================================================
// DEVICE ERROR CODES
// =============================================================================

/// Invalid JSON response from device.
pub const ERR_JSON: u32 = 900;
/// Unable to connect.
pub const ERR_CONNECT: u32 = 901;
/// Timeout waiting for device.
pub const ERR_TIMEOUT: u32 = 902;
/// Value out of range.
pub const ERR_RANGE: u32 = 903;
/// Unexpected payload.
pub const ERR_PAYLOAD: u32 = 904;
/// Device unreachable.
pub const ERR_OFFLINE: u32 = 905;
/// Unknown device state.
pub const ERR_STATE: u32 = 906;
/// Function not supported.
pub const ERR_FUNCTION: u32 = 907;
/// "device22" detected.
pub const ERR_DEVTYPE: u32 = 908;
/// Missing cloud key and secret.
pub const ERR_CLOUDKEY: u32 = 909;
/// Invalid JSON from cloud.
pub const ERR_CLOUDRESP: u32 = 910;
/// Unable to get cloud token.
pub const ERR_CLOUDTOKEN: u32 = 911;
/// Missing function parameters.
pub const ERR_PARAMS: u32 = 912;
/// Error response from cloud.
pub const ERR_CLOUD: u32 = 913;

/// Human readable text for an `ERR_*` code.
pub fn error_message(code: u32) -> &'static str {
    match code {
        ERR_JSON => "Invalid JSON Response from Device",
        ERR_CONNECT => "Network Error: Unable to Connect",
        ERR_TIMEOUT => "Timeout Waiting for Device",
        ERR_RANGE => "Specified Value Out of Range",
        ERR_PAYLOAD => "Unexpected Payload from Device",
        ERR_OFFLINE => "Network Error: Device Unreachable",
        ERR_STATE => "Device in Unknown State",
        ERR_FUNCTION => "Function Not Supported by Device",
        ERR_DEVTYPE => "Device22 Detected: Retry Command",
        ERR_CLOUDKEY => "Missing Tuya Cloud Key and Secret",
        ERR_CLOUDRESP => "Invalid JSON Response from Cloud",
        ERR_CLOUDTOKEN => "Unable to Get Cloud Token",
        ERR_PARAMS => "Missing Function Parameters",
        ERR_CLOUD => "Error Response from Tuya Cloud",
        _ => "Unknown Error",
    }
}

fn device_message(code: &u32) -> &'static str {
    error_message(*code)
}

/// Result alias for this crate.
pub type TuyaResult<T> = Result<T, TuyaError>;
