//! Session key negotiation for protocol 3.4 and 3.5.
//!
//! ```text
//! client                                   device
//!   | -- SESS_KEY_NEG_START(local nonce) -->  |
//!   | <-- SESS_KEY_NEG_RESP(remote nonce,     |
//!   |        HMAC(key, local nonce)) -------  |
//!   |    key = AES(local ^ remote)            |
//!   | -- SESS_KEY_NEG_FINISH(                 |
//!   |        HMAC(key, remote nonce)) ----->  |
//! ```
//!
//! 3.4 derives the key with AES-ECB, 3.5 with AES-GCM (IV = first 12 bytes
//! of the local nonce, tag discarded). A derived key whose first byte is zero
//! is rejected by devices, so negotiation restarts with a fresh nonce, at most
//! [`SESSION_KEY_MAX_RETRIES`] times in total.

use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;

use super::cipher::AesCipher;
use super::keys::LocalKey;
use crate::core::{
    AES_KEY_SIZE, CryptoError, GCM_IV_SIZE, HMAC_SIZE, LogContext, NONCE_SIZE, ProtocolVersion,
    RETCODE_SIZE, SESSION_KEY_MAX_RETRIES, SessionKeyError,
};

type HmacSha256 = Hmac<Sha256>;

/// Size of a negotiation response: remote nonce + HMAC.
pub const NEGOTIATION_RESPONSE_SIZE: usize = NONCE_SIZE + HMAC_SIZE;

/// Where a negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// No nonce generated yet.
    Idle,
    /// Start sent, waiting for the device response.
    AwaitingResponse,
    /// Response processed, key not derived yet.
    ResponseReceived,
    /// Session key derived; finish may be sent.
    KeyDerived,
    /// Retry budget exhausted.
    Failed,
}

/// Client side of the three-step negotiation.
pub struct SessionKeyNegotiator {
    device_key: LocalKey,
    version: ProtocolVersion,
    strict_hmac: bool,
    local_nonce: Option<[u8; NONCE_SIZE]>,
    remote_nonce: Option<[u8; NONCE_SIZE]>,
    session_key: Option<LocalKey>,
    attempts: u32,
    phase: NegotiationPhase,
    log: LogContext,
}

impl SessionKeyNegotiator {
    /// Create a negotiator for one connection attempt.
    ///
    /// With `strict_hmac` off, a wrong device HMAC is logged and ignored:
    /// several firmwares compute it incorrectly yet complete the handshake.
    pub fn new(
        device_key: LocalKey,
        version: ProtocolVersion,
        strict_hmac: bool,
        log: LogContext,
    ) -> Self {
        Self {
            device_key,
            version,
            strict_hmac,
            local_nonce: None,
            remote_nonce: None,
            session_key: None,
            attempts: 0,
            phase: NegotiationPhase::Idle,
            log,
        }
    }

    /// Whether this protocol version negotiates at all.
    pub fn is_negotiation_needed(&self) -> bool {
        self.version.needs_session_key()
    }

    /// Current phase.
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Derivation attempts that produced a rejected key.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The derived key, once step three succeeded.
    pub fn session_key(&self) -> Option<&LocalKey> {
        self.session_key.as_ref()
    }

    /// Step 1: generate a fresh local nonce, the `SESS_KEY_NEG_START` payload.
    pub fn start(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        self.start_with_nonce(nonce)
    }

    /// Step 1 with a caller-chosen nonce.
    pub fn start_with_nonce(&mut self, nonce: [u8; NONCE_SIZE]) -> [u8; NONCE_SIZE] {
        self.local_nonce = Some(nonce);
        self.remote_nonce = None;
        self.session_key = None;
        self.phase = NegotiationPhase::AwaitingResponse;
        crate::trace_device!(self.log, "session negotiation start, local_nonce={}", hex_prefix(&nonce));
        nonce
    }

    /// Step 2: take the remote nonce from the device response and check its HMAC.
    ///
    /// Returns whether the HMAC matched. A mismatch is only an error in
    /// strict mode.
    pub fn process_response(&mut self, payload: &[u8]) -> Result<bool, SessionKeyError> {
        let local = self
            .local_nonce
            .ok_or(SessionKeyError::NoncesNotSet("process negotiation response"))?;

        let payload = if payload.len() >= NEGOTIATION_RESPONSE_SIZE + RETCODE_SIZE
            && payload[..RETCODE_SIZE] == [0u8; RETCODE_SIZE]
        {
            crate::trace_device!(self.log, "stripping 4-byte retcode from negotiation response");
            &payload[RETCODE_SIZE..]
        } else {
            payload
        };

        if payload.len() < NEGOTIATION_RESPONSE_SIZE {
            return Err(SessionKeyError::PayloadTooShort(payload.len()));
        }

        let mut remote = [0u8; NONCE_SIZE];
        remote.copy_from_slice(&payload[..NONCE_SIZE]);
        self.remote_nonce = Some(remote);
        self.phase = NegotiationPhase::ResponseReceived;

        let received = &payload[NONCE_SIZE..NEGOTIATION_RESPONSE_SIZE];
        if verify_device_hmac(&self.device_key, &local, received)? {
            crate::trace_device!(self.log, "device HMAC verified");
            return Ok(true);
        }

        log::warn!(
            "{} device HMAC mismatch during session negotiation (received {})",
            self.log,
            hex_prefix(received)
        );
        if self.strict_hmac {
            return Err(SessionKeyError::HmacVerification);
        }
        Ok(false)
    }

    /// Step 3: derive the session key from both nonces.
    ///
    /// A zero leading byte yields [`SessionKeyError::SessionKeyInvalid`]
    /// (restart with [`restart`](Self::restart) and a new nonce) until the
    /// retry budget is spent, then [`SessionKeyError::RetriesExhausted`].
    pub fn derive_session_key(&mut self) -> Result<LocalKey, SessionKeyError> {
        let (Some(local), Some(remote)) = (self.local_nonce, self.remote_nonce) else {
            return Err(SessionKeyError::NoncesNotSet("derive session key"));
        };

        let key = derive_session_key(self.version, &self.device_key, &local, &remote)?;

        if key[0] == 0x00 {
            self.attempts += 1;
            if self.attempts >= SESSION_KEY_MAX_RETRIES {
                self.phase = NegotiationPhase::Failed;
                return Err(SessionKeyError::RetriesExhausted {
                    attempts: self.attempts,
                });
            }
            log::warn!(
                "{} session key starts with 0x00, retry {}/{}",
                self.log,
                self.attempts,
                SESSION_KEY_MAX_RETRIES
            );
            return Err(SessionKeyError::SessionKeyInvalid {
                attempt: self.attempts,
            });
        }

        let key = LocalKey::from_bytes(key);
        self.session_key = Some(key.clone());
        self.phase = NegotiationPhase::KeyDerived;
        crate::trace_device!(self.log, "session key derived for protocol {}", self.version);
        Ok(key)
    }

    /// Step 4: the `SESS_KEY_NEG_FINISH` payload.
    pub fn finish(&self) -> Result<[u8; HMAC_SIZE], SessionKeyError> {
        let remote = self
            .remote_nonce
            .ok_or(SessionKeyError::NoncesNotSet("create finish payload"))?;
        Ok(create_finish_hmac(&self.device_key, &remote)?)
    }

    /// Forget nonces and key but keep the attempt counter.
    pub fn restart(&mut self) {
        self.local_nonce = None;
        self.remote_nonce = None;
        self.session_key = None;
        if self.phase != NegotiationPhase::Failed {
            self.phase = NegotiationPhase::Idle;
        }
    }

    /// Full reset for a new connection.
    pub fn reset(&mut self) {
        self.restart();
        self.attempts = 0;
        self.phase = NegotiationPhase::Idle;
    }
}

/// Derive a session key without the zero-byte check.
pub fn derive_session_key(
    version: ProtocolVersion,
    device_key: &LocalKey,
    local_nonce: &[u8; NONCE_SIZE],
    remote_nonce: &[u8; NONCE_SIZE],
) -> Result<[u8; AES_KEY_SIZE], CryptoError> {
    let mut mixed = [0u8; NONCE_SIZE];
    for (out, (a, b)) in mixed.iter_mut().zip(local_nonce.iter().zip(remote_nonce)) {
        *out = a ^ b;
    }

    let cipher = AesCipher::from_key(device_key);
    let derived = if version.uses_gcm_envelope() {
        let (_, ciphertext, _) = cipher.encrypt_gcm(&mixed, Some(&local_nonce[..GCM_IV_SIZE]), None)?;
        ciphertext
    } else {
        cipher.encrypt_ecb(&mixed, false)?
    };

    let mut key = [0u8; AES_KEY_SIZE];
    key.copy_from_slice(&derived[..AES_KEY_SIZE]);
    Ok(key)
}

/// Check the device's HMAC-SHA256 over our local nonce, in constant time.
pub fn verify_device_hmac(
    device_key: &LocalKey,
    local_nonce: &[u8],
    received: &[u8],
) -> Result<bool, CryptoError> {
    let mut mac = new_mac(device_key)?;
    mac.update(local_nonce);
    Ok(mac.verify_slice(received).is_ok())
}

/// HMAC-SHA256 over the remote nonce, the finish payload.
pub fn create_finish_hmac(
    device_key: &LocalKey,
    remote_nonce: &[u8],
) -> Result<[u8; HMAC_SIZE], CryptoError> {
    hmac_sha256(device_key, remote_nonce)
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &LocalKey, data: &[u8]) -> Result<[u8; HMAC_SIZE], CryptoError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn new_mac(key: &LocalKey) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength(AES_KEY_SIZE))
}

fn hex_prefix(bytes: &[u8]) -> String {
    let mut out: String = bytes.iter().take(8).map(|b| format!("{b:02x}")).collect();
    if bytes.len() > 8 {
        out.push_str("...");
    }
    out
}
