//! Cipher layer: AES-ECB/GCM, key handling, broadcast decryption and
//! session key negotiation.

mod cipher;
mod keys;
mod session;
mod udp;

pub use cipher::{AesCipher, GcmSealed, pkcs7_pad, pkcs7_unpad};
pub use keys::{ActiveKey, LocalKey};
pub use session::{
    NEGOTIATION_RESPONSE_SIZE, NegotiationPhase, SessionKeyNegotiator, create_finish_hmac,
    derive_session_key, hmac_sha256, verify_device_hmac,
};
pub use udp::{decrypt_udp_broadcast, decrypt_udp_broadcast_35, udp_key, udp_key_35};
