//! Decryption of UDP discovery broadcasts.
//!
//! Broadcasts on port 6667 are encrypted with one of two fixed keys, each the
//! MD5 of a constant string. Firmwares disagree on both the key and the mode,
//! so the 3.5 decoder tries every known combination in turn.

use md5::{Digest, Md5};

use super::cipher::AesCipher;
use crate::core::{AES_KEY_SIZE, CryptoError, GCM_IV_SIZE, GCM_TAG_SIZE};

const UDP_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";
const UDP_KEY_35_SEED: &[u8] = b"A]c#n0r@xqhk,XuM";

/// Key for legacy (55AA) broadcasts.
pub fn udp_key() -> [u8; AES_KEY_SIZE] {
    md5_key(UDP_KEY_SEED)
}

/// Key for 3.5 (6699) broadcasts.
pub fn udp_key_35() -> [u8; AES_KEY_SIZE] {
    md5_key(UDP_KEY_35_SEED)
}

fn md5_key(seed: &[u8]) -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    key.copy_from_slice(&Md5::digest(seed));
    key
}

/// Decrypt a legacy broadcast (AES-ECB under [`udp_key`]).
pub fn decrypt_udp_broadcast(data: &[u8]) -> Result<String, CryptoError> {
    let plain = AesCipher::new(&udp_key())?.decrypt_ecb(data, true)?;
    String::from_utf8(plain).map_err(|_| CryptoError::BroadcastUndecryptable)
}

/// Decrypt a 3.5 broadcast.
///
/// Order: ECB with either key (accepted only if the text contains `{`), then
/// GCM without AAD with either key on `IV(12) + ciphertext + tag(16)`.
pub fn decrypt_udp_broadcast_35(data: &[u8]) -> Result<String, CryptoError> {
    let keys = [udp_key(), udp_key_35()];

    for key in &keys {
        let text = AesCipher::new(key)
            .and_then(|c| c.decrypt_ecb(data, true))
            .ok()
            .and_then(|plain| String::from_utf8(plain).ok());
        if let Some(text) = text.filter(|t| t.contains('{')) {
            return Ok(text);
        }
    }

    if data.len() > GCM_IV_SIZE + GCM_TAG_SIZE {
        let (iv, rest) = data.split_at(GCM_IV_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_SIZE);
        for key in &keys {
            let text = AesCipher::new(key)
                .and_then(|c| c.decrypt_gcm(ciphertext, iv, tag, None))
                .ok()
                .and_then(|plain| String::from_utf8(plain).ok());
            if let Some(text) = text {
                return Ok(text);
            }
        }
    }

    Err(CryptoError::BroadcastUndecryptable)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCE: &str = r#"{"ip":"192.168.1.20","gwId":"bf123","version":"3.5"}"#;

    #[test]
    fn test_fixed_keys() {
        assert_eq!(hex::encode(udp_key()), "6c1ec8e2bb9bb59ab50b0daf649b410a");
        assert_eq!(hex::encode(udp_key_35()), "1a886c2f88c759d5a74cb56f1edd4c51");
    }

    #[test]
    fn test_legacy_broadcast() {
        let ct = AesCipher::new(&udp_key())
            .unwrap()
            .encrypt_ecb(ANNOUNCE.as_bytes(), true)
            .unwrap();
        assert_eq!(decrypt_udp_broadcast(&ct).unwrap(), ANNOUNCE);
        assert_eq!(decrypt_udp_broadcast_35(&ct).unwrap(), ANNOUNCE);
    }

    #[test]
    fn test_35_broadcast_ecb_second_key() {
        let ct = AesCipher::new(&udp_key_35())
            .unwrap()
            .encrypt_ecb(ANNOUNCE.as_bytes(), true)
            .unwrap();
        assert_eq!(decrypt_udp_broadcast_35(&ct).unwrap(), ANNOUNCE);
    }

    #[test]
    fn test_35_broadcast_gcm() {
        let (iv, ct, tag) = AesCipher::new(&udp_key())
            .unwrap()
            .encrypt_gcm(ANNOUNCE.as_bytes(), None, None)
            .unwrap();
        let mut data = iv.to_vec();
        data.extend_from_slice(&ct);
        data.extend_from_slice(&tag);
        assert_eq!(decrypt_udp_broadcast_35(&data).unwrap(), ANNOUNCE);
    }

    #[test]
    fn test_35_broadcast_garbage() {
        assert_eq!(
            decrypt_udp_broadcast_35(&[0x42u8; 45]),
            Err(CryptoError::BroadcastUndecryptable)
        );
    }
}
