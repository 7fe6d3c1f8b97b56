//! AES-128 in the two modes the protocol uses.
//!
//! ECB (with manual PKCS7) protects payloads up to protocol 3.4 and derives
//! 3.4 session keys. GCM (12-byte IV, detached 16-byte tag) protects the
//! 6699 envelope and derives 3.5 session keys.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce, Tag};
use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use super::keys::LocalKey;
use crate::core::{AES_KEY_SIZE, CryptoError, GCM_IV_SIZE, GCM_TAG_SIZE};

/// Output of [`AesCipher::encrypt_gcm`]: `(iv, ciphertext, tag)`.
pub type GcmSealed = ([u8; GCM_IV_SIZE], Vec<u8>, [u8; GCM_TAG_SIZE]);

/// AES-128 cipher bound to one key.
pub struct AesCipher {
    key: [u8; AES_KEY_SIZE],
}

impl AesCipher {
    /// Create a cipher; the key must be exactly 16 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AES_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { key })
    }

    /// Create a cipher from an already validated key.
    pub fn from_key(key: &LocalKey) -> Self {
        Self { key: *key.as_bytes() }
    }

    // =========================================================================
    // ECB
    // =========================================================================

    /// Encrypt with AES-ECB, optionally applying PKCS7 padding first.
    ///
    /// Without padding the input must already be block aligned.
    pub fn encrypt_ecb(&self, plaintext: &[u8], pad: bool) -> Result<Vec<u8>, CryptoError> {
        let mut buf = if pad {
            pkcs7_pad(plaintext)
        } else {
            plaintext.to_vec()
        };
        if buf.len() % AES_KEY_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(buf.len()));
        }

        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        for block in buf.chunks_exact_mut(AES_KEY_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(buf)
    }

    /// Decrypt with AES-ECB, optionally stripping PKCS7 padding.
    ///
    /// Invalid padding is left in place (see [`pkcs7_unpad`]).
    pub fn decrypt_ecb(&self, ciphertext: &[u8], unpad: bool) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % AES_KEY_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(ciphertext.len()));
        }

        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let mut buf = ciphertext.to_vec();
        for block in buf.chunks_exact_mut(AES_KEY_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }

        if unpad {
            let len = pkcs7_unpad(&buf).len();
            buf.truncate(len);
        }
        Ok(buf)
    }

    // =========================================================================
    // GCM
    // =========================================================================

    /// Encrypt with AES-GCM. A random IV is generated when none is supplied.
    pub fn encrypt_gcm(
        &self,
        plaintext: &[u8],
        iv: Option<&[u8]>,
        aad: Option<&[u8]>,
    ) -> Result<GcmSealed, CryptoError> {
        let iv = match iv {
            Some(iv) => check_len(iv, "IV", GCM_IV_SIZE)?,
            None => {
                let mut iv = [0u8; GCM_IV_SIZE];
                OsRng.fill_bytes(&mut iv);
                iv
            }
        };

        let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
        let mut buf = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), aad.unwrap_or_default(), &mut buf)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let mut tag_bytes = [0u8; GCM_TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok((iv, buf, tag_bytes))
    }

    /// Decrypt with AES-GCM, verifying the tag.
    pub fn decrypt_gcm(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        tag: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let iv: [u8; GCM_IV_SIZE] = check_len(iv, "IV", GCM_IV_SIZE)?;
        let tag: [u8; GCM_TAG_SIZE] = check_len(tag, "tag", GCM_TAG_SIZE)?;

        let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
        let mut buf = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                aad.unwrap_or_default(),
                &mut buf,
                Tag::from_slice(&tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(buf)
    }

    /// Decrypt with AES-GCM, retrying once without AAD.
    ///
    /// Some firmwares compute the tag without the header AAD. Only an
    /// authentication failure triggers the retry.
    pub fn decrypt_gcm_with_fallback(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        tag: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if aad.is_some() {
            match self.decrypt_gcm(ciphertext, iv, tag, aad) {
                Err(CryptoError::AuthenticationFailed) => {
                    log::debug!("GCM decrypt with AAD failed, trying without AAD");
                }
                other => return other,
            }
        }
        self.decrypt_gcm(ciphertext, iv, tag, None)
    }
}

impl Drop for AesCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn check_len<const N: usize>(
    value: &[u8],
    what: &'static str,
    expected: usize,
) -> Result<[u8; N], CryptoError> {
    value
        .try_into()
        .map_err(|_| CryptoError::InvalidParameterLength {
            what,
            expected,
            actual: value.len(),
        })
}

// =============================================================================
// PKCS7
// =============================================================================

/// Append PKCS7 padding to a 16-byte boundary (always adds 1..=16 bytes).
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = AES_KEY_SIZE - data.len() % AES_KEY_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS7 padding.
///
/// A pad byte of 0 or above 16, or trailing bytes that disagree with it,
/// leave the data unchanged: the result then means "padding not confirmed".
pub fn pkcs7_unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad = last as usize;
    if pad == 0 || pad > AES_KEY_SIZE || pad > data.len() {
        return data;
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if tail.iter().all(|b| *b == last) {
        body
    } else {
        data
    }
}
