//! Frame encoding and decoding.
//!
//! Legacy envelope (3.1 - 3.4):
//!
//! ```text
//! +--------+-------+-----+--------+---------+------------------+--------+
//! | 55AA   | seqno | cmd | length | payload | CRC32 | HMAC(32) | AA55   |
//! +--------+-------+-----+--------+---------+------------------+--------+
//!   4        4       4     4                  4 or 32            4
//! ```
//!
//! `length` covers payload, integrity block and suffix. The integrity block
//! is computed over header and payload.
//!
//! GCM envelope (3.5):
//!
//! ```text
//! +------+----------+-------+-----+--------+--------+------------+---------+------+
//! | 6699 | reserved | seqno | cmd | length | IV(12) | ciphertext | tag(16) | 9966 |
//! +------+----------+-------+-----+--------+--------+------------+---------+------+
//!   4      2          4       4     4
//! ```
//!
//! `length` covers IV, ciphertext and tag; the AAD is the header without
//! the prefix.

use super::message::{Envelope, MessagePayload, TuyaHeader, TuyaMessage};
use crate::core::{
    Command, DecodeError, GCM_IV_SIZE, GCM_TAG_SIZE, PREFIX_55AA_BIN, PREFIX_6699_BIN,
    ProtocolVersion, RETCODE_SIZE, RETCODE_THRESHOLD,
};
use crate::crypto::{AesCipher, LocalKey, hmac_sha256};

/// Size constants of both envelopes.
pub mod sizes {
    /// Legacy header: prefix + seqno + cmd + length.
    pub const HEADER_SIZE_55AA: usize = 16;
    /// GCM header: prefix + reserved + seqno + cmd + length.
    pub const HEADER_SIZE_6699: usize = 18;
    /// Suffix magic.
    pub const SUFFIX_SIZE: usize = 4;
    /// CRC32 trailer.
    pub const CRC_SIZE: usize = 4;
    /// HMAC-SHA256 trailer.
    pub const HMAC_SIZE: usize = 32;
    /// Smallest legal 6699 `length`: IV + empty ciphertext + tag.
    pub const MIN_LENGTH_6699: u32 = 12 + 16;
    /// Largest `length` accepted from the wire.
    pub const MAX_FRAME_LENGTH: u32 = 0x10_0000;
}

use sizes::*;

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// First four payload bytes as a return code, when below 256.
///
/// Payload data may itself start with a small big-endian number, so this is
/// a heuristic kept for wire compatibility.
fn sniff_retcode(payload: &[u8]) -> Option<u32> {
    if payload.len() < RETCODE_SIZE {
        return None;
    }
    let value = read_u32(payload, 0);
    (value < RETCODE_THRESHOLD).then_some(value)
}

fn with_retcode(payload: &[u8], retcode: Option<u32>) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + RETCODE_SIZE);
    if let Some(code) = retcode {
        body.extend_from_slice(&code.to_be_bytes());
    }
    body.extend_from_slice(payload);
    body
}

// =============================================================================
// HEADER
// =============================================================================

/// Parse a frame header, detecting the envelope from the prefix.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader, DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::TooShort {
            expected: 4,
            actual: data.len(),
        });
    }

    let prefix = read_u32(data, 0);
    let envelope = Envelope::from_prefix(prefix).ok_or(DecodeError::UnknownPrefix(prefix))?;
    let header_size = envelope.header_size();
    if data.len() < header_size {
        return Err(DecodeError::TooShort {
            expected: header_size,
            actual: data.len(),
        });
    }

    let (seqno, cmd, length) = match envelope {
        Envelope::Legacy => (read_u32(data, 4), read_u32(data, 8), read_u32(data, 12)),
        Envelope::Gcm => (read_u32(data, 6), read_u32(data, 10), read_u32(data, 14)),
    };

    let min_length = match envelope {
        Envelope::Legacy => (CRC_SIZE + SUFFIX_SIZE) as u32,
        Envelope::Gcm => MIN_LENGTH_6699,
    };
    if !(min_length..=MAX_FRAME_LENGTH).contains(&length) {
        return Err(DecodeError::LengthMismatch {
            declared: length,
            envelope: if envelope == Envelope::Legacy { "55AA" } else { "6699" },
        });
    }

    let total_length = match envelope {
        Envelope::Legacy => HEADER_SIZE_55AA + length as usize,
        Envelope::Gcm => HEADER_SIZE_6699 + length as usize + SUFFIX_SIZE,
    };

    Ok(TuyaHeader {
        envelope,
        seqno,
        cmd,
        length,
        total_length,
    })
}

// =============================================================================
// PACKING
// =============================================================================

/// Pack a message in the envelope its protocol version uses.
///
/// 3.5 uses the GCM envelope and needs a key; 3.4 uses the legacy envelope
/// with an HMAC trailer and needs a key; older versions use CRC32.
pub fn pack_message(
    msg: &MessagePayload,
    seqno: u32,
    version: ProtocolVersion,
    key: Option<&LocalKey>,
) -> Result<Vec<u8>, DecodeError> {
    if version.uses_gcm_envelope() {
        let key = key.ok_or(DecodeError::MissingKey)?;
        pack_message_6699(msg, seqno, key, None)
    } else if version.uses_hmac() {
        let key = key.ok_or(DecodeError::MissingKey)?;
        pack_message_55aa(msg, seqno, Some(key), None)
    } else {
        pack_message_55aa(msg, seqno, None, None)
    }
}

/// Pack a legacy frame, with an HMAC trailer when `hmac_key` is given.
pub fn pack_message_55aa(
    msg: &MessagePayload,
    seqno: u32,
    hmac_key: Option<&LocalKey>,
    retcode: Option<u32>,
) -> Result<Vec<u8>, DecodeError> {
    let body = with_retcode(&msg.payload, retcode);
    let integrity_size = if hmac_key.is_some() { HMAC_SIZE } else { CRC_SIZE };
    let length = (body.len() + integrity_size + SUFFIX_SIZE) as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE_55AA + length as usize);
    frame.extend_from_slice(&PREFIX_55AA_BIN);
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&msg.cmd.as_u32().to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);

    match hmac_key {
        Some(key) => {
            let mac = hmac_sha256(key, &frame)?;
            frame.extend_from_slice(&mac);
        }
        None => {
            let crc = crc32fast::hash(&frame);
            frame.extend_from_slice(&crc.to_be_bytes());
        }
    }
    frame.extend_from_slice(&Envelope::Legacy.suffix().to_be_bytes());
    Ok(frame)
}

/// Pack a GCM frame with a fresh random IV.
pub fn pack_message_6699(
    msg: &MessagePayload,
    seqno: u32,
    key: &LocalKey,
    retcode: Option<u32>,
) -> Result<Vec<u8>, DecodeError> {
    let body = with_retcode(&msg.payload, retcode);
    let length = (GCM_IV_SIZE + body.len() + GCM_TAG_SIZE) as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE_6699 + length as usize + SUFFIX_SIZE);
    frame.extend_from_slice(&PREFIX_6699_BIN);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&msg.cmd.as_u32().to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());

    let (iv, ciphertext, tag) =
        AesCipher::from_key(key).encrypt_gcm(&body, None, Some(&frame[4..HEADER_SIZE_6699]))?;

    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(&Envelope::Gcm.suffix().to_be_bytes());
    Ok(frame)
}

// =============================================================================
// UNPACKING
// =============================================================================

/// Unpack a frame, detecting the envelope from its prefix.
///
/// Legacy frames carry an HMAC trailer for protocol 3.4 (verified with
/// `key`) and CRC32 otherwise. GCM frames are decrypted with `key`.
/// Integrity failure is reported through `crc_good`, not as an error.
pub fn unpack_message(
    data: &[u8],
    version: ProtocolVersion,
    key: Option<&LocalKey>,
) -> Result<TuyaMessage, DecodeError> {
    let header = parse_header(data)?;
    match header.envelope {
        Envelope::Gcm => {
            let key = key.ok_or(DecodeError::MissingKey)?;
            unpack_message_6699(data, &header, key)
        }
        Envelope::Legacy if version.uses_hmac() => {
            let key = key.ok_or(DecodeError::MissingKey)?;
            unpack_message_55aa(data, &header, Some(key))
        }
        Envelope::Legacy => unpack_message_55aa(data, &header, None),
    }
}

fn ensure_complete(data: &[u8], header: &TuyaHeader) -> Result<(), DecodeError> {
    if data.len() < header.total_length {
        return Err(DecodeError::TooShort {
            expected: header.total_length,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Unpack a legacy frame.
pub fn unpack_message_55aa(
    data: &[u8],
    header: &TuyaHeader,
    hmac_key: Option<&LocalKey>,
) -> Result<TuyaMessage, DecodeError> {
    ensure_complete(data, header)?;

    let integrity_size = if hmac_key.is_some() { HMAC_SIZE } else { CRC_SIZE };
    let end_size = integrity_size + SUFFIX_SIZE;
    if (header.length as usize) < end_size {
        return Err(DecodeError::LengthMismatch {
            declared: header.length,
            envelope: "55AA",
        });
    }

    let payload_end = header.total_length - end_size;
    let payload = &data[HEADER_SIZE_55AA..payload_end];
    let crc = &data[payload_end..payload_end + integrity_size];
    let suffix = read_u32(data, header.total_length - SUFFIX_SIZE);

    let integrity_ok = match hmac_key {
        Some(key) => hmac_sha256(key, &data[..payload_end])?[..] == crc[..],
        None => crc32fast::hash(&data[..payload_end]) == read_u32(crc, 0),
    };
    let crc_good = integrity_ok && suffix == Envelope::Legacy.suffix();

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode: sniff_retcode(payload),
        payload: payload.to_vec(),
        crc: crc.to_vec(),
        crc_good,
        envelope: Envelope::Legacy,
        iv: None,
        tag: None,
    })
}

/// Unpack and decrypt a GCM frame.
///
/// The tag is checked with the header as AAD, then without AAD. If both
/// fail the message has `crc_good == false` and an empty payload.
pub fn unpack_message_6699(
    data: &[u8],
    header: &TuyaHeader,
    key: &LocalKey,
) -> Result<TuyaMessage, DecodeError> {
    ensure_complete(data, header)?;

    let body_end = HEADER_SIZE_6699 + header.length as usize;
    let mut iv = [0u8; GCM_IV_SIZE];
    iv.copy_from_slice(&data[HEADER_SIZE_6699..HEADER_SIZE_6699 + GCM_IV_SIZE]);
    let mut tag = [0u8; GCM_TAG_SIZE];
    tag.copy_from_slice(&data[body_end - GCM_TAG_SIZE..body_end]);
    let ciphertext = &data[HEADER_SIZE_6699 + GCM_IV_SIZE..body_end - GCM_TAG_SIZE];
    let aad = &data[4..HEADER_SIZE_6699];
    let suffix = read_u32(data, body_end);

    let (payload, crc_good) = match AesCipher::from_key(key).decrypt_gcm_with_fallback(
        ciphertext,
        &iv,
        &tag,
        Some(aad),
    ) {
        Ok(plain) => (plain, suffix == Envelope::Gcm.suffix()),
        Err(err) => {
            log::debug!("GCM frame seqno={} failed authentication: {err}", header.seqno);
            (Vec::new(), false)
        }
    };

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode: sniff_retcode(&payload),
        payload,
        crc: tag.to_vec(),
        crc_good,
        envelope: Envelope::Gcm,
        iv: Some(iv),
        tag: Some(tag),
    })
}

// =============================================================================
// STREAM SCANNING
// =============================================================================

fn find_prefix(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == PREFIX_55AA_BIN || w == PREFIX_6699_BIN)
}

/// Find the first complete frame in `buffer`.
///
/// Returns the frame (if one is complete) and the bytes left after it.
/// Bytes before the earliest prefix are dropped. A prefix whose header
/// declares an impossible length is skipped.
pub fn find_message_in_buffer(buffer: &[u8]) -> (Option<&[u8]>, &[u8]) {
    let mut rest = buffer;
    loop {
        let Some(start) = find_prefix(rest) else {
            // keep a possible partial prefix at the tail
            let keep = rest.len().min(3);
            return (None, &rest[rest.len() - keep..]);
        };
        if start > 0 {
            log::debug!("skipping {start} bytes before frame prefix");
            rest = &rest[start..];
        }

        match parse_header(rest) {
            Ok(header) if rest.len() >= header.total_length => {
                let (frame, remaining) = rest.split_at(header.total_length);
                return (Some(frame), remaining);
            }
            Ok(_) | Err(DecodeError::TooShort { .. }) => return (None, rest),
            Err(err) => {
                log::debug!("discarding bogus frame header: {err}");
                rest = &rest[1..];
            }
        }
    }
}

/// Extract every complete frame from `buffer`.
///
/// Returns the frames in order and the unconsumed tail.
pub fn extract_messages(buffer: &[u8]) -> (Vec<Vec<u8>>, &[u8]) {
    let mut frames = Vec::new();
    let mut rest = buffer;
    loop {
        let (frame, remaining) = find_message_in_buffer(rest);
        rest = remaining;
        match frame {
            Some(frame) => frames.push(frame.to_vec()),
            None => return (frames, rest),
        }
    }
}

/// Command of a raw frame, if its header parses and the code is known.
pub fn peek_command(frame: &[u8]) -> Option<Command> {
    parse_header(frame).ok().and_then(|h| Command::from_u32(h.cmd))
}
