//! Message data model: parsed headers, outgoing payloads and received
//! messages.

use std::fmt;

use crate::core::{
    Command, GCM_IV_SIZE, GCM_TAG_SIZE, PREFIX_55AA, PREFIX_6699, SUFFIX_55AA, SUFFIX_6699,
};

/// The two on-wire envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Envelope {
    /// `000055AA` ... `0000AA55`, CRC32 or HMAC-SHA256 trailer.
    Legacy,
    /// `00006699` ... `00009966`, AES-GCM body.
    Gcm,
}

impl Envelope {
    /// Detect the envelope from a frame's first four bytes.
    pub fn from_prefix(prefix: u32) -> Option<Self> {
        match prefix {
            PREFIX_55AA => Some(Envelope::Legacy),
            PREFIX_6699 => Some(Envelope::Gcm),
            _ => None,
        }
    }

    /// Prefix magic.
    pub fn prefix(self) -> u32 {
        match self {
            Envelope::Legacy => PREFIX_55AA,
            Envelope::Gcm => PREFIX_6699,
        }
    }

    /// Suffix magic.
    pub fn suffix(self) -> u32 {
        match self {
            Envelope::Legacy => SUFFIX_55AA,
            Envelope::Gcm => SUFFIX_6699,
        }
    }

    /// Header size in bytes.
    pub fn header_size(self) -> usize {
        match self {
            Envelope::Legacy => 16,
            Envelope::Gcm => 18,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Legacy => f.write_str("55AA"),
            Envelope::Gcm => f.write_str("6699"),
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuyaHeader {
    /// Envelope, from the prefix magic.
    pub envelope: Envelope,
    /// Sequence number.
    pub seqno: u32,
    /// Raw command code.
    pub cmd: u32,
    /// Declared body length.
    pub length: u32,
    /// Total frame length including header and suffix.
    pub total_length: usize,
}

impl TuyaHeader {
    /// Prefix magic of this frame.
    pub fn prefix(&self) -> u32 {
        self.envelope.prefix()
    }

    /// Whether this is a 6699 frame.
    pub fn is_6699_format(&self) -> bool {
        self.envelope == Envelope::Gcm
    }
}

/// A command ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    /// Command code.
    pub cmd: Command,
    /// Body bytes.
    pub payload: Vec<u8>,
}

impl MessagePayload {
    /// Pair a command with its body.
    pub fn new(cmd: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            payload: payload.into(),
        }
    }
}

/// A fully parsed received frame.
///
/// Integrity failure still yields a message; check [`crc_good`](Self::crc_good).
/// Straight out of the codec the payload still holds a recognized return
/// code; messages delivered by the dispatcher carry the opened JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuyaMessage {
    /// Sequence number.
    pub seqno: u32,
    /// Raw command code, possibly unknown to [`Command`].
    pub cmd: u32,
    /// Return code, when the first payload word looked like one (< 256).
    pub retcode: Option<u32>,
    /// Body bytes (GCM-decrypted for 6699 frames).
    pub payload: Vec<u8>,
    /// Integrity bytes: CRC32, HMAC-SHA256 or GCM tag.
    pub crc: Vec<u8>,
    /// Whether the integrity check passed.
    pub crc_good: bool,
    /// Envelope the frame arrived in.
    pub envelope: Envelope,
    /// GCM IV (6699 only).
    pub iv: Option<[u8; GCM_IV_SIZE]>,
    /// GCM tag (6699 only).
    pub tag: Option<[u8; GCM_TAG_SIZE]>,
}

impl TuyaMessage {
    /// Known command, if any.
    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.cmd)
    }

    /// Return code, 0 when absent.
    pub fn return_code(&self) -> u32 {
        self.retcode.unwrap_or(0)
    }

    /// Whether this arrived in a 6699 frame.
    pub fn is_6699_format(&self) -> bool {
        self.envelope == Envelope::Gcm
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> MessageSummary<'_> {
        MessageSummary(self)
    }
}

/// Log-friendly view of a [`TuyaMessage`].
pub struct MessageSummary<'a>(&'a TuyaMessage);

impl fmt::Display for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "seqno={} cmd=0x{:02x} retcode={} payload_len={} crc_good={} prefix={} has_iv={}",
            m.seqno,
            m.cmd,
            m.return_code(),
            m.payload.len(),
            m.crc_good,
            m.envelope,
            m.iv.is_some()
        )
    }
}
