//! Wire-level constants of the Tuya local protocol.
//!
//! These values are fixed by device firmware and MUST NOT be changed.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

// =============================================================================
// COMMAND CODES
// =============================================================================

/// Command codes carried in the `cmd` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// AP 3.0 network configuration.
    ApConfig = 0x01,
    /// Work mode (discarded by modern firmware).
    Active = 0x02,
    /// Session key negotiation, client nonce.
    SessKeyNegStart = 0x03,
    /// Session key negotiation, device nonce + HMAC.
    SessKeyNegResp = 0x04,
    /// Session key negotiation, client HMAC.
    SessKeyNegFinish = 0x05,
    /// Unbind device.
    Unbind = 0x06,
    /// Set datapoints.
    Control = 0x07,
    /// Unsolicited status report.
    Status = 0x08,
    /// Keep-alive.
    HeartBeat = 0x09,
    /// Query datapoints.
    DpQuery = 0x0a,
    /// SSID query.
    QueryWifi = 0x0b,
    /// User bind request.
    TokenBind = 0x0c,
    /// Set datapoints (3.4+ and "0d" devices).
    ControlNew = 0x0d,
    /// Enable wifi / add sub-device.
    EnableWifi = 0x0e,
    /// Wifi configuration info.
    WifiInfo = 0x0f,
    /// Query datapoints (3.4+).
    DpQueryNew = 0x10,
    /// Execute a scene.
    SceneExecute = 0x11,
    /// Ask the device to refresh the given datapoints.
    UpdateDps = 0x12,
    /// Encrypted UDP discovery.
    UdpNew = 0x13,
    /// AP configuration, v4.0.
    ApConfigNew = 0x14,
    /// LPv3.4 broadcast.
    BoardcastLpv34 = 0x23,
    /// LAN extended stream.
    LanExtStream = 0x40,
}

impl Command {
    /// Every known command, in code order.
    pub const ALL: [Command; 22] = [
        Command::ApConfig,
        Command::Active,
        Command::SessKeyNegStart,
        Command::SessKeyNegResp,
        Command::SessKeyNegFinish,
        Command::Unbind,
        Command::Control,
        Command::Status,
        Command::HeartBeat,
        Command::DpQuery,
        Command::QueryWifi,
        Command::TokenBind,
        Command::ControlNew,
        Command::EnableWifi,
        Command::WifiInfo,
        Command::DpQueryNew,
        Command::SceneExecute,
        Command::UpdateDps,
        Command::UdpNew,
        Command::ApConfigNew,
        Command::BoardcastLpv34,
        Command::LanExtStream,
    ];

    /// Look up a command by its wire code.
    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_u32() == code)
    }

    /// Wire code of this command.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Commands sent without the 15-byte protocol version header.
    pub fn is_header_exempt(self) -> bool {
        NO_PROTOCOL_HEADER_CMDS.contains(&self)
    }

    /// Session key negotiation commands.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            Command::SessKeyNegStart | Command::SessKeyNegResp | Command::SessKeyNegFinish
        )
    }

    /// Commands whose unsolicited frames are forwarded as status updates.
    pub fn carries_status(self) -> bool {
        matches!(
            self,
            Command::Status
                | Command::DpQuery
                | Command::DpQueryNew
                | Command::Control
                | Command::ControlNew
        )
    }
}

impl From<Command> for u32 {
    fn from(cmd: Command) -> u32 {
        cmd.as_u32()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02x})", self, self.as_u32())
    }
}

/// Commands that never carry a protocol version header.
pub const NO_PROTOCOL_HEADER_CMDS: [Command; 7] = [
    Command::DpQuery,
    Command::DpQueryNew,
    Command::UpdateDps,
    Command::HeartBeat,
    Command::SessKeyNegStart,
    Command::SessKeyNegResp,
    Command::SessKeyNegFinish,
];

// =============================================================================
// ENVELOPE MAGICS
// =============================================================================

/// Legacy envelope prefix (3.1 - 3.4).
pub const PREFIX_55AA: u32 = 0x0000_55AA;

/// Legacy envelope suffix.
pub const SUFFIX_55AA: u32 = 0x0000_AA55;

/// Modern envelope prefix (3.5).
pub const PREFIX_6699: u32 = 0x0000_6699;

/// Modern envelope suffix.
pub const SUFFIX_6699: u32 = 0x0000_9966;

/// Legacy prefix as it appears on the wire.
pub const PREFIX_55AA_BIN: [u8; 4] = PREFIX_55AA.to_be_bytes();

/// Modern prefix as it appears on the wire.
pub const PREFIX_6699_BIN: [u8; 4] = PREFIX_6699.to_be_bytes();

// =============================================================================
// PROTOCOL HEADERS
// =============================================================================

/// Zero padding following the ASCII version in the 15-byte header.
pub const PROTOCOL_3X_HEADER_PAD: [u8; 12] = [0u8; 12];

/// Length of the `"3.x" + 12 * 0x00` version header.
pub const PROTOCOL_HEADER_SIZE: usize = 15;

/// Length of the MD5 header used by protocol 3.1.
pub const PROTOCOL_31_MD5_SIZE: usize = 16;

// =============================================================================
// SIZES
// =============================================================================

/// AES block and key size.
pub const AES_KEY_SIZE: usize = 16;

/// AES-GCM nonce size.
pub const GCM_IV_SIZE: usize = 12;

/// AES-GCM tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Session negotiation nonce size.
pub const NONCE_SIZE: usize = 16;

/// HMAC-SHA256 output size.
pub const HMAC_SIZE: usize = 32;

/// CRC32 trailer size.
pub const CRC_SIZE: usize = 4;

/// Return code size.
pub const RETCODE_SIZE: usize = 4;

/// Return codes are only recognized below this value.
pub const RETCODE_THRESHOLD: u32 = 256;

// =============================================================================
// TIMING
// =============================================================================

/// Interval between background heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single heartbeat exchange.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for each datapoint discovery probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// NETWORK
// =============================================================================

/// Default TCP port of the local protocol.
pub const DEFAULT_PORT: u16 = 6668;

/// UDP discovery port, plaintext or legacy-encrypted announcements.
pub const UDP_PORT: u16 = 6666;

/// UDP discovery port, encrypted announcements.
pub const UDP_PORT_ENCRYPTED: u16 = 6667;

// =============================================================================
// SESSION NEGOTIATION
// =============================================================================

/// Reserved wait key for the session negotiation response.
pub const SESS_KEY_SEQNO: i64 = -102;

/// Maximum derivation attempts before negotiation fails.
pub const SESSION_KEY_MAX_RETRIES: u32 = 5;

// =============================================================================
// DATAPOINTS
// =============================================================================

/// Datapoints known to be safe with `UPDATEDPS`.
pub const UPDATE_DPS_WHITELIST: [u32; 3] = [18, 19, 20];

/// Datapoint id ranges probed during discovery.
pub const DPS_PROBE_RANGES: [RangeInclusive<u32>; 4] = [1..=11, 11..=21, 21..=31, 100..=111];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::SessKeyNegStart.as_u32(), 3);
        assert_eq!(Command::DpQuery.as_u32(), 0x0a);
        assert_eq!(Command::UpdateDps.as_u32(), 0x12);
        assert_eq!(Command::LanExtStream.as_u32(), 0x40);
    }

    #[test]
    fn test_command_lookup() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_u32(cmd.as_u32()), Some(cmd));
        }
        assert_eq!(Command::from_u32(0x99), None);
    }

    #[test]
    fn test_header_exempt() {
        assert!(Command::HeartBeat.is_header_exempt());
        assert!(Command::SessKeyNegFinish.is_header_exempt());
        assert!(!Command::Control.is_header_exempt());
        assert!(!Command::Status.is_header_exempt());
    }

    #[test]
    fn test_status_forwarding_set() {
        assert!(Command::Status.carries_status());
        assert!(Command::DpQueryNew.carries_status());
        assert!(Command::ControlNew.carries_status());
        assert!(!Command::UpdateDps.carries_status());
        assert!(!Command::HeartBeat.carries_status());
    }

    #[test]
    fn test_prefix_bytes() {
        assert_eq!(PREFIX_55AA_BIN, [0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(PREFIX_6699_BIN, [0x00, 0x00, 0x66, 0x99]);
    }
}
