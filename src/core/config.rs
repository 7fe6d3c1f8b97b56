//! Per-device connection configuration.

use std::time::Duration;

use super::constants::{DEFAULT_PORT, DEFAULT_TIMEOUT, HEARTBEAT_INTERVAL, PROBE_TIMEOUT};
use super::error::TuyaError;
use super::version::{DeviceType, ProtocolVersion};
use crate::crypto::LocalKey;

/// Everything needed to open and drive one device connection.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device IP address or host name.
    pub address: String,

    /// TCP port.
    pub port: u16,

    /// Device id, also used as gateway and user id in payloads.
    pub device_id: String,

    /// Static 16-byte device key.
    pub local_key: LocalKey,

    /// Wire protocol revision.
    pub version: ProtocolVersion,

    /// Payload template family.
    pub dev_type: DeviceType,

    /// Limit on the TCP connect.
    pub connect_timeout: Duration,

    /// Default response timeout for requests.
    pub request_timeout: Duration,

    /// Response timeout for datapoint probes.
    pub probe_timeout: Duration,

    /// Background heartbeat period; `None` disables the heartbeat task.
    pub heartbeat_interval: Option<Duration>,

    /// Fail negotiation when the device HMAC does not verify.
    pub strict_hmac: bool,

    /// Per-frame debug tracing.
    pub debug: bool,
}

impl DeviceConfig {
    /// Start a builder; the key must be exactly 16 bytes.
    pub fn builder(
        address: impl Into<String>,
        device_id: impl Into<String>,
        local_key: &str,
    ) -> DeviceConfigBuilder {
        DeviceConfigBuilder {
            address: address.into(),
            device_id: device_id.into(),
            local_key: local_key.to_string(),
            port: DEFAULT_PORT,
            version: ProtocolVersion::default(),
            dev_type: DeviceType::default(),
            connect_timeout: DEFAULT_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            heartbeat_interval: Some(HEARTBEAT_INTERVAL),
            strict_hmac: false,
            debug: false,
        }
    }

    /// `address:port` for the socket connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Builder for [`DeviceConfig`].
#[derive(Debug, Clone)]
pub struct DeviceConfigBuilder {
    address: String,
    device_id: String,
    local_key: String,
    port: u16,
    version: ProtocolVersion,
    dev_type: DeviceType,
    connect_timeout: Duration,
    request_timeout: Duration,
    probe_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    strict_hmac: bool,
    debug: bool,
}

impl DeviceConfigBuilder {
    /// Set the TCP port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the protocol version.
    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the device type.
    pub fn dev_type(mut self, dev_type: DeviceType) -> Self {
        self.dev_type = dev_type;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the datapoint probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the heartbeat period, or disable it with `None`.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Reject devices whose negotiation HMAC does not verify.
    pub fn strict_hmac(mut self, strict: bool) -> Self {
        self.strict_hmac = strict;
        self
    }

    /// Enable per-frame debug tracing.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<DeviceConfig, TuyaError> {
        let local_key = LocalKey::try_from(self.local_key.as_str())?;
        Ok(DeviceConfig {
            address: self.address,
            port: self.port,
            device_id: self.device_id,
            local_key,
            version: self.version,
            dev_type: self.dev_type,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            probe_timeout: self.probe_timeout,
            heartbeat_interval: self.heartbeat_interval,
            strict_hmac: self.strict_hmac,
            debug: self.debug,
        })
    }
}
