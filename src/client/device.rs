//! Host-facing device handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::core::{
    Command, DPS_PROBE_RANGES, DeviceConfig, DeviceType, Dps, ERR_DEVTYPE, ERR_JSON, ERR_OFFLINE,
    ERR_PAYLOAD, ERR_TIMEOUT, EmptyListener, ProtocolVersion, TuyaError, TuyaListener, TuyaResult,
    UPDATE_DPS_WHITELIST,
};
use crate::transport::{
    MessagePayload, TuyaConnection, TuyaMessage, parse_status_response, update_dps_payload,
};

/// Marker some 3.3 firmwares answer a `DP_QUERY` with when they want `CONTROL_NEW`.
const DEVICE22_MARKER: &[u8] = b"data unvalid";

/// Open a connection to a device.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use tuya_local::{connect, ProtocolVersion};
///
/// let device = connect(
///     "192.168.1.42",
///     "bf0123456789abcdef",
///     "0123456789ABCDEF",
///     ProtocolVersion::V35,
///     false,
///     None,
///     6668,
///     Duration::from_secs(5),
/// )
/// .await?;
///
/// device.set_dp(true, "1").await?;
/// let dps = device.status().await?;
/// device.close().await;
/// ```
#[allow(clippy::too_many_arguments)]
pub async fn connect(
    address: &str,
    device_id: &str,
    local_key: &str,
    version: ProtocolVersion,
    debug: bool,
    listener: Option<Arc<dyn TuyaListener>>,
    port: u16,
    timeout: Duration,
) -> TuyaResult<TuyaDevice> {
    let config = DeviceConfig::builder(address, device_id, local_key)
        .port(port)
        .version(version)
        .connect_timeout(timeout)
        .debug(debug)
        .build()?;
    let listener = listener.unwrap_or_else(|| Arc::new(EmptyListener));
    TuyaDevice::connect_with(config, listener).await
}

/// Keeps the datapoint cache current before passing events on.
struct CachingListener {
    cache: Arc<Mutex<Dps>>,
    inner: Arc<dyn TuyaListener>,
}

impl TuyaListener for CachingListener {
    fn status_updated(&self, dps: &Dps) {
        merge(&self.cache, dps);
        self.inner.status_updated(dps);
    }

    fn disconnected(&self) {
        self.inner.disconnected();
    }
}

fn merge(cache: &Mutex<Dps>, dps: &Dps) {
    let mut cache = cache.lock();
    for (id, value) in dps {
        cache.insert(id.clone(), value.clone());
    }
}

/// A connected device.
///
/// Every call goes through one [`TuyaConnection`]; calls may overlap, their
/// responses are told apart by sequence number.
pub struct TuyaDevice {
    connection: TuyaConnection,
    cache: Arc<Mutex<Dps>>,
    dps_to_request: Mutex<Dps>,
}

impl TuyaDevice {
    /// Open a connection described by `config`.
    pub async fn connect_with(
        config: DeviceConfig,
        listener: Arc<dyn TuyaListener>,
    ) -> TuyaResult<Self> {
        let cache = Arc::new(Mutex::new(Dps::new()));
        let listener = Arc::new(CachingListener {
            cache: Arc::clone(&cache),
            inner: listener,
        });
        let connection = TuyaConnection::connect(config, listener).await?;
        Ok(Self {
            connection,
            cache,
            dps_to_request: Mutex::new(Dps::new()),
        })
    }

    /// Query all datapoints.
    ///
    /// Ids added with [`add_dps_to_request`](Self::add_dps_to_request) are
    /// sent along as `null` entries (required by `type_0d` devices).
    pub async fn status(&self) -> TuyaResult<Dps> {
        let requested = self.dps_to_request.lock().clone();
        let dps = (!requested.is_empty()).then_some(&requested);
        let msg = self.connection.generate(Command::DpQuery, dps, None);

        let response = self.send(msg, self.request_timeout()).await?;
        if response.payload.windows(DEVICE22_MARKER.len()).any(|w| w == DEVICE22_MARKER) {
            if self.connection.dev_type() != DeviceType::Type0d {
                log::debug!(
                    "{} device rejected DP_QUERY, switching to {}",
                    self.connection.log(),
                    DeviceType::Type0d
                );
                self.connection.set_dev_type(DeviceType::Type0d);
            }
            return Err(TuyaError::Device { code: ERR_DEVTYPE });
        }

        let dps = parse_status_response(&response.payload).ok_or(TuyaError::Device { code: ERR_JSON })?;
        merge(&self.cache, &dps);
        Ok(dps)
    }

    /// Set one datapoint.
    pub async fn set_dp(&self, value: impl Into<Value>, dp_id: impl fmt::Display) -> TuyaResult<Dps> {
        let mut dps = Dps::new();
        dps.insert(dp_id.to_string(), value.into());
        self.set_dps(&dps).await
    }

    /// Set several datapoints in one command.
    ///
    /// Returns the datapoints the device echoed, which may be empty when the
    /// device only acknowledges and reports through a later push.
    pub async fn set_dps(&self, dps: &Dps) -> TuyaResult<Dps> {
        let msg = self.connection.generate(Command::Control, Some(dps), None);
        let response = self.send(msg, self.request_timeout()).await?;
        let echoed = parse_status_response(&response.payload).unwrap_or_default();
        merge(&self.cache, &echoed);
        Ok(echoed)
    }

    /// Find the datapoints this device exposes.
    ///
    /// Heartbeat, then a status query, then `UPDATEDPS` probes over fixed id
    /// ranges. Each step is independent; failed steps contribute nothing.
    pub async fn detect_available_dps(&self) -> Dps {
        if self.connection.heartbeat().await.is_none() {
            crate::trace_device!(self.connection.log(), "no heartbeat before detection");
        }

        let mut results = Vec::with_capacity(DPS_PROBE_RANGES.len() + 1);
        results.push(self.status().await);
        for range in DPS_PROBE_RANGES {
            let ids: Vec<u32> = range.collect();
            results.push(self.request_update(&ids, self.probe_timeout()).await);
        }

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(dps) => Some(dps),
                Err(err) => {
                    crate::trace_device!(self.connection.log(), "detection step failed: {err}");
                    None
                }
            })
            .fold(Dps::new(), |mut detected, dps| {
                detected.extend(dps);
                detected
            })
    }

    /// Ask a 3.3 device to refresh `dp_ids` (or everything).
    ///
    /// Other versions have no reset and succeed immediately.
    pub async fn reset(&self, dp_ids: Option<&[u32]>) -> TuyaResult<()> {
        if self.connection.version() != ProtocolVersion::V33 {
            return Ok(());
        }
        self.connection.set_dev_type(DeviceType::Type0a);
        crate::trace_device!(self.connection.log(), "reset switching to {}", DeviceType::Type0a);

        let msg = match dp_ids {
            Some(ids) if !ids.is_empty() => update_dps_payload(ids),
            _ => MessagePayload::new(Command::UpdateDps, b"{}".to_vec()),
        };
        self.send(msg, self.request_timeout()).await.map(|_| ())
    }

    /// Ask the device to push fresh values for `dp_ids`.
    ///
    /// Without ids, the cached ids (detected first if the cache is empty)
    /// restricted to the ids known to accept refreshes are used. Returns the
    /// refreshed datapoints; protocol 3.1 has no refresh and returns nothing.
    pub async fn update_dps(&self, dp_ids: Option<&[u32]>) -> Dps {
        if self.connection.version() == ProtocolVersion::V31 {
            return Dps::new();
        }

        let ids: Vec<u32> = match dp_ids {
            Some(ids) => ids.to_vec(),
            None => {
                if self.cache.lock().is_empty() {
                    let detected = self.detect_available_dps().await;
                    merge(&self.cache, &detected);
                }
                let cache = self.cache.lock();
                let mut ids: Vec<u32> = cache
                    .keys()
                    .filter_map(|id| id.parse().ok())
                    .filter(|id| UPDATE_DPS_WHITELIST.contains(id))
                    .collect();
                ids.sort_unstable();
                ids
            }
        };
        crate::trace_device!(self.connection.log(), "update_dps for {ids:?}");
        if ids.is_empty() {
            return Dps::new();
        }

        match self.request_update(&ids, self.probe_timeout()).await {
            Ok(dps) => dps,
            Err(err) => {
                crate::trace_device!(self.connection.log(), "update_dps failed: {err}");
                Dps::new()
            }
        }
    }

    /// Include datapoint ids in status queries.
    pub fn add_dps_to_request<I, T>(&self, dp_ids: I)
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        let mut requested = self.dps_to_request.lock();
        for id in dp_ids {
            requested.insert(id.to_string(), Value::Null);
        }
    }

    /// Send a heartbeat; `true` when the device answered.
    pub async fn heartbeat(&self) -> bool {
        self.connection.heartbeat().await.is_some()
    }

    /// Snapshot of the last known datapoint values. May be stale.
    pub fn dps_cache(&self) -> Dps {
        self.cache.lock().clone()
    }

    /// Protocol version in use.
    pub fn version(&self) -> ProtocolVersion {
        self.connection.version()
    }

    /// Switch protocol version.
    pub fn set_version(&self, version: ProtocolVersion) {
        self.connection.set_version(version);
    }

    /// Payload template family in use.
    pub fn dev_type(&self) -> DeviceType {
        self.connection.dev_type()
    }

    /// Switch payload template family.
    pub fn set_dev_type(&self, dev_type: DeviceType) {
        self.connection.set_dev_type(dev_type);
    }

    /// Whether the socket is still usable.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &TuyaConnection {
        &self.connection
    }

    /// Close the connection and wait for its tasks.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    async fn request_update(&self, dp_ids: &[u32], timeout: Duration) -> TuyaResult<Dps> {
        let response = self.send(update_dps_payload(dp_ids), timeout).await?;
        let dps = parse_status_response(&response.payload).ok_or(TuyaError::Device { code: ERR_JSON })?;
        merge(&self.cache, &dps);
        Ok(dps)
    }

    async fn send(&self, msg: MessagePayload, timeout: Duration) -> TuyaResult<TuyaMessage> {
        if !self.connection.is_connected() {
            return Err(TuyaError::Device { code: ERR_OFFLINE });
        }
        let response = self
            .connection
            .exchange(msg, timeout)
            .await
            .ok_or(TuyaError::Device { code: ERR_TIMEOUT })?;
        if !response.crc_good {
            return Err(TuyaError::Device { code: ERR_PAYLOAD });
        }
        Ok(response)
    }

    fn request_timeout(&self) -> Duration {
        self.connection.config().request_timeout
    }

    fn probe_timeout(&self) -> Duration {
        self.connection.config().probe_timeout
    }
}
