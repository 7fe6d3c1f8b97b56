//! One TCP connection to one device.
//!
//! The connection owns the socket, the dispatcher and the key cell. Two
//! background tasks run while it is open: a reader that feeds the
//! dispatcher and a heartbeat that pings the device periodically.
//!
//! ```text
//! Disconnected ──connect──► Connected ──negotiate──► Negotiating ──► Ready
//!       ▲                       │ (3.1/3.3 skip straight to Ready)     │
//!       └──────────── socket closed, read error or close() ◄───────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::dispatcher::{MessageDispatcher, WaitOutcome};
use super::error::{TransportError, TransportResult};
use super::frame::pack_message;
use super::message::{MessagePayload, TuyaMessage};
use super::payload::{PayloadGenerator, seal_payload};
use crate::core::{
    Command, DeviceConfig, DeviceType, Dps, HEARTBEAT_TIMEOUT, LogContext, ProtocolVersion,
    SESS_KEY_SEQNO, SESSION_KEY_MAX_RETRIES, SessionKeyError, TuyaListener,
};
use crate::crypto::{ActiveKey, LocalKey, SessionKeyNegotiator};

const READ_BUFFER_SIZE: usize = 4096;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Socket gone; a fresh connect is required.
    Disconnected,
    /// Socket open, static key in force, session key still owed.
    Connected,
    /// Session key negotiation in progress.
    Negotiating,
    /// Requests may be sent.
    Ready,
}

struct ConnectionInner {
    config: DeviceConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    dispatcher: MessageDispatcher,
    key: ActiveKey,
    generator: RwLock<PayloadGenerator>,
    listener: Arc<dyn TuyaListener>,
    seqno: AtomicU32,
    phase: Mutex<ConnectionPhase>,
    negotiation: tokio::sync::Mutex<()>,
    lost: AtomicBool,
    cancel: CancellationToken,
    log: LogContext,
}

/// An open device connection.
///
/// Dropping it stops the background tasks; prefer [`close`](Self::close),
/// which also waits for them to finish.
pub struct TuyaConnection {
    inner: Arc<ConnectionInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl TuyaConnection {
    /// Open the socket and start the reader and heartbeat tasks.
    ///
    /// Negotiation for 3.4/3.5 happens lazily on the first exchange.
    pub async fn connect(
        config: DeviceConfig,
        listener: Arc<dyn TuyaListener>,
    ) -> TransportResult<Self> {
        let addr = config.socket_addr();
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::ConnectTimeout { addr }),
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let log = LogContext::new(&config.device_id, config.debug);
        let key = ActiveKey::new(config.local_key.clone());
        let generator = PayloadGenerator::new(config.device_id.clone(), config.version, config.dev_type)
            .with_local_key(config.local_key.clone());
        let dispatcher =
            MessageDispatcher::new(config.version, key.clone(), Arc::clone(&listener), log.clone());
        let phase = if config.version.needs_session_key() {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::Ready
        };
        crate::trace_device!(log, "connected to {addr} (protocol {})", config.version);

        let heartbeat_interval = config.heartbeat_interval;
        let inner = Arc::new(ConnectionInner {
            config,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            dispatcher,
            key,
            generator: RwLock::new(generator),
            listener,
            seqno: AtomicU32::new(0),
            phase: Mutex::new(phase),
            negotiation: tokio::sync::Mutex::new(()),
            lost: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            log,
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        let heartbeat =
            heartbeat_interval.map(|period| tokio::spawn(heartbeat_loop(Arc::clone(&inner), period)));

        Ok(Self {
            inner,
            reader: Mutex::new(Some(reader)),
            heartbeat: Mutex::new(heartbeat),
        })
    }

    /// Send `msg` and wait for its answer.
    ///
    /// Negotiates a session key first when the protocol needs one. Timeout,
    /// cancellation, negotiation failure and a dead socket all yield `None`
    /// (the cause is logged).
    pub async fn exchange(&self, msg: MessagePayload, timeout: Duration) -> Option<TuyaMessage> {
        self.inner.exchange(msg, timeout).await
    }

    /// Run session key negotiation now instead of on the first exchange.
    pub async fn negotiate(&self) -> TransportResult<()> {
        self.inner.ensure_session().await
    }

    /// Send one heartbeat and wait for the answer.
    pub async fn heartbeat(&self) -> Option<TuyaMessage> {
        let msg = self.inner.generate(Command::HeartBeat, None, None);
        self.inner.exchange(msg, self.inner.config.request_timeout).await
    }

    /// Build the payload for `cmd` with this device's generator.
    pub fn generate(&self, cmd: Command, dps: Option<&Dps>, dp_ids: Option<&[u32]>) -> MessagePayload {
        self.inner.generate(cmd, dps, dp_ids)
    }

    /// Stop the background tasks and close the socket.
    ///
    /// The listener's `disconnected` hook fires once, here or earlier if the
    /// socket already went away.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let heartbeat = self.heartbeat.lock().take();
        if let Some(handle) = heartbeat {
            if let Err(err) = handle.await {
                log::debug!("{} heartbeat task ended abnormally: {err}", self.inner.log);
            }
        }

        if let Some(mut stream) = self.inner.writer.lock().await.take() {
            if let Err(err) = stream.shutdown().await {
                crate::trace_device!(self.inner.log, "socket shutdown: {err}");
            }
        }

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            if let Err(err) = handle.await {
                log::debug!("{} reader task ended abnormally: {err}", self.inner.log);
            }
        }

        self.inner.connection_lost();
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.lock()
    }

    /// Whether the socket is still usable.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether a negotiated session key is in force.
    pub fn has_session_key(&self) -> bool {
        self.inner.key.has_session_key()
    }

    /// Protocol version in use.
    pub fn version(&self) -> ProtocolVersion {
        self.inner.version()
    }

    /// Switch protocol version on the open socket.
    ///
    /// Moving to 3.4/3.5 forces a negotiation on the next exchange; moving
    /// below drops any session key.
    pub fn set_version(&self, version: ProtocolVersion) {
        self.inner.generator.write().set_version(version);
        self.inner.dispatcher.set_version(version);
        let mut phase = self.inner.phase.lock();
        if *phase == ConnectionPhase::Disconnected {
            return;
        }
        self.inner.key.reset();
        *phase = if version.needs_session_key() {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::Ready
        };
    }

    /// Payload template family in use.
    pub fn dev_type(&self) -> DeviceType {
        self.inner.generator.read().dev_type()
    }

    /// Switch payload template family.
    pub fn set_dev_type(&self, dev_type: DeviceType) {
        self.inner.generator.write().set_dev_type(dev_type);
    }

    /// Configuration the connection was opened with.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Log context of this device.
    pub fn log(&self) -> &LogContext {
        &self.inner.log
    }
}

impl Drop for TuyaConnection {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ConnectionInner {
    fn version(&self) -> ProtocolVersion {
        self.generator.read().version()
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let mut current = self.phase.lock();
        if *current != ConnectionPhase::Disconnected {
            *current = phase;
        }
    }

    fn is_connected(&self) -> bool {
        !self.lost.load(Ordering::Acquire) && self.phase() != ConnectionPhase::Disconnected
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn generate(&self, cmd: Command, dps: Option<&Dps>, dp_ids: Option<&[u32]>) -> MessagePayload {
        self.generator.read().generate(cmd, dps, dp_ids)
    }

    async fn exchange(&self, msg: MessagePayload, timeout: Duration) -> Option<TuyaMessage> {
        if let Err(err) = self.ensure_session().await {
            log::warn!("{} session key negotiation failed: {err}", self.log);
            return None;
        }
        self.request(msg, timeout).await
    }

    /// Send and wait without touching negotiation.
    async fn request(&self, msg: MessagePayload, timeout: Duration) -> Option<TuyaMessage> {
        let seqno = self.next_seqno();
        let pending = self.dispatcher.register(i64::from(seqno));
        let key = self.key.current();

        if let Err(err) = self.send_frame(&msg, seqno, &key).await {
            log::warn!("{} failed to send {}: {err}", self.log, msg.cmd);
            if err.is_fatal() {
                self.connection_lost();
            }
            return None;
        }

        match pending.wait(timeout).await {
            WaitOutcome::Received(response) => Some(response),
            WaitOutcome::TimedOut => {
                crate::trace_device!(
                    self.log,
                    "no response to {} seqno={seqno} within {timeout:?}",
                    msg.cmd
                );
                None
            }
            WaitOutcome::Cancelled => {
                crate::trace_device!(self.log, "request seqno={seqno} cancelled");
                None
            }
        }
    }

    async fn send_frame(
        &self,
        msg: &MessagePayload,
        seqno: u32,
        key: &LocalKey,
    ) -> TransportResult<()> {
        let version = self.version();
        let body = seal_payload(version, msg.cmd, &msg.payload, key)?;
        let frame = pack_message(&MessagePayload::new(msg.cmd, body), seqno, version, Some(key))?;
        crate::trace_device!(
            self.log,
            "sending cmd={} seqno={seqno} ({} bytes)",
            msg.cmd,
            frame.len()
        );

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Negotiate once per connection; concurrent callers wait for the
    /// first one to finish.
    async fn ensure_session(&self) -> TransportResult<()> {
        if !self.version().needs_session_key() || self.phase() == ConnectionPhase::Ready {
            return Ok(());
        }

        let _guard = self.negotiation.lock().await;
        match self.phase() {
            ConnectionPhase::Ready => return Ok(()),
            ConnectionPhase::Disconnected => return Err(TransportError::Closed),
            ConnectionPhase::Connected | ConnectionPhase::Negotiating => {}
        }

        self.set_phase(ConnectionPhase::Negotiating);
        self.key.reset();
        let result = self.negotiate().await;
        if result.is_err() {
            self.set_phase(ConnectionPhase::Connected);
        }
        result
    }

    async fn negotiate(&self) -> TransportResult<()> {
        let version = self.version();
        let local = self.key.local().clone();
        let mut negotiator = SessionKeyNegotiator::new(
            local.clone(),
            version,
            self.config.strict_hmac,
            self.log.clone(),
        );
        crate::trace_device!(self.log, "starting session key negotiation (v{version})");

        for attempt in 1..=SESSION_KEY_MAX_RETRIES {
            negotiator.restart();
            let nonce = negotiator.start();

            let pending = self.dispatcher.register(SESS_KEY_SEQNO);
            let start = MessagePayload::new(Command::SessKeyNegStart, nonce.to_vec());
            self.send_frame(&start, self.next_seqno(), &local).await?;
            crate::trace_device!(
                self.log,
                "sent SESS_KEY_NEG_START (attempt {attempt}/{SESSION_KEY_MAX_RETRIES})"
            );

            let response = match pending.wait(self.config.request_timeout).await {
                WaitOutcome::Received(response) => response,
                WaitOutcome::TimedOut => {
                    log::debug!("{} no response to SESS_KEY_NEG_START", self.log);
                    continue;
                }
                WaitOutcome::Cancelled => return Err(TransportError::Closed),
            };
            if response.command() != Some(Command::SessKeyNegResp) {
                log::debug!(
                    "{} unexpected negotiation response: {}",
                    self.log,
                    response.summary()
                );
                continue;
            }

            match negotiator.process_response(&response.payload) {
                Ok(_) => {}
                Err(SessionKeyError::HmacVerification) => {
                    return Err(SessionKeyError::HmacVerification.into());
                }
                Err(err) => {
                    log::debug!("{} bad negotiation response: {err}", self.log);
                    continue;
                }
            }

            let session_key = match negotiator.derive_session_key() {
                Ok(key) => key,
                Err(err) if err.is_retryable() => continue,
                Err(err) => return Err(err.into()),
            };

            let finish = MessagePayload::new(Command::SessKeyNegFinish, negotiator.finish()?.to_vec());
            self.send_frame(&finish, self.next_seqno(), &local).await?;

            self.key.install_session_key(session_key);
            self.set_phase(ConnectionPhase::Ready);
            crate::trace_device!(self.log, "session key negotiated on attempt {attempt}");

            if version.uses_gcm_envelope() {
                let heartbeat = self.generate(Command::HeartBeat, None, None);
                match self.request(heartbeat, self.config.request_timeout).await {
                    Some(_) => crate::trace_device!(self.log, "heartbeat ok, session key verified"),
                    None => log::debug!("{} no heartbeat after session negotiation", self.log),
                }
            }
            return Ok(());
        }

        Err(SessionKeyError::RetriesExhausted {
            attempts: SESSION_KEY_MAX_RETRIES,
        }
        .into())
    }

    /// Tear down after the socket went away. Runs its body once.
    fn connection_lost(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.dispatcher.abort();
        self.key.reset();
        *self.phase.lock() = ConnectionPhase::Disconnected;
        crate::trace_device!(self.log, "connection lost");
        self.listener.disconnected();
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    crate::trace_device!(inner.log, "device closed the connection");
                    break;
                }
                Ok(n) => {
                    crate::trace_device!(inner.log, "received {n} bytes");
                    inner.dispatcher.add_data(&buf[..n]);
                }
                Err(err) => {
                    log::warn!("{} read error: {err}", inner.log);
                    break;
                }
            },
        }
    }
    inner.connection_lost();
}

async fn heartbeat_loop(inner: Arc<ConnectionInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let heartbeat = inner.generate(Command::HeartBeat, None, None);
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            response = inner.exchange(heartbeat, HEARTBEAT_TIMEOUT) => {
                if response.is_none() {
                    log::debug!("{} heartbeat got no response", inner.log);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;

    use super::*;
    use crate::core::EmptyListener;

    #[derive(Default)]
    struct DisconnectCounter(AtomicUsize);

    impl TuyaListener for DisconnectCounter {
        fn status_updated(&self, _dps: &Dps) {}

        fn disconnected(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(addr: std::net::SocketAddr, version: ProtocolVersion) -> DeviceConfig {
        DeviceConfig::builder(addr.ip().to_string(), "bf0123456789abcdef", "0123456789ABCDEF")
            .port(addr.port())
            .version(version)
            .heartbeat_interval(None)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result =
            TuyaConnection::connect(config(addr, ProtocolVersion::V33), Arc::new(EmptyListener))
                .await;
        match result {
            Err(err) => assert!(matches!(err, TransportError::Connect { .. })),
            Ok(_) => panic!("connect to a closed port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // read and never answer
            while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let conn = TuyaConnection::connect(config(addr, ProtocolVersion::V33), Arc::new(EmptyListener))
            .await
            .unwrap();
        assert_eq!(conn.phase(), ConnectionPhase::Ready);

        let msg = conn.generate(Command::DpQuery, None, None);
        assert!(conn.exchange(msg, Duration::from_millis(100)).await.is_none());
        assert!(conn.is_connected());

        conn.close().await;
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_notifies_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket
        });

        let counter = Arc::new(DisconnectCounter::default());
        let conn = TuyaConnection::connect(config(addr, ProtocolVersion::V34), counter.clone())
            .await
            .unwrap();
        let _socket = device.await.unwrap();
        assert_eq!(conn.phase(), ConnectionPhase::Connected);

        conn.close().await;
        conn.close().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
        assert!(!conn.is_connected());

        let msg = conn.generate(Command::HeartBeat, None, None);
        assert!(conn.exchange(msg, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_peer_close_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let counter = Arc::new(DisconnectCounter::default());
        let conn = TuyaConnection::connect(config(addr, ProtocolVersion::V33), counter.clone())
            .await
            .unwrap();
        device.await.unwrap();

        for _ in 0..50 {
            if !conn.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!conn.is_connected());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
