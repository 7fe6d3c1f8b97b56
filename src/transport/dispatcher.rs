//! Inbound demultiplexer for one device connection.
//!
//! Bytes from the socket go in through [`MessageDispatcher::add_data`].
//! Every complete frame is unpacked with the key currently in force and
//! then either handed to the request waiting on its sequence number or,
//! for unsolicited status traffic, forwarded to the listener.
//!
//! ```text
//!   socket bytes ──► buffer ──► extract_messages ──► unpack ──► open
//!                                                         │
//!                      ┌──────────────────────────────────┤
//!                      ▼                                  ▼
//!             pending[seqno] (or -102)            listener.status_updated
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use super::frame::{extract_messages, parse_header, unpack_message};
use super::message::TuyaMessage;
use super::payload::{open_payload, parse_status_response};
use crate::core::{Command, LogContext, ProtocolVersion, SESS_KEY_SEQNO, TuyaListener};
use crate::crypto::ActiveKey;

type PendingTable = HashMap<i64, PendingEntry>;

struct PendingEntry {
    id: u64,
    tx: oneshot::Sender<TuyaMessage>,
}

/// How a wait on a pending response ended.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The device answered.
    Received(TuyaMessage),
    /// Nothing arrived in time.
    TimedOut,
    /// The dispatcher was aborted (connection lost or closed).
    Cancelled,
}

impl WaitOutcome {
    /// The message, treating timeout and cancellation alike.
    pub fn into_message(self) -> Option<TuyaMessage> {
        match self {
            WaitOutcome::Received(msg) => Some(msg),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => None,
        }
    }
}

/// A registered wait for one sequence number.
///
/// Register before writing the request so a fast answer cannot slip past.
/// Dropping the handle removes its table entry.
pub struct PendingResponse {
    seqno: i64,
    id: u64,
    rx: oneshot::Receiver<TuyaMessage>,
    table: Arc<Mutex<PendingTable>>,
}

impl PendingResponse {
    /// Sequence number this handle waits on.
    pub fn seqno(&self) -> i64 {
        self.seqno
    }

    /// Wait up to `timeout` for the response.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(msg)) => WaitOutcome::Received(msg),
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // a later registration for the same seqno owns the slot now
        if table.get(&self.seqno).is_some_and(|entry| entry.id == self.id) {
            table.remove(&self.seqno);
        }
    }
}

/// Frame buffer, pending-request table and listener routing.
pub struct MessageDispatcher {
    version: RwLock<ProtocolVersion>,
    key: ActiveKey,
    listener: Arc<dyn TuyaListener>,
    log: LogContext,
    buffer: Mutex<Vec<u8>>,
    pending: Arc<Mutex<PendingTable>>,
    aborted: AtomicBool,
    next_id: AtomicU64,
}

impl MessageDispatcher {
    /// Create a dispatcher that reads `key` fresh for every frame.
    pub fn new(
        version: ProtocolVersion,
        key: ActiveKey,
        listener: Arc<dyn TuyaListener>,
        log: LogContext,
    ) -> Self {
        Self {
            version: RwLock::new(version),
            key,
            listener,
            log,
            buffer: Mutex::new(Vec::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            aborted: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Protocol version used to unpack frames.
    pub fn version(&self) -> ProtocolVersion {
        *self.version.read()
    }

    /// Switch protocol version.
    pub fn set_version(&self, version: ProtocolVersion) {
        *self.version.write() = version;
    }

    /// Whether [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Number of registered waits.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register a wait for `seqno`.
    ///
    /// After an abort the returned handle resolves as cancelled at once.
    pub fn register(&self, seqno: i64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.is_aborted() {
            let replaced = self.pending.lock().insert(seqno, PendingEntry { id, tx });
            if replaced.is_some() {
                log::warn!("{} replacing pending wait for seqno {seqno}", self.log);
            }
        }
        PendingResponse {
            seqno,
            id,
            rx,
            table: Arc::clone(&self.pending),
        }
    }

    /// Register and wait in one step; `None` on timeout or abort.
    pub async fn wait_for(&self, seqno: i64, timeout: Duration) -> Option<TuyaMessage> {
        match self.register(seqno).wait(timeout).await {
            WaitOutcome::Received(msg) => Some(msg),
            WaitOutcome::TimedOut => {
                crate::trace_device!(self.log, "timeout waiting for seqno {seqno}");
                None
            }
            WaitOutcome::Cancelled => {
                crate::trace_device!(self.log, "wait for seqno {seqno} cancelled");
                None
            }
        }
    }

    /// Cancel every pending wait and drop buffered bytes.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let dropped = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        self.buffer.lock().clear();
        if dropped > 0 {
            crate::trace_device!(self.log, "aborted {dropped} pending waits");
        }
    }

    /// Feed bytes read from the socket.
    pub fn add_data(&self, data: &[u8]) {
        let frames = {
            let mut buffer = self.buffer.lock();
            buffer.extend_from_slice(data);
            let (frames, rest_len) = {
                let (frames, rest) = extract_messages(&buffer);
                (frames, rest.len())
            };
            let consumed = buffer.len() - rest_len;
            buffer.drain(..consumed);
            frames
        };

        for frame in frames {
            self.process_frame(&frame);
        }
    }

    fn process_frame(&self, frame: &[u8]) {
        let header = match parse_header(frame) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("{} dropping frame with bad header: {err}", self.log);
                return;
            }
        };

        let negotiation = Command::from_u32(header.cmd).is_some_and(Command::is_negotiation);
        let key = if negotiation {
            self.key.local().clone()
        } else {
            self.key.current()
        };
        let version = self.version();

        let mut msg = match unpack_message(frame, version, Some(&key)) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("{} dropping undecodable frame: {err}", self.log);
                return;
            }
        };
        if !msg.crc_good {
            log::warn!("{} integrity check failed: {}", self.log, msg.summary());
        }

        let (body, err) = open_payload(version, msg.cmd, &msg.payload, msg.retcode, &key);
        if let Some(err) = err {
            log::debug!("{} payload did not decrypt: {err}", self.log);
        }
        msg.payload = body;

        crate::trace_device!(self.log, "received {}", msg.summary());
        self.dispatch(msg);
    }

    fn dispatch(&self, msg: TuyaMessage) {
        let waiter = {
            let mut pending = self.pending.lock();
            pending.remove(&i64::from(msg.seqno)).or_else(|| {
                if msg.command() == Some(Command::SessKeyNegResp) {
                    pending.remove(&SESS_KEY_SEQNO)
                } else {
                    None
                }
            })
        };

        if let Some(entry) = waiter {
            if entry.tx.send(msg).is_err() {
                crate::trace_device!(self.log, "waiter went away before delivery");
            }
            return;
        }

        if !msg.crc_good || !msg.command().is_some_and(Command::carries_status) {
            crate::trace_device!(self.log, "ignoring unsolicited {}", msg.summary());
            return;
        }
        match parse_status_response(&msg.payload) {
            Some(dps) => self.listener.status_updated(&dps),
            None => crate::trace_device!(self.log, "status push without datapoints"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Dps;
    use crate::crypto::LocalKey;
    use crate::transport::frame::{pack_message, pack_message_55aa};
    use crate::transport::message::MessagePayload;
    use crate::transport::payload::seal_payload;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Dps>>,
    }

    impl TuyaListener for Recorder {
        fn status_updated(&self, dps: &Dps) {
            self.updates.lock().push(dps.clone());
        }

        fn disconnected(&self) {}
    }

    fn key() -> LocalKey {
        LocalKey::from_bytes(*b"0123456789ABCDEF")
    }

    fn dispatcher(version: ProtocolVersion) -> (MessageDispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = MessageDispatcher::new(
            version,
            ActiveKey::new(key()),
            recorder.clone(),
            LogContext::default(),
        );
        (dispatcher, recorder)
    }

    fn status_frame(seqno: u32, json: &str) -> Vec<u8> {
        let body = [&ProtocolVersion::V33.header()[..], json.as_bytes()].concat();
        let sealed = seal_payload(ProtocolVersion::V33, Command::Status, &body, &key()).unwrap();
        pack_message_55aa(&MessagePayload::new(Command::Status, sealed), seqno, None, Some(0))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout_removes_entry() {
        let (dispatcher, _) = dispatcher(ProtocolVersion::V33);
        let result = dispatcher.wait_for(5, Duration::from_secs(5)).await;
        assert!(result.is_none());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_cancels_pending() {
        let (dispatcher, _) = dispatcher(ProtocolVersion::V33);
        let pending = dispatcher.register(9);
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.abort();
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(matches!(
            pending.wait(Duration::from_secs(5)).await,
            WaitOutcome::Cancelled
        ));

        // registrations after an abort resolve immediately
        let late = dispatcher.register(10);
        assert!(matches!(late.wait(Duration::from_secs(5)).await, WaitOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_responses_matched_by_seqno() {
        let (dispatcher, recorder) = dispatcher(ProtocolVersion::V33);
        let first = dispatcher.register(1);
        let second = dispatcher.register(2);

        // answers arrive in reverse order
        dispatcher.add_data(&status_frame(2, r#"{"dps":{"2":false}}"#));
        dispatcher.add_data(&status_frame(1, r#"{"dps":{"1":true}}"#));

        let first = first.wait(Duration::from_secs(1)).await.into_message().unwrap();
        let second = second.wait(Duration::from_secs(1)).await.into_message().unwrap();
        assert_eq!(first.seqno, 1);
        assert_eq!(first.payload, br#"{"dps":{"1":true}}"#);
        assert_eq!(second.seqno, 2);
        assert!(recorder.updates.lock().is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_unsolicited_status_reaches_listener() {
        let (dispatcher, recorder) = dispatcher(ProtocolVersion::V33);
        let frame = status_frame(77, r#"{"devId":"x","dps":{"1":true,"4":21}}"#);

        // split inside the frame with leading noise
        let mut stream = vec![0xde, 0xad];
        stream.extend_from_slice(&frame);
        dispatcher.add_data(&stream[..20]);
        assert!(recorder.updates.lock().is_empty());
        dispatcher.add_data(&stream[20..]);

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["1"], serde_json::json!(true));
        assert_eq!(updates[0]["4"], serde_json::json!(21));
    }

    #[test]
    fn test_late_update_dps_not_forwarded() {
        let (dispatcher, recorder) = dispatcher(ProtocolVersion::V33);
        let body = br#"{"dps":{"18":0}}"#;
        let sealed = seal_payload(ProtocolVersion::V33, Command::UpdateDps, body, &key()).unwrap();
        let frame = pack_message_55aa(
            &MessagePayload::new(Command::UpdateDps, sealed),
            12,
            None,
            Some(0),
        )
        .unwrap();
        dispatcher.add_data(&frame);
        assert!(recorder.updates.lock().is_empty());
    }

    #[test]
    fn test_corrupt_frame_not_forwarded() {
        let (dispatcher, recorder) = dispatcher(ProtocolVersion::V33);
        let mut frame = status_frame(3, r#"{"dps":{"1":true}}"#);
        let crc_at = frame.len() - 8;
        frame[crc_at] ^= 0xff;
        dispatcher.add_data(&frame);
        assert!(recorder.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_response_routed_to_reserved_seqno() {
        let (dispatcher, _) = dispatcher(ProtocolVersion::V34);
        let pending = dispatcher.register(SESS_KEY_SEQNO);

        let body = [[0x02u8; 16].as_slice(), &[0u8; 32]].concat();
        let msg = MessagePayload::new(Command::SessKeyNegResp, body.clone());
        let frame = pack_message(&msg, 1, ProtocolVersion::V34, Some(&key())).unwrap();
        dispatcher.add_data(&frame);

        let response = pending.wait(Duration::from_secs(1)).await.into_message().unwrap();
        assert_eq!(response.command(), Some(Command::SessKeyNegResp));
        assert!(response.crc_good);
        assert_eq!(response.payload, body);
    }

    #[tokio::test]
    async fn test_session_key_read_fresh() {
        let active = ActiveKey::new(key());
        let dispatcher = MessageDispatcher::new(
            ProtocolVersion::V35,
            active.clone(),
            Arc::new(crate::core::EmptyListener),
            LogContext::default(),
        );
        let session = LocalKey::from_bytes([0x5a; 16]);
        active.install_session_key(session.clone());

        let pending = dispatcher.register(4);
        let msg = MessagePayload::new(Command::HeartBeat, b"{}".to_vec());
        let frame = pack_message(&msg, 4, ProtocolVersion::V35, Some(&session)).unwrap();
        dispatcher.add_data(&frame);

        let response = pending.wait(Duration::from_secs(1)).await.into_message().unwrap();
        assert!(response.crc_good);
        assert_eq!(response.payload, b"{}");
    }

    #[test]
    fn test_dropped_handle_keeps_newer_registration() {
        let (dispatcher, _) = dispatcher(ProtocolVersion::V33);
        let old = dispatcher.register(8);
        let _new = dispatcher.register(8);
        drop(old);
        assert_eq!(dispatcher.pending_count(), 1);
    }
}
