//! Scripted device on a loopback socket.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tuya_local::core::NONCE_SIZE;
use tuya_local::crypto::{AesCipher, LocalKey, derive_session_key, hmac_sha256};
use tuya_local::transport::{
    MessagePayload, TuyaMessage, find_message_in_buffer, open_payload, pack_message_55aa,
    pack_message_6699, seal_payload, unpack_message,
};
use tuya_local::{Command, DeviceConfig, Dps, ProtocolVersion, TuyaListener};

pub const DEVICE_ID: &str = "bf0123456789abcdef";
pub const LOCAL_KEY: &str = "0123456789ABCDEF";

pub fn local_key() -> LocalKey {
    LocalKey::try_from(LOCAL_KEY).unwrap()
}

pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Client config pointed at the fixture, heartbeat off, short timeouts.
pub fn config(addr: SocketAddr, version: ProtocolVersion) -> DeviceConfig {
    DeviceConfig::builder(addr.ip().to_string(), DEVICE_ID, LOCAL_KEY)
        .port(addr.port())
        .version(version)
        .heartbeat_interval(None)
        .request_timeout(Duration::from_secs(2))
        .probe_timeout(Duration::from_millis(300))
        .debug(true)
        .build()
        .unwrap()
}

#[derive(Default)]
pub struct RecordingListener {
    pub updates: Mutex<Vec<Dps>>,
    pub disconnects: AtomicUsize,
}

impl RecordingListener {
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl TuyaListener for RecordingListener {
    fn status_updated(&self, dps: &Dps) {
        self.updates.lock().push(dps.clone());
    }

    fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// A frame as the device saw it: raw bytes plus the opened message.
pub struct Received {
    pub raw: Vec<u8>,
    pub msg: TuyaMessage,
}

impl Received {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.msg.payload).unwrap()
    }
}

pub struct FakeDevice {
    stream: TcpStream,
    buffer: Vec<u8>,
    version: ProtocolVersion,
    local_key: LocalKey,
    key: LocalKey,
}

impl FakeDevice {
    pub async fn accept(listener: TcpListener, version: ProtocolVersion) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buffer: Vec::new(),
            version,
            local_key: local_key(),
            key: local_key(),
        }
    }

    /// Next frame from the client; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Received> {
        loop {
            let (frame, rest) = find_message_in_buffer(&self.buffer);
            let frame = frame.map(<[u8]>::to_vec);
            let rest_len = rest.len();
            if let Some(raw) = frame {
                let consumed = self.buffer.len() - rest_len;
                self.buffer.drain(..consumed);
                return Some(self.decode(raw));
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn decode(&self, raw: Vec<u8>) -> Received {
        let key = self.key_for(tuya_local::transport::peek_command(&raw));
        let mut msg = unpack_message(&raw, self.version, Some(&key)).unwrap();
        let (body, _) = open_payload(self.version, msg.cmd, &msg.payload, msg.retcode, &key);
        msg.payload = body;
        Received { raw, msg }
    }

    fn key_for(&self, cmd: Option<Command>) -> LocalKey {
        if cmd.is_some_and(Command::is_negotiation) {
            self.local_key.clone()
        } else {
            self.key.clone()
        }
    }

    /// Answer with a JSON body, sealed the way the device firmware would.
    pub async fn send(&mut self, cmd: Command, seqno: u32, json: &str) {
        let body = if cmd.is_header_exempt() || self.version == ProtocolVersion::V31 {
            json.as_bytes().to_vec()
        } else {
            [&self.version.header()[..], json.as_bytes()].concat()
        };
        let key = self.key_for(Some(cmd));
        let sealed = seal_payload(self.version, cmd, &body, &key).unwrap();
        self.send_bytes(cmd, seqno, sealed).await;
    }

    pub async fn send_bytes(&mut self, cmd: Command, seqno: u32, payload: Vec<u8>) {
        let key = self.key_for(Some(cmd));
        let msg = MessagePayload::new(cmd, payload);
        let frame = match self.version {
            ProtocolVersion::V35 => pack_message_6699(&msg, seqno, &key, Some(0)),
            ProtocolVersion::V34 => pack_message_55aa(&msg, seqno, Some(&key), Some(0)),
            _ => pack_message_55aa(&msg, seqno, None, Some(0)),
        }
        .unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Answer one `SESS_KEY_NEG_START` with a remote nonce picked by `remote`.
    pub async fn answer_negotiation_start(
        &mut self,
        remote: impl FnOnce(&[u8; NONCE_SIZE]) -> [u8; NONCE_SIZE],
    ) -> ([u8; NONCE_SIZE], [u8; NONCE_SIZE]) {
        let start = self.recv().await.unwrap();
        let local = start_nonce(&start);
        let remote = remote(&local);
        let mac = hmac_sha256(&self.local_key, &local).unwrap();
        self.reply_negotiation(&start, remote, mac).await;
        (local, remote)
    }

    /// Send `SESS_KEY_NEG_RESP` for `start` with an arbitrary HMAC.
    pub async fn reply_negotiation(
        &mut self,
        start: &Received,
        remote: [u8; NONCE_SIZE],
        mac: [u8; 32],
    ) {
        let body = [&remote[..], &mac[..]].concat();
        self.send_bytes(Command::SessKeyNegResp, start.msg.seqno, body).await;
    }

    /// Check the finish step and switch to the session key.
    pub async fn finish_negotiation(&mut self, local: [u8; NONCE_SIZE], remote: [u8; NONCE_SIZE]) {
        let finish = self.recv().await.unwrap();
        assert_eq!(finish.msg.command(), Some(Command::SessKeyNegFinish));
        assert!(finish.msg.crc_good);
        assert_eq!(
            finish.msg.payload,
            hmac_sha256(&self.local_key, &remote).unwrap().to_vec()
        );
        let key = derive_session_key(self.version, &self.local_key, &local, &remote).unwrap();
        self.key = LocalKey::from_bytes(key);
    }

    /// Full negotiation with a remote nonce that yields a usable key.
    pub async fn negotiate(&mut self) {
        let version = self.version;
        let device_key = self.local_key.clone();
        let (local, remote) = self
            .answer_negotiation_start(|local| {
                (0x40u8..)
                    .map(|b| [b; NONCE_SIZE])
                    .find(|remote| {
                        derive_session_key(version, &device_key, local, remote).unwrap()[0] != 0
                    })
                    .unwrap()
            })
            .await;
        self.finish_negotiation(local, remote).await;
    }

    pub fn session_key(&self) -> &LocalKey {
        &self.key
    }
}

/// Remote nonce that makes a 3.4 session key start with 0x00.
pub fn zero_key_remote_v34(device_key: &LocalKey, local: &[u8; NONCE_SIZE]) -> [u8; NONCE_SIZE] {
    let mut target = [0u8; NONCE_SIZE];
    for (i, b) in target.iter_mut().enumerate() {
        *b = (i as u8) * 0x11;
    }
    let mixed = AesCipher::from_key(device_key)
        .decrypt_ecb(&target, false)
        .unwrap();
    let mut remote = [0u8; NONCE_SIZE];
    for (out, (l, m)) in remote.iter_mut().zip(local.iter().zip(&mixed)) {
        *out = l ^ m;
    }
    remote
}

/// Local nonce carried by a `SESS_KEY_NEG_START` frame.
pub fn start_nonce(start: &Received) -> [u8; NONCE_SIZE] {
    assert_eq!(start.msg.command(), Some(Command::SessKeyNegStart));
    let mut local = [0u8; NONCE_SIZE];
    local.copy_from_slice(&start.msg.payload[..NONCE_SIZE]);
    local
}
