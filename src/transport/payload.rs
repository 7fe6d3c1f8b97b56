//! Command payload generation and per-version body sealing.
//!
//! A command's JSON body comes from a template chosen first by protocol
//! version, then by device type. Some templates redirect the command to a
//! newer code (`CONTROL` becomes `CONTROL_NEW` from 3.4 on). The generated
//! body is then sealed for the wire by [`seal_payload`] and opened again on
//! receipt by [`open_payload`].

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde_json::{Map, Value, json};

use super::message::MessagePayload;
use crate::core::{
    AES_KEY_SIZE, Command, CryptoError, DeviceType, Dps, ProtocolVersion, RETCODE_SIZE,
    UPDATE_DPS_WHITELIST,
};
use crate::crypto::{AesCipher, LocalKey};

// =============================================================================
// TEMPLATE TABLE
// =============================================================================

/// A placeholder in a command template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateField {
    /// `"gwId"`: gateway id, defaults to the device id.
    GwId,
    /// `"devId"`: device id.
    DevId,
    /// `"uid"`: user id, defaults to the device id.
    Uid,
    /// `"t"`: unix time in seconds, as a string.
    Timestamp,
    /// `"dpId"`: datapoint ids to refresh.
    DpId,
    /// `"protocol": 5`.
    Protocol,
    /// `"data"`: replaced by `{"dps": ...}` for control commands.
    Data,
}

impl TemplateField {
    /// JSON key of this field.
    pub fn key(self) -> &'static str {
        match self {
            TemplateField::GwId => "gwId",
            TemplateField::DevId => "devId",
            TemplateField::Uid => "uid",
            TemplateField::Timestamp => "t",
            TemplateField::DpId => "dpId",
            TemplateField::Protocol => "protocol",
            TemplateField::Data => "data",
        }
    }
}

/// How to build one command's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Command code actually sent, when it differs from the requested one.
    pub command_override: Option<Command>,
    /// Fields in serialization order.
    pub fields: &'static [TemplateField],
}

use TemplateField::*;

const QUERY_FIELDS: &[TemplateField] = &[GwId, DevId, Uid, Timestamp];
const CONTROL_FIELDS: &[TemplateField] = &[DevId, Uid, Timestamp];
const GATEWAY_FIELDS: &[TemplateField] = &[GwId, DevId];
const DPID_FIELDS: &[TemplateField] = &[DpId];
const CONTROL_NEW_FIELDS: &[TemplateField] = &[Protocol, Timestamp, Data];

const fn template(fields: &'static [TemplateField]) -> CommandTemplate {
    CommandTemplate {
        command_override: None,
        fields,
    }
}

const fn redirect(cmd: Command, fields: &'static [TemplateField]) -> CommandTemplate {
    CommandTemplate {
        command_override: Some(cmd),
        fields,
    }
}

fn version_template(version: ProtocolVersion, cmd: Command) -> Option<CommandTemplate> {
    use ProtocolVersion::*;
    match (version, cmd) {
        (V34 | V35, Command::Control) => Some(redirect(Command::ControlNew, CONTROL_NEW_FIELDS)),
        (V34, Command::DpQuery) => Some(redirect(Command::DpQueryNew, &[])),
        (V35, Command::DpQuery) => Some(redirect(Command::DpQueryNew, CONTROL_FIELDS)),
        _ => None,
    }
}

fn device_type_template(dev_type: DeviceType, cmd: Command) -> Option<CommandTemplate> {
    match (dev_type, cmd) {
        (DeviceType::Type0d, Command::DpQuery) => {
            Some(redirect(Command::ControlNew, CONTROL_FIELDS))
        }
        (_, Command::ApConfig | Command::DpQuery) => Some(template(QUERY_FIELDS)),
        (_, Command::Control | Command::ControlNew | Command::DpQueryNew) => {
            Some(template(CONTROL_FIELDS))
        }
        (_, Command::Status | Command::HeartBeat) => Some(template(GATEWAY_FIELDS)),
        (_, Command::UpdateDps) => Some(template(DPID_FIELDS)),
        _ => None,
    }
}

/// Template for a command: version overrides first, then the device type.
///
/// `None` means the combination has no template; such commands are sent
/// as `{}` under their own code.
pub fn lookup_template(
    version: ProtocolVersion,
    dev_type: DeviceType,
    cmd: Command,
) -> Option<CommandTemplate> {
    version_template(version, cmd).or_else(|| device_type_template(dev_type, cmd))
}

// =============================================================================
// GENERATOR
// =============================================================================

/// Builds command payloads for one device.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    dev_id: String,
    gw_id: Option<String>,
    uid: Option<String>,
    version: ProtocolVersion,
    dev_type: DeviceType,
    local_key: Option<LocalKey>,
}

impl PayloadGenerator {
    /// Generator for a device; gateway and user id default to the device id.
    pub fn new(dev_id: impl Into<String>, version: ProtocolVersion, dev_type: DeviceType) -> Self {
        Self {
            dev_id: dev_id.into(),
            gw_id: None,
            uid: None,
            version,
            dev_type,
            local_key: None,
        }
    }

    /// Key for the protocol 3.1 MD5 header.
    pub fn with_local_key(mut self, key: LocalKey) -> Self {
        self.local_key = Some(key);
        self
    }

    /// Override the gateway id (sub-devices behind a hub).
    pub fn with_gateway_id(mut self, gw_id: impl Into<String>) -> Self {
        self.gw_id = Some(gw_id.into());
        self
    }

    /// Override the user id.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Protocol version payloads are built for.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switch protocol version.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Device type payloads are built for.
    pub fn dev_type(&self) -> DeviceType {
        self.dev_type
    }

    /// Switch device type.
    pub fn set_dev_type(&mut self, dev_type: DeviceType) {
        self.dev_type = dev_type;
    }

    /// Build the payload for `cmd`.
    ///
    /// `dps` are the datapoints to set (control commands) or to ask for
    /// (query commands); `dp_ids` replaces the default `UPDATEDPS` list.
    pub fn generate(
        &self,
        cmd: Command,
        dps: Option<&Dps>,
        dp_ids: Option<&[u32]>,
    ) -> MessagePayload {
        let template = lookup_template(self.version, self.dev_type, cmd);
        let actual = template.and_then(|t| t.command_override).unwrap_or(cmd);
        let fields = template.map(|t| t.fields).unwrap_or_default();

        let body = self.build_json(cmd, fields, dps, dp_ids);
        MessagePayload::new(actual, self.encode(actual, body.to_string().into_bytes()))
    }

    fn build_json(
        &self,
        cmd: Command,
        fields: &[TemplateField],
        dps: Option<&Dps>,
        dp_ids: Option<&[u32]>,
    ) -> Value {
        let mut body = Map::new();
        for field in fields {
            let value = match field {
                GwId => json!(self.gw_id.as_deref().unwrap_or(&self.dev_id)),
                DevId => json!(self.dev_id),
                Uid => json!(self.uid.as_deref().unwrap_or(&self.dev_id)),
                Timestamp => json!(unix_time().to_string()),
                DpId => json!(dp_ids.unwrap_or(&UPDATE_DPS_WHITELIST)),
                Protocol => json!(5),
                Data => json!(""),
            };
            body.insert(field.key().to_string(), value);
        }

        if let Some(dps) = dps {
            match cmd {
                Command::Control | Command::ControlNew => {
                    if self.version >= ProtocolVersion::V34 {
                        body.insert("data".into(), json!({ "dps": dps }));
                    } else {
                        body.insert("dps".into(), Value::Object(dps.clone()));
                    }
                }
                Command::DpQuery | Command::DpQueryNew | Command::Status => {
                    body.insert("dps".into(), Value::Object(dps.clone()));
                }
                _ => {}
            }
        }
        Value::Object(body)
    }

    fn encode(&self, cmd: Command, json: Vec<u8>) -> Vec<u8> {
        if cmd.is_header_exempt() {
            return json;
        }
        if self.version >= ProtocolVersion::V33 {
            let mut out = self.version.header().to_vec();
            out.extend_from_slice(&json);
            return out;
        }
        match &self.local_key {
            Some(key) => {
                let mut hasher = Md5::new();
                hasher.update(&json);
                hasher.update(key.as_bytes());
                let mut out = hasher.finalize().to_vec();
                out.extend_from_slice(&json);
                out
            }
            None => json,
        }
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `UPDATEDPS` body for an explicit id list: `{"dpId":[...]}`.
pub fn update_dps_payload(dp_ids: &[u32]) -> MessagePayload {
    MessagePayload::new(
        Command::UpdateDps,
        json!({ "dpId": dp_ids }).to_string().into_bytes(),
    )
}

// =============================================================================
// SEALING
// =============================================================================

/// Encrypt a generated body for the wire.
///
/// - 3.1: unchanged.
/// - 3.3: AES-ECB; a leading version header stays in clear.
/// - 3.4: AES-ECB over the whole body, header included.
/// - 3.5: unchanged (the GCM envelope encrypts).
///
/// Negotiation bodies are never encrypted here.
pub fn seal_payload(
    version: ProtocolVersion,
    cmd: Command,
    body: &[u8],
    key: &LocalKey,
) -> Result<Vec<u8>, CryptoError> {
    if cmd.is_negotiation() {
        return Ok(body.to_vec());
    }
    let cipher = AesCipher::from_key(key);
    match version {
        ProtocolVersion::V31 | ProtocolVersion::V35 => Ok(body.to_vec()),
        ProtocolVersion::V33 => {
            let header = version.header();
            match body.strip_prefix(&header[..]) {
                Some(json) => {
                    let mut out = header.to_vec();
                    out.extend(cipher.encrypt_ecb(json, true)?);
                    Ok(out)
                }
                None => cipher.encrypt_ecb(body, true),
            }
        }
        ProtocolVersion::V34 => cipher.encrypt_ecb(body, true),
    }
}

/// Recover the plaintext JSON of a received body.
///
/// Strips a recognized return code, the version header and ECB encryption
/// where they apply. Negotiation bodies are returned untouched (the
/// negotiator handles their optional return code itself). Block-aligned
/// 3.3/3.4 bodies are always decrypted; the raw body is kept only when it
/// is complete JSON and the decryption is not. A body that does not decrypt
/// is returned as-is; the error is reported alongside so the caller can
/// log it.
pub fn open_payload(
    version: ProtocolVersion,
    cmd: u32,
    payload: &[u8],
    retcode: Option<u32>,
    key: &LocalKey,
) -> (Vec<u8>, Option<CryptoError>) {
    if Command::from_u32(cmd).is_some_and(Command::is_negotiation) {
        return (payload.to_vec(), None);
    }
    let mut body = match retcode {
        Some(_) if payload.len() >= RETCODE_SIZE => &payload[RETCODE_SIZE..],
        _ => payload,
    };

    let header = version.header();
    if let Some(rest) = body.strip_prefix(&header[..]) {
        body = rest;
    }

    let needs_ecb = matches!(version, ProtocolVersion::V33 | ProtocolVersion::V34)
        && !body.is_empty()
        && body.len() % AES_KEY_SIZE == 0;
    if !needs_ecb {
        return (body.to_vec(), None);
    }

    // ciphertext may start with `{` too; only a body that parses whole is plaintext
    let plain_json = is_json(body);
    match AesCipher::from_key(key).decrypt_ecb(body, true) {
        Ok(plain) => {
            let plain = match plain.strip_prefix(&header[..]) {
                Some(json) => json.to_vec(),
                None => plain,
            };
            if plain_json && !is_json(&plain) {
                return (body.to_vec(), None);
            }
            (plain, None)
        }
        Err(_) if plain_json => (body.to_vec(), None),
        Err(err) => (body.to_vec(), Some(err)),
    }
}

fn is_json(body: &[u8]) -> bool {
    body.first() == Some(&b'{') && serde_json::from_slice::<Value>(body).is_ok()
}

// =============================================================================
// STATUS PARSING
// =============================================================================

/// Extract the datapoint map from a decrypted status body.
///
/// Accepts `{"dps":{...}}`, `{"data":{"dps":{...}}}` and `{"data":{...}}`,
/// starting at the first `{` of the body.
pub fn parse_status_response(payload: &[u8]) -> Option<Dps> {
    let start = payload.iter().position(|b| *b == b'{')?;
    let value: Value = match serde_json::from_slice(&payload[start..]) {
        Ok(value) => value,
        Err(err) => {
            log::debug!("failed to parse status response: {err}");
            return None;
        }
    };

    let Value::Object(mut root) = value else {
        return None;
    };
    if let Some(Value::Object(dps)) = root.remove("dps") {
        return Some(dps);
    }
    match root.remove("data") {
        Some(Value::Object(mut data)) => match data.remove("dps") {
            Some(Value::Object(dps)) => Some(dps),
            Some(_) => None,
            None => Some(data),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PROTOCOL_HEADER_SIZE;

    const DEV: &str = "bf0123456789abcdef";

    fn key() -> LocalKey {
        LocalKey::from_bytes(*b"0123456789ABCDEF")
    }

    fn json_of(payload: &[u8]) -> Value {
        let start = payload.iter().position(|b| *b == b'{').unwrap();
        serde_json::from_slice(&payload[start..]).unwrap()
    }

    fn dps(value: Value) -> Dps {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_template_lookup_order() {
        use ProtocolVersion::*;
        let t = lookup_template(V34, DeviceType::Type0a, Command::Control).unwrap();
        assert_eq!(t.command_override, Some(Command::ControlNew));
        assert_eq!(t.fields, CONTROL_NEW_FIELDS);

        let t = lookup_template(V33, DeviceType::Type0d, Command::DpQuery).unwrap();
        assert_eq!(t.command_override, Some(Command::ControlNew));

        let t = lookup_template(V35, DeviceType::Type0d, Command::DpQuery).unwrap();
        assert_eq!(t.command_override, Some(Command::DpQueryNew));

        let t = lookup_template(V34, DeviceType::Type0a, Command::DpQuery).unwrap();
        assert!(t.fields.is_empty());

        assert_eq!(lookup_template(V33, DeviceType::Type0a, Command::SceneExecute), None);
    }

    #[test]
    fn test_dp_query_v33() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V33, DeviceType::Type0a);
        let msg = generator.generate(Command::DpQuery, None, None);
        assert_eq!(msg.cmd, Command::DpQuery);
        // header-exempt
        assert_eq!(msg.payload[0], b'{');
        let body = json_of(&msg.payload);
        assert_eq!(body["gwId"], DEV);
        assert_eq!(body["devId"], DEV);
        assert_eq!(body["uid"], DEV);
        assert!(body["t"].as_str().unwrap().parse::<u64>().is_ok());
    }

    #[test]
    fn test_control_v33_has_header_and_flat_dps() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V33, DeviceType::Type0a);
        let msg = generator.generate(Command::Control, Some(&dps(json!({"1": true}))), None);
        assert_eq!(msg.cmd, Command::Control);
        assert_eq!(&msg.payload[..PROTOCOL_HEADER_SIZE], &ProtocolVersion::V33.header());
        let body = json_of(&msg.payload);
        assert_eq!(body["dps"]["1"], true);
        assert!(body.get("data").is_none());
    }

    #[test]
    fn test_control_v35_nested_dps() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V35, DeviceType::Type0a);
        let msg = generator.generate(Command::Control, Some(&dps(json!({"1": true}))), None);
        assert_eq!(msg.cmd, Command::ControlNew);
        assert_eq!(&msg.payload[..3], b"3.5");
        let body = json_of(&msg.payload);
        assert_eq!(body["protocol"], 5);
        assert_eq!(body["data"]["dps"]["1"], true);
        assert!(body.get("devId").is_none());
    }

    #[test]
    fn test_update_dps_default_and_explicit() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V33, DeviceType::Type0a);
        let msg = generator.generate(Command::UpdateDps, None, None);
        assert_eq!(msg.payload, br#"{"dpId":[18,19,20]}"#);
        let msg = generator.generate(Command::UpdateDps, None, Some(&[1, 2]));
        assert_eq!(msg.payload, br#"{"dpId":[1,2]}"#);
        assert_eq!(update_dps_payload(&[4]).payload, br#"{"dpId":[4]}"#);
    }

    #[test]
    fn test_heartbeat_payload() {
        let generator = PayloadGenerator::new("dev", ProtocolVersion::V34, DeviceType::Type0a)
            .with_gateway_id("gw");
        let msg = generator.generate(Command::HeartBeat, None, None);
        assert_eq!(msg.payload, br#"{"gwId":"gw","devId":"dev"}"#);
    }

    #[test]
    fn test_unknown_template_is_empty_object() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V33, DeviceType::Type0a);
        let msg = generator.generate(Command::SceneExecute, None, None);
        assert_eq!(msg.cmd, Command::SceneExecute);
        assert_eq!(&msg.payload[PROTOCOL_HEADER_SIZE..], b"{}");
    }

    #[test]
    fn test_v31_md5_header() {
        let generator = PayloadGenerator::new("dev", ProtocolVersion::V31, DeviceType::Type0a)
            .with_local_key(key());
        let msg = generator.generate(Command::Status, None, None);
        let json = br#"{"gwId":"dev","devId":"dev"}"#;
        let mut hasher = Md5::new();
        hasher.update(json);
        hasher.update(key().as_bytes());
        assert_eq!(&msg.payload[..16], &hasher.finalize()[..]);
        assert_eq!(&msg.payload[16..], json);
    }

    #[test]
    fn test_seal_open_v33() {
        let generator = PayloadGenerator::new(DEV, ProtocolVersion::V33, DeviceType::Type0a);
        let msg = generator.generate(Command::Control, Some(&dps(json!({"1": false}))), None);
        let sealed = seal_payload(ProtocolVersion::V33, msg.cmd, &msg.payload, &key()).unwrap();
        assert_eq!(&sealed[..3], b"3.3");
        assert_eq!((sealed.len() - PROTOCOL_HEADER_SIZE) % 16, 0);

        let (opened, err) = open_payload(ProtocolVersion::V33, msg.cmd.as_u32(), &sealed, None, &key());
        assert!(err.is_none());
        assert_eq!(opened, &msg.payload[PROTOCOL_HEADER_SIZE..]);
    }

    #[test]
    fn test_seal_open_v34_with_retcode() {
        let body = b"3.4\0\0\0\0\0\0\0\0\0\0\0\0{\"dps\":{\"2\":7}}";
        let sealed = seal_payload(ProtocolVersion::V34, Command::ControlNew, body, &key()).unwrap();
        let mut with_code = vec![0, 0, 0, 0];
        with_code.extend_from_slice(&sealed);
        let (opened, err) = open_payload(
            ProtocolVersion::V34,
            Command::Status.as_u32(),
            &with_code,
            Some(0),
            &key(),
        );
        assert!(err.is_none());
        assert_eq!(opened, br#"{"dps":{"2":7}}"#);
    }

    #[test]
    fn test_negotiation_never_sealed() {
        let nonce = [7u8; 16];
        let sealed = seal_payload(ProtocolVersion::V34, Command::SessKeyNegStart, &nonce, &key()).unwrap();
        assert_eq!(sealed, nonce);
    }

    #[test]
    fn test_open_plain_json_untouched() {
        let (opened, err) = open_payload(
            ProtocolVersion::V35,
            Command::Status.as_u32(),
            b"3.5\0\0\0\0\0\0\0\0\0\0\0\0{\"dps\":{}}",
            None,
            &key(),
        );
        assert!(err.is_none());
        assert_eq!(opened, br#"{"dps":{}}"#);
    }

    #[test]
    fn test_open_ciphertext_starting_with_brace() {
        let body = br#"{"dps":{"1":23}}"#;
        let sealed = seal_payload(ProtocolVersion::V33, Command::DpQuery, body, &key()).unwrap();
        assert_eq!(sealed[0], b'{');

        let (opened, err) = open_payload(
            ProtocolVersion::V33,
            Command::DpQuery.as_u32(),
            &sealed,
            None,
            &key(),
        );
        assert!(err.is_none());
        assert_eq!(opened, body);
        assert_eq!(parse_status_response(&opened).unwrap()["1"], 23);
    }

    #[test]
    fn test_open_unencrypted_json_v33() {
        let body = br#"{"dps":{"1":10}}"#;
        assert_eq!(body.len() % 16, 0);
        let (opened, err) = open_payload(
            ProtocolVersion::V33,
            Command::Status.as_u32(),
            body,
            None,
            &key(),
        );
        assert!(err.is_none());
        assert_eq!(opened, body);
    }

    #[test]
    fn test_parse_status_shapes() {
        let flat = parse_status_response(br#"{"devId":"x","dps":{"1":true,"2":10}}"#).unwrap();
        assert_eq!(flat["2"], 10);

        let nested = parse_status_response(br#"{"protocol":4,"data":{"dps":{"1":false}}}"#).unwrap();
        assert_eq!(nested["1"], false);

        let bare = parse_status_response(br#"{"data":{"20":"white"}}"#).unwrap();
        assert_eq!(bare["20"], "white");

        let prefixed = parse_status_response(b"\x00\x00junk{\"dps\":{\"3\":1}}").unwrap();
        assert_eq!(prefixed["3"], 1);

        assert!(parse_status_response(b"no json").is_none());
        assert!(parse_status_response(b"{broken").is_none());
        assert!(parse_status_response(br#"{"t":1}"#).is_none());
    }
}
