//! Newline-delimited JSON wire protocol.
//!
//! Frame format: one compact JSON object per line, `\n` terminated.
//! Every frame carries `id`, `type` and `body`; `payloadSize` and
//! `payloadTransferInfo` are present iff a bulk payload accompanies the
//! message on a separate payload channel.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Protocol version announced in identity messages.
pub const PROTOCOL_VERSION: u32 = 7;
/// Peers announcing at least this version get a TLS upgrade on every channel.
pub const MIN_VERSION_WITH_TLS: u32 = 6;

/// Maximum accepted frame length (prevents memory exhaustion from a
/// misbehaving peer).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const IDENTITY_TYPE: &str = "tether.identity";
pub const PAIRING_TYPE: &str = "tether.pair";
pub const KEEPALIVE_TYPE: &str = "tether.keepalive";
pub const PING_TYPE: &str = "tether.ping";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge(usize),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has wrong type")]
    InvalidField(&'static str),
}

/// Body field lookup outcome. `Absent` and `Malformed` are deliberately
/// distinct: a missing optional field is not the same failure as a present
/// field of the wrong type, and callers must be able to tell them apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("field `{0}` is absent")]
    Absent(String),
    #[error("field `{0}` is malformed")]
    Malformed(String),
}

pub type Body = Map<String, Value>;

/// One protocol unit. The bulk payload itself never travels inside the
/// message; `payload_info` only references the side channel carrying it.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub id: i64,
    pub ty: String,
    pub body: Body,
    pub payload_size: Option<i64>,
    pub payload_info: Option<Body>,
}

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Message ids are milliseconds since the epoch, bumped when two messages
/// are created within the same millisecond so ids stay unique per process.
fn next_message_id() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut prev = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_ID.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(p) => prev = p,
        }
    }
}

impl WireMessage {
    pub fn new(ty: impl Into<String>, body: Body) -> Self {
        Self {
            id: next_message_id(),
            ty: ty.into(),
            body,
            payload_size: None,
            payload_info: None,
        }
    }

    pub fn has_payload(&self) -> bool {
        self.payload_info.is_some()
    }

    /// Serialize as a compact JSON line, trailing `\n` included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::from(self.id));
        obj.insert("type".into(), Value::from(self.ty.clone()));
        obj.insert("body".into(), Value::Object(self.body.clone()));
        if let Some(info) = &self.payload_info {
            obj.insert("payloadSize".into(), Value::from(self.payload_size.unwrap_or(-1)));
            obj.insert("payloadTransferInfo".into(), Value::Object(info.clone()));
        }
        let mut bytes = serde_json::to_vec(&Value::Object(obj))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse one frame. `id` accepts either a JSON number or a numeric
    /// string - some peer implementations send it stringified.
    pub fn decode(frame: &str) -> Result<Self, WireError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(frame.len()));
        }
        let value: Value = serde_json::from_str(frame)?;
        let obj = value.as_object().ok_or(WireError::NotAnObject)?;

        let id = match obj.get("id") {
            Some(Value::Number(n)) => n.as_i64().ok_or(WireError::InvalidField("id"))?,
            Some(Value::String(s)) => s.parse::<i64>().map_err(|_| WireError::InvalidField("id"))?,
            Some(_) => return Err(WireError::InvalidField("id")),
            None => return Err(WireError::MissingField("id")),
        };
        let ty = match obj.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(WireError::InvalidField("type")),
            None => return Err(WireError::MissingField("type")),
        };
        let body = match obj.get("body") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(WireError::InvalidField("body")),
            None => return Err(WireError::MissingField("body")),
        };

        let mut message = Self { id, ty, body, payload_size: None, payload_info: None };
        if let Some(Value::Object(info)) = obj.get("payloadTransferInfo") {
            message.payload_info = Some(info.clone());
            if let Some(size) = obj.get("payloadSize").and_then(Value::as_i64) {
                message.payload_size = (size > 0).then_some(size);
            }
        }
        Ok(message)
    }

    // Body accessors. Every accessor reports `Absent` and `Malformed`
    // separately instead of collapsing both into one "missing" case.

    pub fn body_str(&self, name: &str) -> Result<&str, FieldError> {
        match self.body.get(name) {
            None => Err(FieldError::Absent(name.into())),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(FieldError::Malformed(name.into())),
        }
    }

    pub fn body_i64(&self, name: &str) -> Result<i64, FieldError> {
        match self.body.get(name) {
            None => Err(FieldError::Absent(name.into())),
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| FieldError::Malformed(name.into())),
            Some(_) => Err(FieldError::Malformed(name.into())),
        }
    }

    pub fn body_bool(&self, name: &str) -> Result<bool, FieldError> {
        match self.body.get(name) {
            None => Err(FieldError::Absent(name.into())),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(FieldError::Malformed(name.into())),
        }
    }

    pub fn body_str_list(&self, name: &str) -> Result<Vec<String>, FieldError> {
        match self.body.get(name) {
            None => Err(FieldError::Absent(name.into())),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(FieldError::Malformed(name.into())),
                })
                .collect(),
            Some(_) => Err(FieldError::Malformed(name.into())),
        }
    }

    // Pairing view

    pub fn is_pairing(&self) -> bool {
        self.ty == PAIRING_TYPE
    }

    pub fn pair_flag(&self) -> Result<bool, FieldError> {
        if !self.is_pairing() {
            return Err(FieldError::Malformed("type".into()));
        }
        self.body_bool("pair")
    }

    pub fn pair(flag: bool) -> Self {
        let mut body = Body::new();
        body.insert("pair".into(), Value::Bool(flag));
        Self::new(PAIRING_TYPE, body)
    }

    pub fn keepalive() -> Self {
        Self::new(KEEPALIVE_TYPE, Body::new())
    }
}

/// Supported device classes. Unrecognized classes decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Desktop,
    Laptop,
    Phone,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            _ => DeviceType::Unknown,
        }
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("not an identity message (type `{0}`)")]
    WrongType(String),
    #[error("identity field invalid: {0}")]
    Field(#[from] FieldError),
}

/// The parsed view of an identity message: who a peer claims to be.
/// Immutable once applied to a link.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub tcp_port: Option<u16>,
    pub incoming_capabilities: HashSet<String>,
    pub outgoing_capabilities: HashSet<String>,
}

impl Identity {
    pub fn from_message(message: &WireMessage) -> Result<Self, IdentityError> {
        if message.ty != IDENTITY_TYPE {
            return Err(IdentityError::WrongType(message.ty.clone()));
        }
        let device_id = message.body_str("deviceId")?.to_string();
        let device_name = message.body_str("deviceName")?.to_string();
        let device_type = DeviceType::parse(message.body_str("deviceType")?);
        let protocol_version = message.body_i64("protocolVersion")? as u32;
        // tcpPort is mandatory in UDP announcements but absent on identity
        // frames sent over an already-established TCP stream.
        let tcp_port = match message.body_i64("tcpPort") {
            Ok(p) if (1..=i64::from(u16::MAX)).contains(&p) => Some(p as u16),
            Ok(_) => return Err(IdentityError::Field(FieldError::Malformed("tcpPort".into()))),
            Err(FieldError::Absent(_)) => None,
            Err(e @ FieldError::Malformed(_)) => return Err(IdentityError::Field(e)),
        };
        let incoming_capabilities =
            message.body_str_list("incomingCapabilities")?.into_iter().collect();
        let outgoing_capabilities =
            message.body_str_list("outgoingCapabilities")?.into_iter().collect();
        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            tcp_port,
            incoming_capabilities,
            outgoing_capabilities,
        })
    }

    pub fn supports_tls(&self) -> bool {
        self.protocol_version >= MIN_VERSION_WITH_TLS
    }

    pub fn to_message(&self) -> WireMessage {
        let mut body = Body::new();
        body.insert("deviceId".into(), Value::from(self.device_id.clone()));
        body.insert("deviceName".into(), Value::from(self.device_name.clone()));
        body.insert("deviceType".into(), Value::from(self.device_type.as_str()));
        body.insert("protocolVersion".into(), Value::from(self.protocol_version));
        if let Some(port) = self.tcp_port {
            body.insert("tcpPort".into(), Value::from(port));
        }
        let mut incoming: Vec<&String> = self.incoming_capabilities.iter().collect();
        incoming.sort();
        let mut outgoing: Vec<&String> = self.outgoing_capabilities.iter().collect();
        outgoing.sort();
        body.insert(
            "incomingCapabilities".into(),
            Value::Array(incoming.into_iter().map(|c| Value::from(c.clone())).collect()),
        );
        body.insert(
            "outgoingCapabilities".into(),
            Value::Array(outgoing.into_iter().map(|c| Value::from(c.clone())).collect()),
        );
        WireMessage::new(IDENTITY_TYPE, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WireMessage {
        let mut body = Body::new();
        body.insert("text".into(), Value::from("hello"));
        body.insert("count".into(), Value::from(3));
        WireMessage::new("tether.sample", body)
    }

    #[test]
    fn roundtrip_preserves_core_fields() {
        let mut msg = sample();
        msg.payload_size = Some(42);
        msg.payload_info = {
            let mut info = Body::new();
            info.insert("port".into(), Value::from(1739));
            Some(info)
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let decoded = WireMessage::decode(std::str::from_utf8(&bytes).unwrap().trim_end()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_accepts_stringified_id() {
        let msg = WireMessage::decode(r#"{"id":"12345","type":"t","body":{}}"#).unwrap();
        assert_eq!(msg.id, 12345);
    }

    #[test]
    fn decode_rejects_missing_and_mistyped_fields() {
        assert!(matches!(
            WireMessage::decode(r#"{"type":"t","body":{}}"#),
            Err(WireError::MissingField("id"))
        ));
        assert!(matches!(
            WireMessage::decode(r#"{"id":1,"type":7,"body":{}}"#),
            Err(WireError::InvalidField("type"))
        ));
        assert!(matches!(
            WireMessage::decode(r#"{"id":1,"type":"t","body":[]}"#),
            Err(WireError::InvalidField("body"))
        ));
        assert!(matches!(WireMessage::decode("[1,2]"), Err(WireError::NotAnObject)));
    }

    #[test]
    fn nonpositive_payload_size_decodes_as_unknown() {
        let msg = WireMessage::decode(
            r#"{"id":1,"type":"t","body":{},"payloadSize":-1,"payloadTransferInfo":{"port":1740}}"#,
        )
        .unwrap();
        assert!(msg.has_payload());
        assert_eq!(msg.payload_size, None);
    }

    #[test]
    fn field_accessors_distinguish_absent_from_malformed() {
        let msg = sample();
        assert_eq!(msg.body_str("text"), Ok("hello"));
        assert!(matches!(msg.body_str("missing"), Err(FieldError::Absent(_))));
        assert!(matches!(msg.body_str("count"), Err(FieldError::Malformed(_))));
        assert!(matches!(msg.body_bool("count"), Err(FieldError::Malformed(_))));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = WireMessage::new("t", Body::new());
        let b = WireMessage::new("t", Body::new());
        assert_ne!(a.id, b.id);
        assert!(b.id > a.id);
    }

    #[test]
    fn identity_roundtrip() {
        let identity = Identity {
            device_id: "abc123".into(),
            device_name: "Workbench".into(),
            device_type: DeviceType::Desktop,
            protocol_version: PROTOCOL_VERSION,
            tcp_port: Some(1717),
            incoming_capabilities: ["tether.ping".to_string()].into_iter().collect(),
            outgoing_capabilities: ["tether.ping".to_string()].into_iter().collect(),
        };
        let parsed = Identity::from_message(&identity.to_message()).unwrap();
        assert_eq!(parsed.device_id, identity.device_id);
        assert_eq!(parsed.device_type, DeviceType::Desktop);
        assert_eq!(parsed.tcp_port, Some(1717));
        assert!(parsed.supports_tls());
    }

    #[test]
    fn identity_rejects_wrong_type() {
        assert!(matches!(
            Identity::from_message(&sample()),
            Err(IdentityError::WrongType(_))
        ));
    }

    #[test]
    fn pair_flag_helpers() {
        assert_eq!(WireMessage::pair(true).pair_flag(), Ok(true));
        assert_eq!(WireMessage::pair(false).pair_flag(), Ok(false));
        assert!(sample().pair_flag().is_err());
    }
}
