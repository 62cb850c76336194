//! Engine.IO v4 packet framing and the Socket.IO packets carried inside it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Separates packets in a long-polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet type {0:?}")]
    UnknownType(char),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed socket packet: {0}")]
    Socket(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl Packet {
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let body = chars.as_str();
        Ok(match kind {
            '0' => Packet::Open(serde_json::from_str(body)?),
            '1' => Packet::Close,
            '2' => Packet::Ping(body.to_string()),
            '3' => Packet::Pong(body.to_string()),
            '4' => Packet::Message(body.to_string()),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(h) => format!("0{}", serde_json::to_string(h).unwrap_or_default()),
            Packet::Close => "1".to_string(),
            Packet::Ping(d) => format!("2{d}"),
            Packet::Pong(d) => format!("3{d}"),
            Packet::Message(m) => format!("4{m}"),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
        }
    }
}

/// Splits a polling response body into packets. Bad records are reported
/// individually so one malformed packet does not cost the whole batch.
pub fn decode_payload(body: &str) -> Vec<Result<Packet, CodecError>> {
    body.split(RECORD_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(Packet::decode)
        .collect()
}

pub fn encode_payload(packets: &[Packet]) -> String {
    packets
        .iter()
        .map(Packet::encode)
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(Value),
}

impl SocketPacket {
    pub fn event(name: &str, data: Value) -> Self {
        SocketPacket::Event { name: name.to_string(), data }
    }

    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let mut rest = chars.as_str();

        // Only the default namespace is used; a "/ns," prefix is skipped.
        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(i) => &rest[i + 1..],
                None => "",
            };
        }
        // Ack ids precede the payload and are not used by this client.
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

        match kind {
            '0' => {
                let payload = if rest.is_empty() { None } else { Some(serde_json::from_str(rest)?) };
                Ok(SocketPacket::Connect(payload))
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let args: Vec<Value> = serde_json::from_str(rest)?;
                let mut args = args.into_iter();
                let name = match args.next() {
                    Some(Value::String(s)) => s,
                    _ => return Err(CodecError::Socket(format!("event without a name: {raw}"))),
                };
                Ok(SocketPacket::Event { name, data: args.next().unwrap_or(Value::Null) })
            }
            '4' => {
                let payload = if rest.is_empty() { Value::Null } else { serde_json::from_str(rest)? };
                Ok(SocketPacket::ConnectError(payload))
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(v)) => format!("0{v}"),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, data } => {
                let args = if data.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), data.clone()])
                };
                format!("2{args}")
            }
            SocketPacket::ConnectError(v) => format!("4{v}"),
        }
    }

    /// Wraps this packet in an Engine.IO message.
    pub fn into_packet(self) -> Packet {
        Packet::Message(self.encode())
    }
}

/// `<base>/socket.io/?EIO=4&transport=<transport>[&sid=<sid>]&t=<nonce>`
pub fn endpoint(base: &Url, transport: &str, sid: Option<&str>) -> anyhow::Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("server url cannot be a base: {}", base))?
        .pop_if_empty()
        .push("socket.io")
        .push("");
    {
        let mut q = url.query_pairs_mut();
        q.clear();
        q.append_pair("EIO", "4");
        q.append_pair("transport", transport);
        if let Some(sid) = sid {
            q.append_pair("sid", sid);
        }
        q.append_pair("t", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_packet_carries_handshake() {
        let raw = r#"0{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":5000}"#;
        match Packet::decode(raw).unwrap() {
            Packet::Open(h) => {
                assert_eq!(h.sid, "abc");
                assert_eq!(h.upgrades, vec!["websocket".to_string()]);
                assert_eq!(h.ping_timeout, 5000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ping_pong_keep_their_probe_data() {
        assert_eq!(Packet::decode("2probe").unwrap(), Packet::Ping("probe".into()));
        assert_eq!(Packet::Pong("probe".into()).encode(), "3probe");
    }

    #[test]
    fn unknown_and_empty_packets_are_errors() {
        assert!(matches!(Packet::decode(""), Err(CodecError::Empty)));
        assert!(matches!(Packet::decode("9"), Err(CodecError::UnknownType('9'))));
    }

    #[test]
    fn polling_payload_splits_on_record_separator() {
        let body = format!("2{RECORD_SEPARATOR}42[\"x\",1]{RECORD_SEPARATOR}zz");
        let packets = decode_payload(&body);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].as_ref().unwrap(), &Packet::Ping(String::new()));
        assert_eq!(packets[1].as_ref().unwrap(), &Packet::Message("2[\"x\",1]".into()));
        assert!(packets[2].is_err());

        let encoded = encode_payload(&[Packet::Pong(String::new()), Packet::Message("40".into())]);
        assert_eq!(encoded, format!("3{RECORD_SEPARATOR}440"));
    }

    #[test]
    fn socket_event_decodes_name_and_first_argument() {
        let p = SocketPacket::decode(r#"2["download_progress",{"current":1,"total":2}]"#).unwrap();
        assert_eq!(p, SocketPacket::event("download_progress", json!({"current":1,"total":2})));
    }

    #[test]
    fn socket_event_with_namespace_and_ack_id() {
        let p = SocketPacket::decode(r#"2/admin,13["ping"]"#).unwrap();
        assert_eq!(p, SocketPacket::Event { name: "ping".into(), data: Value::Null });
    }

    #[test]
    fn connect_ack_and_connect_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"s1"}"#).unwrap(),
            SocketPacket::Connect(Some(json!({"sid":"s1"})))
        );
        assert_eq!(SocketPacket::decode("0").unwrap(), SocketPacket::Connect(None));
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"nope"}"#).unwrap(),
            SocketPacket::ConnectError(json!({"message":"nope"}))
        );
    }

    #[test]
    fn event_encoding_wraps_in_message() {
        let packet = SocketPacket::event("test_connection", json!({"message": "hi"})).into_packet();
        assert_eq!(packet.encode(), r#"42["test_connection",{"message":"hi"}]"#);
    }

    #[test]
    fn nameless_event_is_rejected() {
        assert!(matches!(SocketPacket::decode("2[1,2]"), Err(CodecError::Socket(_))));
    }

    #[test]
    fn endpoint_points_at_socket_io_root() {
        let base = Url::parse("http://localhost:8000").unwrap();
        let url = endpoint(&base, "polling", Some("abc")).unwrap();
        assert_eq!(url.path(), "/socket.io/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("EIO".to_string(), "4".to_string()));
        assert_eq!(pairs[1], ("transport".to_string(), "polling".to_string()));
        assert_eq!(pairs[2], ("sid".to_string(), "abc".to_string()));
        assert_eq!(pairs[3].0, "t");

        let nested = Url::parse("http://host/app/").unwrap();
        assert_eq!(endpoint(&nested, "websocket", None).unwrap().path(), "/app/socket.io/");
    }
}
