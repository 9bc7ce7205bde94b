//! EventAPI message envelope and opcodes.
//!
//! Every frame on the wire is a JSON object `{"op": <int>, "d": {...}}`.
//! [`parse_base_message`] reads the envelope without interpreting `d`;
//! typed payloads are produced on demand with [`Message::to_inner`].

use serde_json::Value;

use crate::json::JsonExt;

/// Wire-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Server → client: an event on a subscribed topic.
    Dispatch,
    /// Server → client: greeting carrying the heartbeat interval and session id.
    Hello,
    /// Server → client: keepalive.
    Heartbeat,
    /// Server → client: the client should reconnect.
    Reconnect,
    /// Server → client: a command was acknowledged.
    Ack,
    /// Server → client: a command failed.
    Error,
    /// Server → client: the server is closing the stream.
    EndOfStream,
    /// Client → server: authenticate.
    Identify,
    /// Client → server: resume a previous session.
    Resume,
    /// Client → server: subscribe to a topic.
    Subscribe,
    /// Client → server: unsubscribe from a topic.
    Unsubscribe,
    /// Client → server: signal presence.
    Signal,
}

impl Opcode {
    /// Numeric value on the wire.
    pub fn code(self) -> i64 {
        match self {
            Self::Dispatch => 0,
            Self::Hello => 1,
            Self::Heartbeat => 2,
            Self::Reconnect => 4,
            Self::Ack => 5,
            Self::Error => 6,
            Self::EndOfStream => 7,
            Self::Identify => 33,
            Self::Resume => 34,
            Self::Subscribe => 35,
            Self::Unsubscribe => 36,
            Self::Signal => 37,
        }
    }

    /// Map a wire value to an opcode. Unknown values yield `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Hello,
            2 => Self::Heartbeat,
            4 => Self::Reconnect,
            5 => Self::Ack,
            6 => Self::Error,
            7 => Self::EndOfStream,
            33 => Self::Identify,
            34 => Self::Resume,
            35 => Self::Subscribe,
            36 => Self::Unsubscribe,
            37 => Self::Signal,
            _ => return None,
        })
    }
}

/// Parsed top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Raw opcode as received. See [`Message::opcode`].
    pub op: i64,
    /// The `d` payload, or an empty object if absent.
    pub data: Value,
}

impl Message {
    /// The opcode, if it is one this client knows.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.op)
    }

    /// Build a typed payload from `d`.
    pub fn to_inner<'a, T>(&'a self) -> T
    where
        T: From<&'a Value>,
    {
        T::from(&self.data)
    }
}

/// Parse a frame envelope. Returns `None` if `text` is not a JSON object.
pub fn parse_base_message(text: &str) -> Option<Message> {
    let root: Value = serde_json::from_str(text).ok()?;
    if !root.is_object() {
        return None;
    }

    let op = root.i64_or_zero("op");
    let data = match root.field("d") {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    Some(Message { op, data })
}

/// Payload of a Hello frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Interval at which the server sends heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Server-assigned session id (may be empty).
    pub session_id: String,
}

impl From<&Value> for Hello {
    fn from(data: &Value) -> Self {
        Self {
            heartbeat_interval_ms: u64::try_from(data.i64_or_zero("heartbeat_interval"))
                .unwrap_or_default(),
            session_id: data.str_or_empty("session_id").to_string(),
        }
    }
}
