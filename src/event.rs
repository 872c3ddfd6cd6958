use crate::config::PROTOCOL_VERSION;
use crate::error::RpcError;
use rmpv::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub const EV_OK: &str = "OK";
pub const EV_ERR: &str = "ERR";
pub const EV_STREAM: &str = "STREAM";
pub const EV_STREAM_DONE: &str = "STREAM_DONE";
/// Liveness heartbeat, absorbed by the channel and never surfaced.
pub const EV_HEARTBEAT: &str = "_zpc_hb";
/// Credit grant: single integer arg, the number of further stream
/// chunks the peer may send before the next grant.
pub const EV_MORE: &str = "_zpc_more";
/// Event names under this prefix are reserved for the protocol.
pub const RESERVED_PREFIX: &str = "_zpc_";

pub const HDR_MESSAGE_ID: &str = "message_id";
pub const HDR_RESPONSE_TO: &str = "response_to";
pub const HDR_VERSION: &str = "v";

/// One protocol message: header mapping, event name, positional args.
///
/// On the wire an event is a single MessagePack array
/// `[header_map, name, arg0, arg1, ...]` with the args spread into the
/// outer array.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub header: HashMap<String, Value>,
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    /// New event with a fresh UUIDv4 `message_id` and the protocol
    /// version stamped into the header.
    pub fn new(name: &str, args: Vec<Value>) -> Self {
        let mut header = HashMap::with_capacity(2);
        header.insert(HDR_MESSAGE_ID.to_string(), Value::from(Uuid::new_v4().to_string()));
        header.insert(HDR_VERSION.to_string(), Value::from(PROTOCOL_VERSION));
        Event { header, name: name.to_string(), args }
    }

    pub fn heartbeat() -> Self {
        Self::new(EV_HEARTBEAT, Vec::new())
    }

    #[inline]
    pub fn message_id(&self) -> Option<&str> {
        self.header.get(HDR_MESSAGE_ID).and_then(Value::as_str)
    }

    /// The `message_id` of the originating request, identifying the
    /// logical channel; absent on the event that opens a call.
    #[inline]
    pub fn response_to(&self) -> Option<&str> {
        self.header.get(HDR_RESPONSE_TO).and_then(Value::as_str)
    }

    pub(crate) fn set_response_to(&mut self, id: &str) {
        self.header.insert(HDR_RESPONSE_TO.to_string(), Value::from(id));
    }

    /// Pack into MessagePack bytes.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let pairs: Vec<(Value, Value)> =
            self.header.iter().map(|(k, v)| (Value::from(k.as_str()), v.clone())).collect();
        let mut items = Vec::with_capacity(2 + self.args.len());
        items.push(Value::Map(pairs));
        items.push(Value::from(self.name.as_str()));
        items.extend(self.args.iter().cloned());
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(items))
            .map_err(|e| RpcError::Codec(format!("encode: {}", e)))?;
        Ok(buf)
    }

    /// Unpack from MessagePack bytes.
    ///
    /// Elements at index >= 2 become the args; a single array element at
    /// index 2 is accepted as the args list itself (older peers nested
    /// the args instead of spreading them). Raw-bytes values are
    /// reinterpreted as UTF-8 strings where they occur as header keys,
    /// header values, the name, or an arg.
    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        let mut rd = buf;
        let value = rmpv::decode::read_value(&mut rd)
            .map_err(|e| RpcError::Codec(format!("decode: {}", e)))?;
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(RpcError::Codec("event is not an array".to_string())),
        };
        let (header_v, name_v, rest) = {
            let mut it = items.into_iter();
            match (it.next(), it.next()) {
                (Some(h), Some(n)) => (h, n, it.collect::<Vec<Value>>()),
                _ => return Err(RpcError::Codec("event array too short".to_string())),
            }
        };
        let pairs = match header_v {
            Value::Map(pairs) => pairs,
            _ => return Err(RpcError::Codec("event header is not a map".to_string())),
        };
        let mut header = HashMap::with_capacity(pairs.len());
        for (k, v) in pairs {
            match value_to_string(k) {
                Some(key) => header.insert(key, normalize(v)),
                None => return Err(RpcError::Codec("event header key is not a string".to_string())),
            };
        }
        let name = match value_to_string(name_v) {
            Some(name) => name,
            None => return Err(RpcError::Codec("event name is not a string".to_string())),
        };
        let args: Vec<Value> = if rest.len() == 1 {
            match rest.into_iter().next() {
                Some(Value::Array(inner)) => inner.into_iter().map(normalize).collect(),
                Some(other) => vec![normalize(other)],
                None => Vec::new(),
            }
        } else {
            rest.into_iter().map(normalize).collect()
        };
        Ok(Event { header, name, args })
    }
}

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => s.into_str(),
        Value::Binary(b) => String::from_utf8(b).ok(),
        _ => None,
    }
}

// Older peers emit raw bytes where strings are meant; bytes that are not
// valid UTF-8 stay binary.
fn normalize(v: Value) -> Value {
    match v {
        Value::Binary(b) => match String::from_utf8(b) {
            Ok(s) => Value::from(s),
            Err(e) => Value::Binary(e.into_bytes()),
        },
        other => other,
    }
}
