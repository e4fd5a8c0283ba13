//! Routing header map and protocol constants
//!
//! The routing header travels as a self-describing CBOR map. The broker
//! only interprets the keys below; everything else is carried along
//! untouched so that shallow-copied replies keep whatever extra keys a
//! client put there.

use std::collections::BTreeMap;

use serde_cbor::Value;

use super::FrameError;

/// Routing key: command discriminator
pub const KEY_TYPE: &str = "type";
/// Routing key: subscription group
pub const KEY_GROUP: &str = "group";
/// Routing key: subscription instance
pub const KEY_INSTANCE: &str = "instance";
/// Routing key: destination lname, or `"*"` for group dispatch
pub const KEY_TO: &str = "to";
/// Routing key: sender lname
pub const KEY_FROM: &str = "from";
/// Routing key: opaque per-sender sequence id
pub const KEY_SEQ: &str = "seq";
/// Routing key: marks a reply, echoing the original `seq`
pub const KEY_REPLY: &str = "reply";
/// Routing key: request flag asking for a synthesized error on no recipient
pub const KEY_WANT_ANSWER: &str = "want_answer";

/// Command: route a message to subscribers or a single lname
pub const COMMAND_SEND: &str = "send";
/// Command: add a subscription
pub const COMMAND_SUBSCRIBE: &str = "subscribe";
/// Command: drop a subscription
pub const COMMAND_UNSUBSCRIBE: &str = "unsubscribe";
/// Command: ask the broker for the sender's lname
pub const COMMAND_GET_LNAME: &str = "getlname";
/// Command: liveness probe
pub const COMMAND_PING: &str = "ping";
/// Reply type for [`COMMAND_PING`]
pub const COMMAND_PONG: &str = "pong";
/// Command: request orderly broker shutdown
pub const COMMAND_STOP: &str = "stop";

/// Wildcard for `to` and `instance`
pub const WILDCARD: &str = "*";

/// Reserved lname the broker uses as `from` in synthesized replies
pub const MSGQ_LNAME: &str = "msgq";

/// Error code for a `want_answer` request that reached nobody.
///
/// Negative values are reserved for delivery failures, as opposed to
/// positive application-level error codes.
pub const CC_REPLY_NO_RECPT: i64 = -1;

/// Parsed routing header
///
/// A string-keyed map of CBOR values. `Clone` gives the shallow copy
/// used when the broker synthesizes a reply from a request header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingHeader {
    entries: BTreeMap<String, Value>,
}

impl RoutingHeader {
    /// Create an empty header with the given command type
    pub fn new(msg_type: &str) -> Self {
        let mut header = Self::default();
        header.set_str(KEY_TYPE, msg_type);
        header
    }

    /// Parse a header from its CBOR bytes
    ///
    /// Anything other than a string-keyed map is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_cbor::from_slice(bytes)?;
        let Value::Map(map) = value else {
            return Err(FrameError::HeaderNotMap);
        };
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            let Value::Text(key) = key else {
                return Err(FrameError::HeaderNotMap);
            };
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    /// Serialize back to CBOR bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let map: BTreeMap<Value, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
            .collect();
        Ok(serde_cbor::to_vec(&Value::Map(map))?)
    }

    /// Raw value of a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// String value of a key, if it is a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Set a key to an arbitrary value
    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    /// Set a key to a string value
    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set(key, Value::Text(value.to_string()));
    }

    /// Builder form of [`set_str`](Self::set_str)
    pub fn with_str(mut self, key: &str, value: &str) -> Self {
        self.set_str(key, value);
        self
    }

    /// Command discriminator
    pub fn msg_type(&self) -> Option<&str> {
        self.get_str(KEY_TYPE)
    }

    /// Subscription group
    pub fn group(&self) -> Option<&str> {
        self.get_str(KEY_GROUP)
    }

    /// Subscription instance
    pub fn instance(&self) -> Option<&str> {
        self.get_str(KEY_INSTANCE)
    }

    /// Destination lname or wildcard
    pub fn to(&self) -> Option<&str> {
        self.get_str(KEY_TO)
    }

    /// Value of the `from` key: the sender's lname as the client claims it
    pub fn sender(&self) -> Option<&str> {
        self.get_str(KEY_FROM)
    }

    /// Opaque sequence id
    pub fn seq(&self) -> Option<&Value> {
        self.get(KEY_SEQ)
    }

    /// Reply marker, present when this message is itself a reply
    pub fn reply(&self) -> Option<&Value> {
        self.get(KEY_REPLY)
    }

    /// Whether the sender asked for a synthesized no-recipient error.
    ///
    /// Accepts a CBOR boolean or a non-zero integer.
    pub fn wants_answer(&self) -> bool {
        match self.get(KEY_WANT_ANSWER) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Integer(n)) => *n != 0,
            _ => false,
        }
    }
}

/// Encode a string-keyed map payload to CBOR
pub fn encode_payload_map<I>(entries: I) -> Result<Vec<u8>, FrameError>
where
    I: IntoIterator<Item = (String, Value)>,
{
    let map: BTreeMap<Value, Value> = entries
        .into_iter()
        .map(|(k, v)| (Value::Text(k), v))
        .collect();
    Ok(serde_cbor::to_vec(&Value::Map(map))?)
}

/// Decode a string-keyed CBOR map payload
pub fn decode_payload_map(bytes: &[u8]) -> Result<BTreeMap<String, Value>, FrameError> {
    let value: Value = serde_cbor::from_slice(bytes)?;
    let Value::Map(map) = value else {
        return Err(FrameError::HeaderNotMap);
    };
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        let Value::Text(key) = key else {
            return Err(FrameError::HeaderNotMap);
        };
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Build the standard error answer payload `{"result": [code, text]}`
pub fn error_answer(code: i64, text: &str) -> Result<Vec<u8>, FrameError> {
    encode_payload_map([(
        "result".to_string(),
        Value::Array(vec![
            Value::Integer(code.into()),
            Value::Text(text.to_string()),
        ]),
    )])
}
