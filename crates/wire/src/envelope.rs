//! Request / response / push envelopes.
//!
//! Argument encoding for `(cmd, positionals, keywords)`:
//!
//! ```text
//! ()                   -> {"cmd": c}
//! (a)                  -> {"cmd": c, "args": a}
//! (k=v, ...)           -> {"cmd": c, "args": {"k": v, ...}}
//! (a, b, ...)          -> {"cmd": c, "args": [a, b, ...]}
//! (a, ..., k=v, ...)   -> {"cmd": c, "args": [[a, ...], {"k": v, ...}]}
//! ```
//!
//! Decoding mirrors this. A two-element list whose first element is a list
//! and whose second is a mapping is always read as the mixed form, so a call
//! with exactly those two positionals cannot be expressed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Suffix appended to a command name to form its response key.
pub const RESPONSE_SUFFIX: &str = "_resp";

/// Key under which a handler failure is reported.
pub const ERROR_KEY: &str = "err";

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Encode into the `args` field; `None` means the field is omitted.
    pub fn encode(&self) -> Option<Value> {
        match (self.positional.len(), self.keyword.is_empty()) {
            (0, true) => None,
            (1, true) => Some(self.positional[0].clone()),
            (0, false) => Some(Value::Object(self.keyword.clone())),
            (_, true) => Some(Value::Array(self.positional.clone())),
            (_, false) => Some(Value::Array(vec![
                Value::Array(self.positional.clone()),
                Value::Object(self.keyword.clone()),
            ])),
        }
    }

    /// Decode an `args` field back into positionals and keywords.
    pub fn decode(args: Option<Value>) -> Self {
        match args {
            None => Self::default(),
            Some(Value::Object(keyword)) => Self {
                positional: Vec::new(),
                keyword,
            },
            Some(Value::Array(mut items)) => {
                if matches!(items.as_slice(), [Value::Array(_), Value::Object(_)]) {
                    if let (Some(Value::Object(keyword)), Some(Value::Array(positional))) =
                        (items.pop(), items.pop())
                    {
                        return Self {
                            positional,
                            keyword,
                        };
                    }
                }
                Self {
                    positional: items,
                    keyword: Map::new(),
                }
            }
            Some(scalar) => Self {
                positional: vec![scalar],
                keyword: Map::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Request {
    pub fn new(cmd: impl Into<String>, args: &Arguments) -> Self {
        Self {
            cmd: cmd.into(),
            args: args.encode(),
        }
    }

    pub fn arguments(&self) -> Arguments {
        Arguments::decode(self.args.clone())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ---------------------------------------------------------------------------
// Responses and pushes
// ---------------------------------------------------------------------------

/// `counter` -> `counter_resp`.
pub fn response_key(cmd: &str) -> String {
    format!("{cmd}{RESPONSE_SUFFIX}")
}

/// `counter_resp` -> `counter`; `None` for keys that are not responses.
pub fn command_of(key: &str) -> Option<&str> {
    key.strip_suffix(RESPONSE_SUFFIX).filter(|c| !c.is_empty())
}

/// Wrap a handler outcome as `{"<cmd>_resp": value}` or
/// `{"<cmd>_resp": {"err": message}}`.
pub fn encode_response(cmd: &str, outcome: Result<Value, String>) -> Value {
    let body = match outcome {
        Ok(value) => value,
        Err(message) => {
            let mut err = Map::new();
            err.insert(ERROR_KEY.to_string(), Value::String(message));
            Value::Object(err)
        }
    };
    single(response_key(cmd), body)
}

/// Unwrap a response body: a mapping carrying `err` is a remote failure.
pub fn decode_response(body: Value) -> Result<Value, String> {
    match body {
        Value::Object(ref map) if map.contains_key(ERROR_KEY) => Err(match &map[ERROR_KEY] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        value => Ok(value),
    }
}

/// `{key: value}` push notification.
pub fn encode_push(key: &str, value: Value) -> Value {
    single(key.to_string(), value)
}

/// Parse any inbound frame as a key/value mapping.
pub fn parse_frame(payload: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::from_slice(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

pub fn to_bytes(frame: &Value) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(frame)?)
}

fn single(key: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key, value);
    Value::Object(map)
}

// ===========================================================================
// Tests
// ===========================================================================
