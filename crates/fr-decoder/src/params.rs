//! Parameter messages for the configuration and status exchanges.
//!
//! A [`ParamMessage`] is the parameter block of a request or reply: a JSON
//! object whose keys may be addressed with `/`-separated paths. A prefix such
//! as `"decoder_config/"` therefore names a nested object, which lets a
//! derived decoder place its own parameters next to the base ones without
//! colliding.
//!
//! ```
//! use fr_decoder::ParamMessage;
//!
//! let mut reply = ParamMessage::new();
//! reply.set_param("decoder_config/frame_timeout_ms", 500u32);
//!
//! let timeout: Option<u32> = reply.get_param("decoder_config/frame_timeout_ms").unwrap();
//! assert_eq!(timeout, Some(500));
//! assert_eq!(reply.to_value()["decoder_config"]["frame_timeout_ms"], 500);
//! ```

use crate::error::{DecoderError, DecoderResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key-value parameter block carried by configuration and status messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMessage {
    params: Map<String, Value>,
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/').filter(|s| !s.is_empty())
}

impl ParamMessage {
    /// Empty parameter block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`] if `value` is not an object.
    pub fn from_value(value: Value) -> DecoderResult<Self> {
        match value {
            Value::Object(params) => Ok(Self { params }),
            other => Err(DecoderError::InvalidParameter {
                key: String::new(),
                reason: format!("parameter block must be an object, got {other}"),
            }),
        }
    }

    /// The parameter block as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Whether the block has no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut parts = segments(key);
        let first = parts.next()?;
        let mut current = self.params.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has_param(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Read and convert the value at `key`.
    ///
    /// Absent keys give `Ok(None)` so callers can keep their current value.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`] if the key is present but
    /// does not convert to `T`.
    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> DecoderResult<Option<T>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                DecoderError::InvalidParameter {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    /// Set `key` to `value`, creating intermediate objects along the path.
    pub fn set_param(&mut self, key: &str, value: impl Into<Value>) {
        let parts: Vec<&str> = segments(key).collect();
        let Some((last, parents)) = parts.split_last() else {
            return;
        };

        let mut current = &mut self.params;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                return;
            };
            current = map;
        }
        current.insert(last.to_string(), value.into());
    }

    /// Parameters nested under `prefix`, as their own block.
    #[must_use]
    pub fn subtree(&self, prefix: &str) -> Self {
        if segments(prefix).next().is_none() {
            return self.clone();
        }
        match self.lookup(prefix) {
            Some(Value::Object(params)) => Self {
                params: params.clone(),
            },
            _ => Self::default(),
        }
    }
}
