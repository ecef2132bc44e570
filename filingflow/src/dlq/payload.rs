//! JSON-safe dead-letter payloads.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Debug;

/// A retry payload. Always a JSON object.
pub type Payload = Map<String, Value>;

/// Key used when a payload cannot be represented as a JSON object.
pub const RAW_KEY: &str = "__raw__";

/// Converts `value` into a JSON object without ever failing.
///
/// Objects pass through unchanged. Any other JSON value is stringified
/// under [`RAW_KEY`]; a value that cannot be serialized at all is stored
/// as its `Debug` rendering under the same key.
#[must_use]
pub fn normalize_payload<T>(value: &T) -> Payload
where
    T: Serialize + Debug + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(other) => raw(other.to_string()),
        Err(err) => {
            tracing::debug!(error = %err, "payload is not serializable, storing raw form");
            raw(format!("{value:?}"))
        }
    }
}

fn raw(text: String) -> Payload {
    let mut map = Map::with_capacity(1);
    map.insert(RAW_KEY.to_string(), Value::String(text));
    map
}

/// Builds a payload from key/value pairs.
#[must_use]
pub fn payload_of<I, K>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
