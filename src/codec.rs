//! Wire encoding of work item payloads.
//!
//! A message body is the payload as compact JSON text. Anything that does not
//! parse as a JSON object is malformed.

use crate::error::{Error, Result};
use crate::model::Payload;

/// Encode a payload into a message body.
pub fn encode_message(payload: &Payload) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

/// Decode a message body back into a payload.
pub fn decode_message(body: &str) -> Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(body)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Malformed(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_compactly() {
        let mut payload = Payload::new();
        payload.insert("tilecoord".into(), json!("1/2/3"));
        assert_eq!(encode_message(&payload).unwrap(), r#"{"tilecoord":"1/2/3"}"#);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(decode_message("[1,2]").is_err());
        assert!(decode_message("\"1/2/3\"").is_err());
        assert!(decode_message("{not json").is_err());
    }
}
