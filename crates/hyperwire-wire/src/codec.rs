//! Request and response body encoding.
//!
//! A request body names the method it calls as the tag of an externally
//! tagged JSON value:
//!
//! - `"Status"` for a call without arguments,
//! - `{"Echo": "hi"}` for a single argument,
//! - `{"SendMessage": ["bob.os", "hello"]}` for several arguments, passed as
//!   a tuple and encoded as an array in parameter order.
//!
//! Passing several arguments as a struct instead produces an object, which a
//! handler expecting positional arguments will not decode.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Encode a call to `method` with `args`.
pub fn encode_call<A: Serialize + ?Sized>(method: &str, args: &A) -> Result<Vec<u8>, CodecError> {
    let mut call = Map::with_capacity(1);
    call.insert(method.to_string(), serde_json::to_value(args)?);
    Ok(serde_json::to_vec(&Value::Object(call))?)
}

/// Encode a call to `method` that takes no arguments.
pub fn encode_unit(method: &str) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(method)?)
}

/// Split a request body into its method tag and arguments.
///
/// Unit calls yield `Value::Null` as their arguments.
pub fn decode_call(body: &[u8]) -> Result<(String, Value), CodecError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::String(method) => Ok((method, Value::Null)),
        Value::Object(map) if map.len() == 1 => {
            let Some((method, args)) = map.into_iter().next() else {
                return Err(CodecError::MalformedCall("empty call object".to_string()));
            };
            Ok((method, args))
        }
        Value::Object(map) => Err(CodecError::MalformedCall(format!(
            "expected exactly one method tag, found {}",
            map.len()
        ))),
        other => Err(CodecError::MalformedCall(format!(
            "expected a method tag, found {}",
            json_kind(&other)
        ))),
    }
}

/// Encode a response body.
pub fn encode_body<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(body)?)
}

/// Decode a response body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(body)?)
}

/// Decode handler arguments, reporting failures as a response reason.
pub fn args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
