use serde_json::Value;

use super::types::RawRecord;
use crate::config::spec::ResponseShape;

/// Why a 200 body could not be turned into records.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedBody(pub String);

impl std::fmt::Display for MalformedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Parse a successful response body per the declared shape. Every element
/// must be a JSON object; anything else rejects the whole body.
pub fn parse_records(code: &str, shape: ResponseShape, body: &[u8]) -> Result<Vec<RawRecord>, MalformedBody> {
    let doc: Value = serde_json::from_slice(body).map_err(|e| MalformedBody(format!("invalid JSON: {e}")))?;
    let items = match (shape, doc) {
        (ResponseShape::Stream, Value::Array(items)) => items,
        (ResponseShape::Data, Value::Object(mut obj)) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Err(MalformedBody("missing \"data\" array".into())),
            Some(other) => return Err(MalformedBody(format!("\"data\" is {}, expected array", kind_of(&other)))),
        },
        (shape, other) => return Err(MalformedBody(format!("{:?} response is {}", shape, kind_of(&other)))),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(fields) => Ok(RawRecord::new(code, fields)),
            other => Err(MalformedBody(format!("element {i} is {}, expected object", kind_of(&other)))),
        })
        .collect()
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
