//! Binary payloads carried inside JSON results.
//!
//! The wire is text only, so hosts base64-encode rendered images before they
//! reach the codec and callers decode them again on the way out.

use crate::error::{BridgeError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const BASE64_ENCODING: &str = "base64";

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_text(field: &str, text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| {
            BridgeError::malformed(format!("field '{}' is not valid base64: {}", field, e))
        })
}

/// Remove each of `fields` from the top level of `data` and decode it.
///
/// Fields that are absent or null are skipped. A field that is present but
/// not a base64 string is an error.
pub fn take_binary_fields(data: &mut Value, fields: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
    let mut attachments = HashMap::new();
    let Some(object) = data.as_object_mut() else {
        return Ok(attachments);
    };

    for &field in fields {
        match object.remove(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                attachments.insert(field.to_string(), decode_text(field, &text)?);
            }
            Some(other) => {
                return Err(BridgeError::malformed(format!(
                    "field '{}' should be a base64 string, got {}",
                    field,
                    json_type(&other)
                )));
            }
        }
    }

    Ok(attachments)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Result shape of a rendered-image operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// Encoded image bytes, base64 text.
    pub image_data: String,
    pub format: String,
    pub encoding: String,
    pub width: u32,
    pub height: u32,
    /// Size of the source area before any scaling.
    pub original_width: u32,
    pub original_height: u32,
}

impl ImagePayload {
    pub fn new(
        bytes: &[u8],
        format: impl Into<String>,
        size: (u32, u32),
        original: (u32, u32),
    ) -> Self {
        Self {
            image_data: encode_bytes(bytes),
            format: format.into(),
            encoding: BASE64_ENCODING.to_string(),
            width: size.0,
            height: size.1,
            original_width: original.0,
            original_height: original.1,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        decode_text("image_data", &self.image_data)
    }
}
