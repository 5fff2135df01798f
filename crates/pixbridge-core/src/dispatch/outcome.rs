//! Caller-facing result shape.

use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Structured failure handed to the caller instead of an error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeError {
    /// One of the stable [`ErrorKind`](crate::ErrorKind) names.
    pub kind: String,
    pub message: String,
    /// Calling again unchanged may succeed.
    pub retryable: bool,
}

impl From<&BridgeError> for OutcomeError {
    fn from(err: &BridgeError) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            message: err.detail(),
            retryable: err.is_retryable(),
        }
    }
}

/// Result of one dispatched operation.
///
/// Binary fields declared by the operation are decoded out of `data` into
/// `attachments`; serializing an outcome reports only their sizes.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub operation: String,
    pub message: Option<String>,
    pub error: Option<OutcomeError>,
    pub data: Option<Value>,
    #[serde(serialize_with = "attachment_sizes")]
    pub attachments: HashMap<String, Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl OperationOutcome {
    pub fn ok(
        operation: impl Into<String>,
        message: impl Into<String>,
        data: Value,
        attachments: HashMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            success: true,
            operation: operation.into(),
            message: Some(message.into()),
            error: None,
            data: Some(data),
            attachments,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(operation: impl Into<String>, err: &BridgeError) -> Self {
        Self {
            success: false,
            operation: operation.into(),
            message: None,
            error: Some(OutcomeError::from(err)),
            data: None,
            attachments: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.retryable)
    }

    pub fn attachment(&self, name: &str) -> Option<&[u8]> {
        self.attachments.get(name).map(Vec::as_slice)
    }
}

fn attachment_sizes<S>(
    attachments: &HashMap<String, Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let sizes: BTreeMap<&str, usize> = attachments
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.len()))
        .collect();
    sizes.serialize(serializer)
}
