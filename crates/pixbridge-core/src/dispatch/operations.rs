//! Built-in operation catalog.
//!
//! Each operation validates and normalizes its arguments before anything is
//! sent, picks its timeout, and names the result fields that carry base64
//! binary data.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Arguments and timeout for one call, after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub arguments: Map<String, Value>,
    pub timeout: Duration,
}

/// One client-side operation.
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-line description for listings.
    fn summary(&self) -> &'static str;

    /// Timeout used when the caller does not pick one.
    fn timeout(&self, config: &BridgeConfig) -> Duration {
        config.timeout
    }

    /// Validate `arguments` and decide the call's timeout.
    fn prepare(&self, arguments: Map<String, Value>, config: &BridgeConfig) -> Result<PreparedCall>;

    /// Top-level result fields holding base64 data.
    fn binary_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Human-readable message for a successful result.
    fn describe(&self, _data: &Value) -> String {
        format!("{} completed", self.name())
    }
}

/// All built-in operations.
pub fn builtin() -> Vec<Box<dyn Operation>> {
    vec![
        Box::new(GetImageBitmap),
        Box::new(GetImageMetadata),
        Box::new(GetContextState),
        Box::new(GetHostInfo),
        Box::new(Execute),
    ]
}

fn invalid(field: &str, message: impl Into<String>) -> BridgeError {
    BridgeError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

fn reject_unknown(arguments: &Map<String, Value>, allowed: &[&str]) -> Result<()> {
    match arguments.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(invalid(key, "unexpected argument")),
        None => Ok(()),
    }
}

/// `None` for absent or null, otherwise a strictly positive integer.
fn positive(arguments: &Map<String, Value>, field: &str) -> Result<Option<u32>> {
    match arguments.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(field, format!("must be a positive integer, got {}", value))),
    }
}

fn no_arguments(arguments: Map<String, Value>, config: &BridgeConfig) -> Result<PreparedCall> {
    reject_unknown(&arguments, &[])?;
    Ok(PreparedCall {
        arguments,
        timeout: config.timeout,
    })
}

/// Rectangle of the canvas, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    const FLAT_FIELDS: [&'static str; 4] =
        ["region_x", "region_y", "region_width", "region_height"];

    /// Region from either a `region` object or the flat `region_*` fields.
    /// All four coordinates must be present together, or none of them.
    fn from_arguments(arguments: &Map<String, Value>) -> Result<Option<Self>> {
        let flat: Vec<_> = Self::FLAT_FIELDS
            .iter()
            .map(|f| arguments.get(*f).filter(|v| !v.is_null()))
            .collect();
        let nested = arguments.get("region").filter(|v| !v.is_null());

        if nested.is_some() && flat.iter().any(Option::is_some) {
            return Err(invalid("region", "give either 'region' or the region_* fields, not both"));
        }

        let values: Vec<Option<&Value>> = match nested {
            Some(Value::Object(obj)) => ["origin_x", "origin_y", "width", "height"]
                .iter()
                .map(|f| obj.get(*f).filter(|v| !v.is_null()))
                .collect(),
            Some(_) => return Err(invalid("region", "must be an object")),
            None => flat,
        };

        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        if values.iter().any(Option::is_none) {
            return Err(invalid(
                "region",
                "origin_x, origin_y, width and height must be given together",
            ));
        }

        let coord = |value: Option<&Value>, name: &str, min: u64| -> Result<u32> {
            value
                .and_then(Value::as_u64)
                .filter(|n| *n >= min)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    invalid(
                        "region",
                        format!("{} must be an integer of at least {}", name, min),
                    )
                })
        };

        Ok(Some(Self {
            origin_x: coord(values[0], "origin_x", 0)?,
            origin_y: coord(values[1], "origin_y", 0)?,
            width: coord(values[2], "width", 1)?,
            height: coord(values[3], "height", 1)?,
        }))
    }
}

/// Typed arguments for `get_image_bitmap`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BitmapRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

/// Render the visible canvas (or a region of it) as an image.
pub struct GetImageBitmap;

impl Operation for GetImageBitmap {
    fn name(&self) -> &'static str {
        "get_image_bitmap"
    }

    fn summary(&self) -> &'static str {
        "Render the canvas as a base64 bitmap, optionally cropped and scaled"
    }

    fn timeout(&self, config: &BridgeConfig) -> Duration {
        config.long_timeout
    }

    fn prepare(
        &self,
        arguments: Map<String, Value>,
        config: &BridgeConfig,
    ) -> Result<PreparedCall> {
        let mut allowed = vec!["max_width", "max_height", "region"];
        allowed.extend(Region::FLAT_FIELDS);
        reject_unknown(&arguments, &allowed)?;

        let request = BitmapRequest {
            max_width: positive(&arguments, "max_width")?,
            max_height: positive(&arguments, "max_height")?,
            region: Region::from_arguments(&arguments)?,
        };

        Ok(PreparedCall {
            arguments: to_map(&request)?,
            timeout: self.timeout(config),
        })
    }

    fn binary_fields(&self) -> &'static [&'static str] {
        &["image_data"]
    }

    fn describe(&self, data: &Value) -> String {
        let dim = |key: &str| {
            data.get(key)
                .and_then(Value::as_u64)
                .map_or_else(|| "?".to_string(), |n| n.to_string())
        };
        format!("Captured {}x{} image", dim("width"), dim("height"))
    }
}

/// Canvas size, layer stack and other image facts, without pixels.
pub struct GetImageMetadata;

impl Operation for GetImageMetadata {
    fn name(&self) -> &'static str {
        "get_image_metadata"
    }

    fn summary(&self) -> &'static str {
        "Describe the canvas and its layers without pixel data"
    }

    fn prepare(
        &self,
        arguments: Map<String, Value>,
        config: &BridgeConfig,
    ) -> Result<PreparedCall> {
        no_arguments(arguments, config)
    }

    fn describe(&self, _data: &Value) -> String {
        "Image metadata retrieved".to_string()
    }
}

/// Colors, brush and opacity currently set on the host.
pub struct GetContextState;

impl Operation for GetContextState {
    fn name(&self) -> &'static str {
        "get_context_state"
    }

    fn summary(&self) -> &'static str {
        "Report the active colors, brush and opacity"
    }

    fn prepare(
        &self,
        arguments: Map<String, Value>,
        config: &BridgeConfig,
    ) -> Result<PreparedCall> {
        no_arguments(arguments, config)
    }

    fn describe(&self, _data: &Value) -> String {
        "Context state retrieved".to_string()
    }
}

pub struct GetHostInfo;

impl Operation for GetHostInfo {
    fn name(&self) -> &'static str {
        "get_host_info"
    }

    fn summary(&self) -> &'static str {
        "Report host version, platform and available operations"
    }

    fn prepare(
        &self,
        arguments: Map<String, Value>,
        config: &BridgeConfig,
    ) -> Result<PreparedCall> {
        no_arguments(arguments, config)
    }

    fn describe(&self, _data: &Value) -> String {
        "Host info retrieved".to_string()
    }
}

/// Run arbitrary steps against the host's native API.
///
/// The step list is passed through as is; only its presence is checked.
pub struct Execute;

impl Execute {
    pub const TIMEOUT_FIELD: &'static str = "timeout_seconds";
}

impl Operation for Execute {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn summary(&self) -> &'static str {
        "Run a list of native host steps (unvalidated)"
    }

    fn prepare(
        &self,
        mut arguments: Map<String, Value>,
        config: &BridgeConfig,
    ) -> Result<PreparedCall> {
        let timeout = match arguments.remove(Self::TIMEOUT_FIELD) {
            None | Some(Value::Null) => config.timeout,
            Some(value) => {
                let secs = value
                    .as_f64()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| invalid(Self::TIMEOUT_FIELD, "must be a positive number"))?;
                // Cap before converting; huge values do not fit a Duration.
                Duration::from_secs_f64(secs.min(config.long_timeout.as_secs_f64()))
            }
        };

        match arguments.get("steps") {
            Some(Value::Array(_)) => {}
            Some(_) => return Err(invalid("steps", "must be a list")),
            None => return Err(invalid("steps", "is required")),
        }

        Ok(PreparedCall { arguments, timeout })
    }

    fn describe(&self, data: &Value) -> String {
        match data.get("steps").and_then(Value::as_array) {
            Some(steps) => format!("Executed {} step(s)", steps.len()),
            None => "Executed".to_string(),
        }
    }
}

pub(crate) fn to_map<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(invalid("arguments", format!("expected an object, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_bitmap_uses_long_timeout() {
        let config = BridgeConfig::default();
        let call = GetImageBitmap.prepare(Map::new(), &config).unwrap();
        assert_eq!(call.timeout, config.long_timeout);
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn test_bitmap_flat_region_is_normalized() {
        let call = GetImageBitmap
            .prepare(
                args(json!({
                    "max_width": 256,
                    "region_x": 0, "region_y": 4, "region_width": 10, "region_height": 20,
                })),
                &BridgeConfig::default(),
            )
            .unwrap();

        assert_eq!(
            Value::Object(call.arguments),
            json!({
                "max_width": 256,
                "region": {"origin_x": 0, "origin_y": 4, "width": 10, "height": 20},
            })
        );
    }

    #[test]
    fn test_bitmap_partial_region_rejected() {
        let err = GetImageBitmap
            .prepare(args(json!({"region_x": 1, "region_y": 2})), &BridgeConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let err = GetImageBitmap
            .prepare(
                args(json!({"region": {"origin_x": 0, "origin_y": 0, "width": 5}})),
                &BridgeConfig::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn test_bitmap_rejects_bad_dimensions() {
        for bad in [
            json!({"max_width": 0}),
            json!({"max_height": -3}),
            json!({"max_width": "big"}),
        ] {
            let err = GetImageBitmap
                .prepare(args(bad.clone()), &BridgeConfig::default())
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError, "{}", bad);
        }

        let err = GetImageBitmap
            .prepare(
                args(json!({"region": {"origin_x": 0, "origin_y": 0, "width": 0, "height": 1}})),
                &BridgeConfig::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("width"));
    }

    #[test]
    fn test_unexpected_arguments_rejected() {
        let err = GetHostInfo
            .prepare(args(json!({"verbose": true})), &BridgeConfig::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation { ref field, .. } if field == "verbose"));
    }

    #[test]
    fn test_execute_timeout_is_capped_and_stripped() {
        let config = BridgeConfig::default();
        let call = Execute
            .prepare(args(json!({"steps": [], "timeout_seconds": 9999})), &config)
            .unwrap();
        assert_eq!(call.timeout, config.long_timeout);
        assert!(!call.arguments.contains_key("timeout_seconds"));

        let call = Execute
            .prepare(args(json!({"steps": [{"anything": "goes"}], "timeout_seconds": 2})), &config)
            .unwrap();
        assert_eq!(call.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_execute_huge_timeout_is_capped() {
        let config = BridgeConfig::default();
        for secs in [1e300, f64::MAX] {
            let call = Execute
                .prepare(args(json!({"steps": [], "timeout_seconds": secs})), &config)
                .unwrap();
            assert_eq!(call.timeout, config.long_timeout);
        }

        let err = Execute
            .prepare(args(json!({"steps": [], "timeout_seconds": -1e300})), &config)
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Validation { ref field, .. } if field == "timeout_seconds"
        ));
    }

    #[test]
    fn test_execute_requires_steps() {
        let err = Execute
            .prepare(Map::new(), &BridgeConfig::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation { ref field, .. } if field == "steps"));
    }

    #[test]
    fn test_catalog_names_are_unique() {
        let mut names: Vec<_> = builtin().iter().map(|op| op.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), builtin().len());
    }

    #[test]
    fn test_bitmap_describe() {
        assert_eq!(
            GetImageBitmap.describe(&json!({"width": 64, "height": 32})),
            "Captured 64x32 image"
        );
    }
}
