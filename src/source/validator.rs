//! Resource validation seam.
//!
//! Schema validation lives outside the operator; the pipeline only relies on
//! this trait to refuse resources before they reach the data plane.

use serde_json::Value;
use thiserror::Error;

use crate::resource::ResourceKind;

/// A resource rejected by a [`Validator`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} rejected for apisix {apisix_version}: {message}")]
pub struct SchemaError {
    pub kind: ResourceKind,
    pub apisix_version: String,
    pub message: String,
}

/// Validates raw resources for a given data-plane version.
pub trait Validator: Send + Sync {
    fn validate(&self, apisix_version: &str, kind: ResourceKind, raw: &[u8]) -> Result<(), SchemaError>;
}

/// Accepts any JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectValidator;

impl Validator for JsonObjectValidator {
    fn validate(&self, apisix_version: &str, kind: ResourceKind, raw: &[u8]) -> Result<(), SchemaError> {
        match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(_)) => Ok(()),
            Ok(_) => Err(SchemaError {
                kind,
                apisix_version: apisix_version.to_string(),
                message: "expected a JSON object".to_string(),
            }),
            Err(e) => Err(SchemaError {
                kind,
                apisix_version: apisix_version.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
