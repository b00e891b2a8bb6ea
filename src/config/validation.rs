//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check endpoint and address formats
//! - Validate value ranges (windows > 0, force flush ≥ debounce window)
//! - Detect overlapping key spaces between the two stores
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: OperatorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::{EtcdConfig, OperatorConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &OperatorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_etcd("source.etcd", &config.source.etcd, &mut errors);
    validate_etcd("target.etcd", &config.target.etcd, &mut errors);
    validate_prefix("source.prefix", &config.source.prefix, &mut errors);
    validate_prefix("target.prefix", &config.target.prefix, &mut errors);

    let source = format!("{}/", config.source.prefix.trim_end_matches('/'));
    let target = format!("{}/", config.target.prefix.trim_end_matches('/'));
    if config.source.etcd.endpoints == config.target.etcd.endpoints
        && (source.starts_with(&target) || target.starts_with(&source))
    {
        errors.push(ValidationError::new(
            "target.prefix",
            "source and target key spaces overlap on the same cluster",
        ));
    }

    if config.source.api_version.is_empty() || config.source.api_version.contains('/') {
        errors.push(ValidationError::new(
            "source.api_version",
            "must be a single non-empty path segment",
        ));
    }
    if config.source.fetch_timeout_secs == 0 {
        errors.push(ValidationError::new("source.fetch_timeout_secs", "must be > 0"));
    }
    if config.target.full_sync_timeout_secs == 0 {
        errors.push(ValidationError::new("target.full_sync_timeout_secs", "must be > 0"));
    }

    let commit = &config.commit;
    if commit.debounce_window_ms == 0 {
        errors.push(ValidationError::new("commit.debounce_window_ms", "must be > 0"));
    }
    if commit.force_flush() < commit.debounce_window() {
        errors.push(ValidationError::new(
            "commit.force_flush_secs",
            "must not be shorter than the debounce window",
        ));
    }
    if commit.tick_interval_ms == 0 {
        errors.push(ValidationError::new("commit.tick_interval_ms", "must be > 0"));
    }
    if commit.segment_size == 0 {
        errors.push(ValidationError::new("commit.segment_size", "must be > 0"));
    }
    if commit.channel_capacity == 0 {
        errors.push(ValidationError::new("commit.channel_capacity", "must be > 0"));
    }

    let virtual_stage = &config.virtual_stage;
    if virtual_stage.gateway.is_empty() || virtual_stage.stage.is_empty() {
        errors.push(ValidationError::new(
            "virtual_stage",
            "gateway and stage must not be empty",
        ));
    }
    if !virtual_stage.health_check_path.starts_with('/') {
        errors.push(ValidationError::new(
            "virtual_stage.health_check_path",
            "must start with '/'",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_etcd(field: &str, etcd: &EtcdConfig, errors: &mut Vec<ValidationError>) {
    if etcd.endpoints.is_empty() {
        errors.push(ValidationError::new(
            format!("{field}.endpoints"),
            "at least one endpoint is required",
        ));
    }
    for endpoint in &etcd.endpoints {
        // etcd accepts bare host:port endpoints
        let candidate = if endpoint.contains("://") {
            endpoint.clone()
        } else {
            format!("http://{endpoint}")
        };
        if Url::parse(&candidate).is_err() {
            errors.push(ValidationError::new(
                format!("{field}.endpoints"),
                format!("invalid endpoint '{endpoint}'"),
            ));
        }
    }
    if etcd.username.is_some() != etcd.password.is_some() {
        errors.push(ValidationError::new(
            format!("{field}.username"),
            "username and password must be set together",
        ));
    }
    if etcd.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            format!("{field}.request_timeout_secs"),
            "must be > 0",
        ));
    }
}

fn validate_prefix(field: &str, prefix: &str, errors: &mut Vec<ValidationError>) {
    if !prefix.starts_with('/') || prefix.trim_matches('/').is_empty() {
        errors.push(ValidationError::new(
            field,
            format!("'{prefix}' must be an absolute, non-root key prefix"),
        ));
    }
}
