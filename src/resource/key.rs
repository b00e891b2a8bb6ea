//! Key path codecs for both stores.
//!
//! # Control-plane key shapes
//! ```text
//! /{prefix}/{api_version}/gateway/{gateway}/{stage}/{kind}/{name}        stage-scoped
//! /{prefix}/{api_version}/global/{kind}/{name}                           global
//! /{prefix}/{api_version}/gateway/{gateway}/{stage}/_bk_release/{name}   release marker
//! ```
//!
//! # Data-plane key shape
//! ```text
//! /{prefix}/{category}/{id}      category ∈ {routes, services, ssls, plugin_metadata}
//! ```

use thiserror::Error;

use crate::resource::kind::ResourceKind;

/// Kind segment of release-marker keys.
pub const RELEASE_SEGMENT: &str = "_bk_release";

const GATEWAY_SCOPE: &str = "gateway";
const GLOBAL_SCOPE: &str = "global";

const MIN_STAGE_SEGMENTS: usize = 6;
const MIN_GLOBAL_SEGMENTS: usize = 4;

/// Structured identity decoded from a control-plane key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKey {
    Stage {
        api_version: String,
        gateway: String,
        stage: String,
        kind: String,
        name: String,
    },
    Global {
        api_version: String,
        kind: String,
        name: String,
    },
    Release {
        api_version: String,
        gateway: String,
        stage: String,
        name: String,
    },
}

impl SourceKey {
    pub fn api_version(&self) -> &str {
        match self {
            SourceKey::Stage { api_version, .. }
            | SourceKey::Global { api_version, .. }
            | SourceKey::Release { api_version, .. } => api_version,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SourceKey::Stage { name, .. }
            | SourceKey::Global { name, .. }
            | SourceKey::Release { name, .. } => name,
        }
    }

    /// Raw kind segment; `_bk_release` for release markers.
    pub fn kind_segment(&self) -> &str {
        match self {
            SourceKey::Stage { kind, .. } | SourceKey::Global { kind, .. } => kind,
            SourceKey::Release { .. } => RELEASE_SEGMENT,
        }
    }

    /// Recognized resource kind, if any.
    pub fn kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_segment(self.kind_segment())
    }
}

/// Errors produced while decoding a key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key '{key}' is outside prefix '{prefix}'")]
    OutsidePrefix { key: String, prefix: String },

    #[error("key '{key}' has {found} segments after the prefix, expected at least {expected}")]
    TooFewSegments {
        key: String,
        found: usize,
        expected: usize,
    },

    #[error("key '{key}' has unknown scope '{scope}'")]
    UnknownScope { key: String, scope: String },

    #[error("key '{0}' contains an empty segment")]
    EmptySegment(String),
}

fn normalize_prefix(prefix: &str) -> String {
    format!("/{}", prefix.trim_matches('/'))
}

/// Encoder/decoder for control-plane keys under one prefix.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
        }
    }

    /// Prefix covering every key of the control plane.
    pub fn watch_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn gateway_prefix(&self, api_version: &str, gateway: &str) -> String {
        format!("{}/{api_version}/{GATEWAY_SCOPE}/{gateway}/", self.prefix)
    }

    pub fn stage_prefix(&self, api_version: &str, gateway: &str, stage: &str) -> String {
        format!("{}{stage}/", self.gateway_prefix(api_version, gateway))
    }

    pub fn global_prefix(&self, api_version: &str) -> String {
        format!("{}/{api_version}/{GLOBAL_SCOPE}/", self.prefix)
    }

    /// Key of a stage-scoped resource.
    pub fn stage_key(
        &self,
        api_version: &str,
        gateway: &str,
        stage: &str,
        kind: ResourceKind,
        name: &str,
    ) -> String {
        format!(
            "{}{}/{name}",
            self.stage_prefix(api_version, gateway, stage),
            kind.segment()
        )
    }

    /// Key of a global resource.
    pub fn global_key(&self, api_version: &str, kind: ResourceKind, name: &str) -> String {
        format!("{}{}/{name}", self.global_prefix(api_version), kind.segment())
    }

    /// Key of a stage release marker.
    pub fn release_key(&self, api_version: &str, gateway: &str, stage: &str, name: &str) -> String {
        format!(
            "{}{RELEASE_SEGMENT}/{name}",
            self.stage_prefix(api_version, gateway, stage)
        )
    }

    /// Decode a control-plane key.
    pub fn parse(&self, key: &str) -> Result<SourceKey, KeyError> {
        let rest = key
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| KeyError::OutsidePrefix {
                key: key.to_string(),
                prefix: self.prefix.clone(),
            })?;

        let segments: Vec<&str> = rest.split('/').collect();
        let too_few = |expected: usize| KeyError::TooFewSegments {
            key: key.to_string(),
            found: segments.len(),
            expected,
        };
        if segments.len() < MIN_GLOBAL_SEGMENTS {
            return Err(too_few(MIN_GLOBAL_SEGMENTS));
        }

        let (required, name) = match segments[1] {
            GATEWAY_SCOPE => {
                if segments.len() < MIN_STAGE_SEGMENTS {
                    return Err(too_few(MIN_STAGE_SEGMENTS));
                }
                (&segments[..5], segments[5..].join("/"))
            }
            GLOBAL_SCOPE => (&segments[..3], segments[3..].join("/")),
            scope => {
                return Err(KeyError::UnknownScope {
                    key: key.to_string(),
                    scope: scope.to_string(),
                })
            }
        };
        if name.is_empty() || required.iter().any(|s| s.is_empty()) {
            return Err(KeyError::EmptySegment(key.to_string()));
        }

        let api_version = required[0].to_string();
        let parsed = if segments[1] == GLOBAL_SCOPE {
            SourceKey::Global {
                api_version,
                kind: required[2].to_string(),
                name,
            }
        } else if required[4] == RELEASE_SEGMENT {
            SourceKey::Release {
                api_version,
                gateway: required[2].to_string(),
                stage: required[3].to_string(),
                name,
            }
        } else {
            SourceKey::Stage {
                api_version,
                gateway: required[2].to_string(),
                stage: required[3].to_string(),
                kind: required[4].to_string(),
                name,
            }
        };
        Ok(parsed)
    }
}

/// Encoder/decoder for data-plane keys under one prefix.
#[derive(Debug, Clone)]
pub struct DataPlaneCodec {
    prefix: String,
}

impl DataPlaneCodec {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
        }
    }

    /// Prefix covering every key of the data plane.
    pub fn watch_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Key of a resource; `None` for kinds without a data-plane category.
    pub fn key(&self, kind: ResourceKind, id: &str) -> Option<String> {
        kind.category()
            .map(|category| format!("{}/{category}/{id}", self.prefix))
    }

    /// Decode `{prefix}/{category}/{id}`. Directory keys and unknown
    /// categories yield `None`.
    pub fn parse(&self, key: &str) -> Option<(ResourceKind, String)> {
        let rest = key
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))?;
        let (category, id) = rest.split_once('/')?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        ResourceKind::from_category(category).map(|kind| (kind, id.to_string()))
    }
}
