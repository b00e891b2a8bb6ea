//! Change metadata and commit targets.

use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::resource::key::{SourceKey, RELEASE_SEGMENT};
use crate::resource::value::label_string;
use crate::resource::{
    stage_key, ResourceKind, APISIX_VERSION_LABEL, GLOBAL_STAGE_KEY, PUBLISH_ID_LABEL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Delete,
}

/// Labels carried by a change event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataLabels {
    pub gateway: String,
    pub stage: String,
    pub publish_id: i64,
    pub apisix_version: String,
}

/// Identity of one changed control-plane key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMetadata {
    /// Raw kind segment (`_bk_release` for release markers).
    pub kind: String,
    pub id: String,
    pub name: String,
    pub labels: MetadataLabels,
    pub api_version: String,
    pub operation: Operation,
    /// Correlates every log line produced for this change.
    pub trace_id: Uuid,
}

impl ResourceMetadata {
    pub fn from_key(key: &SourceKey, operation: Operation) -> Self {
        let (gateway, stage) = match key {
            SourceKey::Stage { gateway, stage, .. } | SourceKey::Release { gateway, stage, .. } => {
                (gateway.clone(), stage.clone())
            }
            SourceKey::Global { .. } => (String::new(), String::new()),
        };
        Self {
            kind: key.kind_segment().to_string(),
            id: key.name().to_string(),
            name: key.name().to_string(),
            labels: MetadataLabels {
                gateway,
                stage,
                ..MetadataLabels::default()
            },
            api_version: key.api_version().to_string(),
            operation,
            trace_id: Uuid::new_v4(),
        }
    }

    /// Pick publish id and apisix version out of a stored value, best effort.
    pub fn with_value(mut self, raw: &[u8]) -> Self {
        if let Ok(value) = serde_json::from_slice::<Value>(raw) {
            let info = ReleaseInfo::from_value(&value);
            self.labels.publish_id = info.publish_id;
            self.labels.apisix_version = info.apisix_version;
        }
        self
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_segment(&self.kind)
    }

    pub fn is_release(&self) -> bool {
        self.kind == RELEASE_SEGMENT
    }

    /// Events without gateway and stage are ignored, except global plugin metadata.
    pub fn is_empty(&self) -> bool {
        self.labels.gateway.is_empty()
            && self.labels.stage.is_empty()
            && self.resource_kind() != Some(ResourceKind::PluginMetadata)
    }

    /// Commit target this change belongs to.
    pub fn target(&self) -> Option<ReleaseTarget> {
        if self.is_empty() {
            return None;
        }
        if self.labels.gateway.is_empty() && self.labels.stage.is_empty() {
            return Some(ReleaseTarget::Global);
        }
        Some(ReleaseTarget::stage(&self.labels.gateway, &self.labels.stage))
    }
}

/// Publish information stored in release markers and resource labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub publish_id: i64,
    pub apisix_version: String,
}

impl ReleaseInfo {
    /// Read top-level `publish_id`/`apisix_version`, falling back to labels.
    pub fn from_value(value: &Value) -> Self {
        let labels = value.get("labels");
        let lookup = |field: &str, label: &str| {
            value
                .get(field)
                .or_else(|| labels.and_then(|l| l.get(label)))
                .filter(|v| !v.is_null())
        };

        let publish_id = lookup("publish_id", PUBLISH_ID_LABEL)
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or_default();
        let apisix_version = lookup("apisix_version", APISIX_VERSION_LABEL)
            .map(label_string)
            .unwrap_or_default();
        Self {
            publish_id,
            apisix_version,
        }
    }
}

/// What a commit reconciles: one stage, or the global resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReleaseTarget {
    Stage { gateway: String, stage: String },
    Global,
}

impl ReleaseTarget {
    pub fn stage(gateway: &str, stage: &str) -> Self {
        ReleaseTarget::Stage {
            gateway: gateway.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Coalescing key: the stage key, or `"global"`.
    pub fn key(&self) -> String {
        match self {
            ReleaseTarget::Stage { gateway, stage } => stage_key(gateway, stage),
            ReleaseTarget::Global => GLOBAL_STAGE_KEY.to_string(),
        }
    }

    pub fn gateway(&self) -> Option<&str> {
        match self {
            ReleaseTarget::Stage { gateway, .. } => Some(gateway),
            ReleaseTarget::Global => None,
        }
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A pending commit of one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub target: ReleaseTarget,
    pub publish_id: i64,
    pub apisix_version: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub trace_id: Uuid,
}

impl ReleaseRequest {
    pub fn new(target: ReleaseTarget) -> Self {
        Self {
            target,
            publish_id: 0,
            apisix_version: String::new(),
            retry_count: 0,
            trace_id: Uuid::new_v4(),
        }
    }

    pub fn from_metadata(metadata: &ResourceMetadata) -> Option<Self> {
        let target = metadata.target()?;
        Some(Self {
            target,
            publish_id: metadata.labels.publish_id,
            apisix_version: metadata.labels.apisix_version.clone(),
            retry_count: 0,
            trace_id: metadata.trace_id,
        })
    }

    pub fn key(&self) -> String {
        self.target.key()
    }
}
