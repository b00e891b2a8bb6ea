//! Resource model shared by every stage of the pipeline.
//!
//! # Data Flow
//! ```text
//! control-plane key  → key.rs (KeyCodec)  → SourceKey → metadata.rs (ResourceMetadata)
//! control-plane JSON → Resource::decode   → typed Resource → bundle.rs (ConfigBundle)
//! data-plane key     → key.rs (DataPlaneCodec)
//! data-plane JSON    → Resource::decode   → replica cache
//! ```
//!
//! # Design Decisions
//! - Closed enum over the four translated kinds; exhaustive matches everywhere
//! - Kind-specific fields that matter for ordering (`service_id`, `snis`,
//!   `upstream`) are typed, everything else stays a canonical value tree
//! - Canonicalization happens once, at decode time

pub mod bundle;
pub mod key;
pub mod kind;
pub mod metadata;
pub mod value;

pub use bundle::ConfigBundle;
pub use key::{DataPlaneCodec, KeyCodec, KeyError, SourceKey};
pub use kind::ResourceKind;
pub use metadata::{Operation, ReleaseRequest, ReleaseTarget, ResourceMetadata};

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::resource::value::{canonicalize, label_string};

pub const GATEWAY_LABEL: &str = "gateway.bk.tencent.com/gateway";
pub const STAGE_LABEL: &str = "gateway.bk.tencent.com/stage";
pub const PUBLISH_ID_LABEL: &str = "gateway.bk.tencent.com/publish-id";
pub const APISIX_VERSION_LABEL: &str = "gateway.bk.tencent.com/apisix-version";

/// Stage key of resources that belong to no stage.
pub const GLOBAL_STAGE_KEY: &str = "global";

/// Stage key `"{gateway}/{stage}"`.
pub fn stage_key(gateway: &str, stage: &str) -> String {
    format!("{gateway}/{stage}")
}

/// Errors produced while decoding or encoding a resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid JSON for {kind} '{id}': {source}")]
    Json {
        kind: ResourceKind,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} '{id}' is not a JSON object")]
    NotAnObject { kind: ResourceKind, id: String },

    #[error("{0} is not translated to the data plane")]
    Unsupported(ResourceKind),

    #[error("{kind} '{id}': field '{field}' {message}")]
    InvalidField {
        kind: ResourceKind,
        id: String,
        field: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Service the route depends on.
    pub service_id: Option<String>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub upstream: Option<Value>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SslSpec {
    pub snis: Vec<String>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginMetadataSpec {
    pub fields: Map<String, Value>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Route(RouteSpec),
    Service(ServiceSpec),
    Ssl(SslSpec),
    PluginMetadata(PluginMetadataSpec),
}

/// A typed data-plane resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub name: Option<String>,
    pub desc: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub create_time: Option<i64>,
    pub update_time: Option<i64>,
    pub spec: ResourceSpec,
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    match map.remove(field)? {
        Value::Null => None,
        other => Some(label_string(&other)),
    }
}

impl Resource {
    /// Decode raw JSON into a resource with the given id.
    pub fn decode(kind: ResourceKind, id: &str, raw: &[u8]) -> Result<Self, ResourceError> {
        let value: Value = serde_json::from_slice(raw).map_err(|source| ResourceError::Json {
            kind,
            id: id.to_string(),
            source,
        })?;
        Self::from_value(kind, id, value)
    }

    /// Build a resource from an already parsed value. `id` wins over any
    /// `id` field in the body.
    pub fn from_value(kind: ResourceKind, id: &str, value: Value) -> Result<Self, ResourceError> {
        let Value::Object(mut fields) = canonicalize(value) else {
            return Err(ResourceError::NotAnObject {
                kind,
                id: id.to_string(),
            });
        };

        fields.remove("id");
        let name = take_string(&mut fields, "name");
        let desc = take_string(&mut fields, "desc");
        let labels = match fields.remove("labels") {
            Some(Value::Object(labels)) => labels
                .iter()
                .map(|(k, v)| (k.clone(), label_string(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        let create_time = fields.remove("create_time").and_then(|v| v.as_i64());
        let update_time = fields.remove("update_time").and_then(|v| v.as_i64());

        let spec = match kind {
            ResourceKind::Route => ResourceSpec::Route(RouteSpec {
                service_id: take_string(&mut fields, "service_id"),
                fields,
            }),
            ResourceKind::Service => ResourceSpec::Service(ServiceSpec {
                upstream: fields.remove("upstream"),
                fields,
            }),
            ResourceKind::Ssl => {
                let mut snis = match fields.remove("snis") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.iter().map(label_string).collect(),
                    Some(_) => {
                        return Err(ResourceError::InvalidField {
                            kind,
                            id: id.to_string(),
                            field: "snis",
                            message: "must be an array",
                        })
                    }
                };
                if let Some(sni) = take_string(&mut fields, "sni") {
                    snis.push(sni);
                }
                ResourceSpec::Ssl(SslSpec { snis, fields })
            }
            ResourceKind::PluginMetadata => {
                ResourceSpec::PluginMetadata(PluginMetadataSpec { fields })
            }
            other => return Err(ResourceError::Unsupported(other)),
        };

        Ok(Self {
            id: id.to_string(),
            name,
            desc,
            labels,
            create_time,
            update_time,
            spec,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        match self.spec {
            ResourceSpec::Route(_) => ResourceKind::Route,
            ResourceSpec::Service(_) => ResourceKind::Service,
            ResourceSpec::Ssl(_) => ResourceKind::Ssl,
            ResourceSpec::PluginMetadata(_) => ResourceKind::PluginMetadata,
        }
    }

    /// Render the data-plane JSON body.
    pub fn to_value(&self) -> Value {
        let mut body = match &self.spec {
            ResourceSpec::Route(route) => {
                let mut body = route.fields.clone();
                if let Some(service_id) = &route.service_id {
                    body.insert("service_id".into(), Value::String(service_id.clone()));
                }
                body
            }
            ResourceSpec::Service(service) => {
                let mut body = service.fields.clone();
                if let Some(upstream) = &service.upstream {
                    body.insert("upstream".into(), upstream.clone());
                }
                body
            }
            ResourceSpec::Ssl(ssl) => {
                let mut body = ssl.fields.clone();
                if !ssl.snis.is_empty() {
                    body.insert(
                        "snis".into(),
                        Value::Array(ssl.snis.iter().cloned().map(Value::String).collect()),
                    );
                }
                body
            }
            ResourceSpec::PluginMetadata(metadata) => metadata.fields.clone(),
        };

        body.insert("id".into(), Value::String(self.id.clone()));
        if let Some(name) = &self.name {
            body.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(desc) = &self.desc {
            body.insert("desc".into(), Value::String(desc.clone()));
        }
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            body.insert("labels".into(), Value::Object(labels));
        }
        if let Some(t) = self.create_time {
            body.insert("create_time".into(), Value::from(t));
        }
        if let Some(t) = self.update_time {
            body.insert("update_time".into(), Value::from(t));
        }
        Value::Object(body)
    }

    /// Serialize the data-plane JSON body.
    pub fn encode(&self) -> Result<Vec<u8>, ResourceError> {
        serde_json::to_vec(&self.to_value()).map_err(|source| ResourceError::Json {
            kind: self.kind(),
            id: self.id.clone(),
            source,
        })
    }

    /// Equality ignoring volatile fields (desc, labels, timestamps).
    pub fn same_config(&self, other: &Resource) -> bool {
        self.id == other.id && self.name == other.name && self.spec == other.spec
    }

    /// Stage key derived from the gateway and stage labels.
    pub fn stage_key(&self) -> String {
        match (self.labels.get(GATEWAY_LABEL), self.labels.get(STAGE_LABEL)) {
            (Some(gateway), Some(stage)) if !gateway.is_empty() && !stage.is_empty() => {
                stage_key(gateway, stage)
            }
            _ => GLOBAL_STAGE_KEY.to_string(),
        }
    }

    pub fn gateway(&self) -> Option<&str> {
        self.labels.get(GATEWAY_LABEL).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels.insert(key.to_string(), value.into());
    }

    /// Service this resource depends on, for routes.
    pub fn service_id(&self) -> Option<&str> {
        match &self.spec {
            ResourceSpec::Route(route) => route.service_id.as_deref(),
            _ => None,
        }
    }
}
