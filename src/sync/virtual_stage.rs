//! The always-present virtual stage.
//!
//! Carries the catch-all not-found route, the health-check route and any
//! extra resources an operator ships in a JSON file of the form
//! `{"routes": [{"id": ...}], "services": [...], "ssls": [...], "plugin_metadata": [...]}`.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Value};

use crate::config::schema::VirtualStageConfig;
use crate::resource::{
    stage_key, ConfigBundle, Resource, ResourceKind, GATEWAY_LABEL, STAGE_LABEL,
};
use crate::sync::SyncError;

/// Lowest priority so every real route wins.
const NOT_FOUND_PRIORITY: i64 = -100;

pub struct VirtualStage {
    gateway: String,
    stage: String,
    bundle: ConfigBundle,
}

impl VirtualStage {
    /// Build the virtual stage, loading extra resources when configured.
    pub fn new(config: &VirtualStageConfig) -> Result<Self, SyncError> {
        let mut stage = Self {
            gateway: config.gateway.clone(),
            stage: config.stage.clone(),
            bundle: ConfigBundle::new(),
        };

        stage.add(ResourceKind::Route, &stage.resource_id("not-found"), json!({
            "name": "virtual-not-found",
            "uris": ["/*"],
            "priority": NOT_FOUND_PRIORITY,
            "plugins": {"bk-not-found-handler": {}, "bk-error-wrapper": {}},
            "status": 1,
        }))?;
        stage.add(ResourceKind::Route, &stage.resource_id("healthz"), json!({
            "name": "virtual-healthz",
            "uris": [config.health_check_path],
            "methods": ["GET", "HEAD"],
            "priority": 0,
            "plugins": {
                "mocking": {
                    "content_type": "text/plain",
                    "response_status": 200,
                    "response_example": "ok",
                }
            },
            "status": 1,
        }))?;

        if let Some(path) = &config.extra_resources_path {
            let count = stage.load_extras(Path::new(path))?;
            tracing::info!(path = %path, resources = count, "Loaded extra virtual-stage resources");
        }
        Ok(stage)
    }

    /// Stage key the virtual stage lives under.
    pub fn stage_key(&self) -> String {
        stage_key(&self.gateway, &self.stage)
    }

    pub fn bundle(&self) -> &ConfigBundle {
        &self.bundle
    }

    fn resource_id(&self, name: &str) -> String {
        format!("{}.{}.{name}", self.gateway, self.stage)
    }

    fn add(&mut self, kind: ResourceKind, id: &str, body: Value) -> Result<(), SyncError> {
        let mut resource = Resource::from_value(kind, id, body)?;
        resource.set_label(GATEWAY_LABEL, self.gateway.as_str());
        resource.set_label(STAGE_LABEL, self.stage.as_str());
        self.bundle.insert(resource);
        Ok(())
    }

    fn load_extras(&mut self, path: &Path) -> Result<usize, SyncError> {
        let extras_error = |message: String| SyncError::ExtraResources {
            path: path.display().to_string(),
            message,
        };

        let raw = std::fs::read(path).map_err(|e| extras_error(e.to_string()))?;
        let categories: BTreeMap<String, Vec<Value>> =
            serde_json::from_slice(&raw).map_err(|e| extras_error(e.to_string()))?;

        let mut count = 0;
        for (category, items) in categories {
            let kind = ResourceKind::from_category(&category)
                .ok_or_else(|| extras_error(format!("unknown category '{category}'")))?;
            for item in items {
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| extras_error(format!("{category} entry without an id")))?;
                self.add(kind, &id, item)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_routes() {
        let stage = VirtualStage::new(&VirtualStageConfig::default()).unwrap();
        assert_eq!(stage.stage_key(), "-/-");

        let routes = &stage.bundle().routes;
        assert_eq!(routes.len(), 2);
        let not_found = &routes["-.-.not-found"];
        assert_eq!(not_found.stage_key(), "-/-");
        assert_eq!(not_found.to_value()["priority"], json!(-100));
        let healthz = &routes["-.-.healthz"];
        assert_eq!(healthz.to_value()["uris"], json!(["/healthz"]));
    }

    #[test]
    fn test_extra_resources_are_loaded_and_labelled() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"services": [{{"id": "virtual-svc", "upstream": {{"type": "roundrobin"}}}}],
                "plugin_metadata": [{{"id": "bk-cors", "allow_origins": "*"}}]}}"#
        )
        .unwrap();

        let config = VirtualStageConfig {
            extra_resources_path: Some(file.path().display().to_string()),
            ..VirtualStageConfig::default()
        };
        let stage = VirtualStage::new(&config).unwrap();
        assert_eq!(stage.bundle().len(), 4);
        let service = stage.bundle().get(ResourceKind::Service, "virtual-svc").unwrap();
        assert_eq!(service.stage_key(), "-/-");
    }

    #[test]
    fn test_bad_extra_resources_fail() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"upstreams": [{{"id": "u1"}}]}}"#).unwrap();
        let config = VirtualStageConfig {
            extra_resources_path: Some(file.path().display().to_string()),
            ..VirtualStageConfig::default()
        };
        assert!(matches!(
            VirtualStage::new(&config),
            Err(SyncError::ExtraResources { .. })
        ));

        let config = VirtualStageConfig {
            extra_resources_path: Some("/nonexistent/extras.json".to_string()),
            ..VirtualStageConfig::default()
        };
        assert!(VirtualStage::new(&config).is_err());
    }
}
