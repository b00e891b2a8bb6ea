//! Per-category resource bundles.

use std::collections::BTreeMap;

use crate::resource::{Resource, ResourceKind};

/// Resources of one target (desired state) or one replica view, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigBundle {
    pub routes: BTreeMap<String, Resource>,
    pub services: BTreeMap<String, Resource>,
    pub ssls: BTreeMap<String, Resource>,
    pub plugin_metadata: BTreeMap<String, Resource>,
}

impl ConfigBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource into its category, replacing any previous entry.
    pub fn insert(&mut self, resource: Resource) -> Option<Resource> {
        self.category_mut(resource.kind())
            .and_then(|category| category.insert(resource.id.clone(), resource))
    }

    pub fn remove(&mut self, kind: ResourceKind, id: &str) -> Option<Resource> {
        self.category_mut(kind).and_then(|category| category.remove(id))
    }

    pub fn get(&self, kind: ResourceKind, id: &str) -> Option<&Resource> {
        self.category(kind).and_then(|category| category.get(id))
    }

    /// Map backing `kind`; `None` for kinds never written to the data plane.
    pub fn category(&self, kind: ResourceKind) -> Option<&BTreeMap<String, Resource>> {
        match kind {
            ResourceKind::Route => Some(&self.routes),
            ResourceKind::Service => Some(&self.services),
            ResourceKind::Ssl => Some(&self.ssls),
            ResourceKind::PluginMetadata => Some(&self.plugin_metadata),
            _ => None,
        }
    }

    pub fn category_mut(&mut self, kind: ResourceKind) -> Option<&mut BTreeMap<String, Resource>> {
        match kind {
            ResourceKind::Route => Some(&mut self.routes),
            ResourceKind::Service => Some(&mut self.services),
            ResourceKind::Ssl => Some(&mut self.ssls),
            ResourceKind::PluginMetadata => Some(&mut self.plugin_metadata),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len() + self.services.len() + self.ssls.len() + self.plugin_metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every resource, category by category.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.routes
            .values()
            .chain(self.services.values())
            .chain(self.ssls.values())
            .chain(self.plugin_metadata.values())
    }

    /// Move every resource of `other` into `self`.
    pub fn merge(&mut self, other: ConfigBundle) {
        self.routes.extend(other.routes);
        self.services.extend(other.services);
        self.ssls.extend(other.ssls);
        self.plugin_metadata.extend(other.plugin_metadata);
    }
}
