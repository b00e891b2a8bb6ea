//! Minimal put/delete sets between two bundles.

use std::collections::BTreeMap;

use crate::resource::{ConfigBundle, Resource, ResourceKind};

/// Resources to write and to remove.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub put: Option<ConfigBundle>,
    pub delete: Option<ConfigBundle>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.put.as_ref().map_or(true, ConfigBundle::is_empty)
            && self.delete.as_ref().map_or(true, ConfigBundle::is_empty)
    }
}

/// Compute what turns `old` into `new`.
///
/// Resources present on both sides are compared ignoring desc, labels and
/// timestamps. Neither input is modified.
pub fn diff(old: Option<&ConfigBundle>, new: Option<&ConfigBundle>) -> Diff {
    match (old, new) {
        (None, None) => Diff::default(),
        (None, Some(new)) => Diff {
            put: Some(new.clone()),
            delete: None,
        },
        (Some(old), None) => Diff {
            put: None,
            delete: Some(old.clone()),
        },
        (Some(old), Some(new)) => {
            let mut put = ConfigBundle::new();
            let mut delete = ConfigBundle::new();
            for kind in ResourceKind::SUPPORTED {
                let (Some(old_category), Some(new_category)) =
                    (old.category(kind), new.category(kind))
                else {
                    continue;
                };
                diff_category(old_category, new_category, &mut put, &mut delete);
            }
            Diff {
                put: Some(put),
                delete: Some(delete),
            }
        }
    }
}

fn diff_category(
    old: &BTreeMap<String, Resource>,
    new: &BTreeMap<String, Resource>,
    put: &mut ConfigBundle,
    delete: &mut ConfigBundle,
) {
    let mut remaining: BTreeMap<&str, &Resource> =
        old.iter().map(|(id, resource)| (id.as_str(), resource)).collect();

    for (id, resource) in new {
        match remaining.remove(id.as_str()) {
            Some(current) if current.same_config(resource) => {}
            _ => {
                put.insert(resource.clone());
            }
        }
    }
    for resource in remaining.into_values() {
        delete.insert(resource.clone());
    }
}
