//! Component directory
//!
//! Resolves a record's `componentId` to a human readable name using a
//! snapshot of the process-group status tree.

use crate::error::{Result, SiirtoError};
use serde::Deserialize;
use std::path::Path;

/// A named component (processor, port, remote group)
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentStatus {
    pub id: String,
    pub name: String,
}

/// Status of one process group and everything under it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupStatus {
    pub id: String,
    pub name: String,
    pub processors: Vec<ComponentStatus>,
    pub input_ports: Vec<ComponentStatus>,
    pub output_ports: Vec<ComponentStatus>,
    pub remote_groups: Vec<ComponentStatus>,
    pub groups: Vec<GroupStatus>,
}

impl GroupStatus {
    /// Load a status tree from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            SiirtoError::Config(format!(
                "cannot read component tree {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            SiirtoError::Config(format!(
                "invalid component tree {}: {e}",
                path.display()
            ))
        })
    }

    /// Find the name of the component with the given id
    ///
    /// The group itself is checked first, then its processors, ports and remote
    /// groups, then child groups depth-first.
    pub fn component_name(&self, component_id: &str) -> Option<&str> {
        if self.id == component_id {
            return Some(&self.name);
        }

        let direct = self
            .processors
            .iter()
            .chain(&self.input_ports)
            .chain(&self.output_ports)
            .chain(&self.remote_groups)
            .find(|c| c.id == component_id);
        if let Some(component) = direct {
            return Some(&component.name);
        }

        self.groups
            .iter()
            .find_map(|child| child.component_name(component_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tree() -> GroupStatus {
        serde_json::from_str(
            r#"{
                "id": "root",
                "name": "Root Flow",
                "processors": [{"id": "p1", "name": "Generate"}],
                "inputPorts": [{"id": "in1", "name": "Ingest"}],
                "groups": [{
                    "id": "g2",
                    "name": "Enrichment",
                    "outputPorts": [{"id": "out2", "name": "Enriched"}],
                    "groups": [{
                        "id": "g3",
                        "name": "Deep",
                        "remoteGroups": [{"id": "rg3", "name": "Remote DC"}]
                    }]
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_finds_root_and_direct_children() {
        let tree = tree();
        assert_eq!(tree.component_name("root"), Some("Root Flow"));
        assert_eq!(tree.component_name("p1"), Some("Generate"));
        assert_eq!(tree.component_name("in1"), Some("Ingest"));
    }

    #[test]
    fn test_finds_nested_components() {
        let tree = tree();
        assert_eq!(tree.component_name("g2"), Some("Enrichment"));
        assert_eq!(tree.component_name("out2"), Some("Enriched"));
        assert_eq!(tree.component_name("rg3"), Some("Remote DC"));
    }

    #[test]
    fn test_unknown_component() {
        assert_eq!(tree().component_name("nope"), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, r#"{"id":"r","name":"Root"}"#).unwrap();

        let tree = GroupStatus::load(&path).unwrap();
        assert_eq!(tree.name, "Root");

        let missing = GroupStatus::load(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(SiirtoError::Config(_))));
    }
}
