//! Declarative add-in manifest parsing and validation.
//!
//! A manifest is a TOML file (`*.addin` or `*.addin.toml`) that declares an
//! add-in without requiring its modules to carry identity attributes. The
//! modules it lists are still inspected for extensions, and they are added
//! to the ignore list so they are not scanned a second time on their own.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::types::{AddinDescriptor, ExtensionPoint, ModuleDescription, NodeSet, NodeType};
use super::{ScanError, ScanResult};

/// Add-in manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddinManifest {
    /// Identity section.
    #[serde(default)]
    pub addin: ManifestHeader,
    /// Main module.
    #[serde(default)]
    pub module: ModuleDescription,
    /// Optional modules.
    #[serde(default)]
    pub optional_modules: Vec<ModuleDescription>,
    /// Declared extension points.
    #[serde(default)]
    pub extension_points: Vec<ManifestExtensionPoint>,
    /// Declared node sets.
    #[serde(default)]
    pub node_sets: Vec<NodeSet>,
}

/// Identity section of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestHeader {
    /// Local id; generated when empty.
    pub id: String,
    /// Namespace.
    pub namespace: String,
    /// Version; defaults to `0.0.0.0` when empty.
    pub version: String,
    /// Category.
    pub category: String,
    /// Whether the add-in is a root.
    pub is_root: bool,
}

/// Extension point as written in a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestExtensionPoint {
    pub path: String,
    pub name: String,
    pub description: String,
    pub node_types: Vec<NodeType>,
}

impl AddinManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml(content: &str, path: &Path) -> ScanResult<Self> {
        toml::from_str(content).map_err(|e| ScanError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Parse a manifest from a file.
    pub fn from_file(path: &Path) -> ScanResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content, path)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> ScanResult<String> {
        toml::to_string_pretty(self).map_err(|e| ScanError::Manifest {
            path: Default::default(),
            reason: e.to_string(),
        })
    }

    /// Validate the manifest.
    pub fn validate(&self, path: &Path) -> ScanResult<()> {
        let invalid = |reason: &str| ScanError::Manifest {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let valid_id_char = |c: char| c.is_alphanumeric() || c == '-' || c == '_' || c == '.';
        if !self.addin.id.chars().all(valid_id_char) {
            return Err(invalid(
                "Add-in id must contain only alphanumerics, dots, hyphens and underscores",
            ));
        }
        if !self.addin.namespace.chars().all(valid_id_char) {
            return Err(invalid("Add-in namespace contains invalid characters"));
        }

        if !self.addin.version.is_empty()
            && !self.addin.version.split('.').all(|p| !p.is_empty() && p.parse::<u32>().is_ok())
        {
            return Err(invalid("Version must be dot-separated numbers (e.g., 1.0.0)"));
        }

        if self.extension_points.iter().any(|ep| ep.path.is_empty()) {
            return Err(invalid("Extension point path is required"));
        }

        Ok(())
    }

    /// Build the descriptor this manifest declares.
    pub fn into_descriptor(self, base_path: &Path, source_file: &Path) -> AddinDescriptor {
        let extension_points = self
            .extension_points
            .into_iter()
            .map(|ep| ExtensionPoint {
                path: ep.path,
                name: ep.name,
                description: ep.description,
                node_set: NodeSet { id: String::new(), node_types: ep.node_types },
                ..ExtensionPoint::default()
            })
            .collect();

        AddinDescriptor {
            has_user_id: !self.addin.id.is_empty(),
            local_id: self.addin.id,
            namespace: self.addin.namespace,
            version: self.addin.version,
            category: self.addin.category,
            is_root: self.addin.is_root,
            base_path: base_path.to_path_buf(),
            source_file: source_file.to_path_buf(),
            main_module: self.module,
            optional_modules: self.optional_modules,
            extension_points,
            node_sets: self.node_sets,
            ..AddinDescriptor::default()
        }
    }
}

/// Whether a file name looks like a declarative manifest.
pub fn is_manifest_file(path: &Path, suffixes: &[String]) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    suffixes.iter().any(|s| name.ends_with(&s.to_lowercase()))
}
