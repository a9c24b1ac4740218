//! Add-in descriptor data model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Version assigned to add-ins that do not declare one.
pub const DEFAULT_VERSION: &str = "0.0.0.0";

/// Node type used by extension points that do not name one.
pub const DEFAULT_NODE_TYPE: &str = "Addins.TypeExtensionNode";

/// Node name used for contributions bound through their type ancestry.
pub const TYPE_NODE_NAME: &str = "Type";

/// Prefix of extension paths synthesized from a type's ancestry.
pub const TYPE_PATH_MARKER: char = '$';

/// Build an add-in id of the form `namespace.local_id@version`.
pub fn format_addin_id(namespace: &str, local_id: &str, version: &str) -> String {
    let mut id = String::new();
    if !namespace.is_empty() {
        id.push_str(namespace);
        id.push('.');
    }
    id.push_str(local_id);
    if !version.is_empty() {
        id.push('@');
        id.push_str(version);
    }
    id
}

/// The identity root of an add-in id (the id without its version).
pub fn id_name(addin_id: &str) -> &str {
    addin_id.split_once('@').map_or(addin_id, |(name, _)| name)
}

/// The version part of an add-in id, empty if none.
pub fn id_version(addin_id: &str) -> &str {
    addin_id.split_once('@').map_or("", |(_, version)| version)
}

/// Structured metadata record for one add-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddinDescriptor {
    /// Local identifier (without namespace or version).
    pub local_id: String,
    /// Namespace the id lives in.
    pub namespace: String,
    /// Declared version.
    pub version: String,
    /// False if the local id was generated rather than declared.
    pub has_user_id: bool,
    /// Free-form category.
    pub category: String,
    /// Isolation scope this add-in belongs to.
    pub domain: String,
    /// Whether this add-in anchors a new domain.
    pub is_root: bool,
    /// Folder the add-in was found in.
    pub base_path: PathBuf,
    /// File the descriptor was extracted from.
    pub source_file: PathBuf,
    /// Main module: identity, dependencies and primary extensions.
    pub main_module: ModuleDescription,
    /// Secondary module groups contributing extensions.
    pub optional_modules: Vec<ModuleDescription>,
    /// Extension points declared by this add-in.
    pub extension_points: Vec<ExtensionPoint>,
    /// Node sets declared by this add-in (including generated child sets).
    pub node_sets: Vec<NodeSet>,
    /// Registry file holding this descriptor, if it was loaded from one.
    #[serde(skip)]
    pub file_name: Option<PathBuf>,
}

impl AddinDescriptor {
    /// The full add-in id (`namespace.local_id@version`).
    pub fn addin_id(&self) -> String {
        format_addin_id(&self.namespace, &self.local_id, &self.version)
    }

    /// Get an extension point by path, creating it if needed.
    pub fn add_extension_point(&mut self, path: &str) -> &mut ExtensionPoint {
        let index = match self.extension_points.iter().position(|ep| ep.path == path) {
            Some(i) => i,
            None => {
                self.extension_points.push(ExtensionPoint::new(path));
                self.extension_points.len() - 1
            }
        };
        &mut self.extension_points[index]
    }

    /// Find an extension point by path.
    pub fn extension_point(&self, path: &str) -> Option<&ExtensionPoint> {
        self.extension_points.iter().find(|ep| ep.path == path)
    }

    /// Find a node set by id.
    pub fn node_set(&self, id: &str) -> Option<&NodeSet> {
        self.node_sets.iter().find(|set| set.id == id)
    }

    /// All modules, main module first.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleDescription> {
        std::iter::once(&self.main_module).chain(self.optional_modules.iter())
    }

    /// Every file shipped by this add-in, relative to `base_path`.
    pub fn all_files(&self) -> Vec<String> {
        self.modules()
            .flat_map(|m| m.assemblies.iter().chain(m.data_files.iter()))
            .cloned()
            .collect()
    }

    /// Every path this add-in asks the scanner to ignore, relative to `base_path`.
    pub fn all_ignore_paths(&self) -> Vec<String> {
        self.modules().flat_map(|m| m.ignore_paths.iter()).cloned().collect()
    }

    /// Fully qualified ids of all add-ins the main module depends on.
    pub fn dependency_ids(&self) -> Vec<String> {
        self.main_module.dependencies.iter().map(|d| d.full_addin_id(&self.namespace)).collect()
    }

    /// Stamp extension points declared here with the owning add-in id.
    pub fn set_extensions_addin_id(&mut self, addin_id: &str) {
        for ep in &mut self.extension_points {
            ep.root_addin = addin_id.to_string();
        }
    }

    /// Carry over relation data computed for a previous version of this descriptor.
    pub fn merge_external_data(&mut self, existing: &AddinDescriptor) {
        for ep in &mut self.extension_points {
            if let Some(old) = existing.extension_point(&ep.path) {
                ep.addins.extend(old.addins.iter().cloned());
            }
        }
    }

    /// Check the descriptor for structural errors.
    pub fn verify(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.local_id.is_empty() {
            errors.push("Add-in id is required".to_string());
        } else if self.local_id.contains('@') {
            errors.push(format!("Add-in id '{}' must not contain '@'", self.local_id));
        }

        for ep in &self.extension_points {
            if !ep.path.starts_with('/') {
                errors.push(format!("Extension point path '{}' must start with '/'", ep.path));
            }
            self.verify_node_set(&ep.node_set, &mut errors);
        }
        for set in &self.node_sets {
            self.verify_node_set(set, &mut errors);
        }

        for module in self.modules() {
            for dep in &module.dependencies {
                if dep.addin_id.is_empty() {
                    errors.push("Dependency without add-in id".to_string());
                }
            }
            for ext in &module.extensions {
                if ext.path.is_empty() {
                    errors.push("Extension without path".to_string());
                    continue;
                }
                if let Some(type_name) = ext.path.strip_prefix(TYPE_PATH_MARKER) {
                    let unbound = ext.nodes.iter().any(|n| n.object_type_name() == Some(type_name));
                    if unbound {
                        errors.push(format!(
                            "Type '{type_name}' is an extension without base type or interface"
                        ));
                    }
                }
            }
        }

        errors
    }

    fn verify_node_set(&self, set: &NodeSet, errors: &mut Vec<String>) {
        for nt in &set.node_types {
            for child in &nt.child_node_set_ids {
                if self.node_set(child).is_none() {
                    errors.push(format!(
                        "Node type '{}' references unknown node set '{child}'",
                        nt.id
                    ));
                }
            }
        }
    }
}

/// A group of module files with their dependencies and extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDescription {
    /// Module file names, relative to the add-in base path.
    pub assemblies: Vec<String>,
    /// Data files shipped with the module.
    pub data_files: Vec<String>,
    /// Paths to exclude from scanning.
    pub ignore_paths: Vec<String>,
    /// Add-in dependencies.
    pub dependencies: Vec<AddinDependency>,
    /// Extensions contributed by the module.
    pub extensions: Vec<Extension>,
}

impl ModuleDescription {
    /// Append a node to the extension at `path`, creating the extension if needed.
    pub fn add_extension_node(&mut self, path: &str, node_name: &str) -> &mut ExtensionNode {
        let index = match self.extensions.iter().position(|e| e.path == path) {
            Some(i) => i,
            None => {
                self.extensions.push(Extension { path: path.to_string(), nodes: Vec::new() });
                self.extensions.len() - 1
            }
        };
        let ext = &mut self.extensions[index];
        ext.nodes.push(ExtensionNode::new(node_name));
        let last = ext.nodes.len() - 1;
        &mut ext.nodes[last]
    }
}

/// Dependency on another add-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddinDependency {
    /// Id of the required add-in, optionally relative to the declaring namespace.
    pub addin_id: String,
    /// Required version.
    pub version: String,
}

impl AddinDependency {
    /// Resolve the dependency id against the declaring add-in's namespace.
    ///
    /// Ids starting with `::` are absolute.
    pub fn full_addin_id(&self, namespace: &str) -> String {
        match self.addin_id.strip_prefix("::") {
            Some(absolute) => format_addin_id("", absolute, &self.version),
            None => format_addin_id(namespace, &self.addin_id, &self.version),
        }
    }
}

/// Named slot other add-ins can extend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionPoint {
    /// Extension path (`/acme/tools`).
    pub path: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Node types accepted at this point.
    pub node_set: NodeSet,
    /// Add-in that declared the point.
    pub root_addin: String,
    /// Add-ins known to extend this point (relation data).
    pub addins: BTreeSet<String>,
}

impl ExtensionPoint {
    /// Create an empty extension point.
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string(), ..Self::default() }
    }

    /// Declare an accepted node type, defaulting the type name.
    pub fn add_node_type(&mut self, id: &str, type_name: &str) -> &mut NodeType {
        let type_name = if type_name.is_empty() { DEFAULT_NODE_TYPE } else { type_name };
        self.node_set.node_types.push(NodeType {
            id: id.to_string(),
            type_name: type_name.to_string(),
            ..NodeType::default()
        });
        let last = self.node_set.node_types.len() - 1;
        &mut self.node_set.node_types[last]
    }
}

/// Reusable group of node types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSet {
    /// Set id, empty for the anonymous set of an extension point.
    pub id: String,
    /// Node types in the set.
    pub node_types: Vec<NodeType>,
}

/// Shape of a contribution accepted by an extension point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeType {
    /// Node name (element name in manifests).
    pub id: String,
    /// Full name of the type implementing the node.
    pub type_name: String,
    /// Full name of the type contributed objects must be assignable to.
    pub object_type_name: String,
    /// Description.
    pub description: String,
    /// Declared node attributes.
    pub attributes: Vec<NodeTypeAttribute>,
    /// Node sets allowed as children of this node.
    pub child_node_set_ids: Vec<String>,
}

impl NodeType {
    /// Whether an attribute with this name is already declared.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }
}

/// Attribute accepted by a node type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTypeAttribute {
    pub name: String,
    pub type_name: String,
    pub required: bool,
    pub description: String,
}

/// Contributions to one extension path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extension {
    pub path: String,
    pub nodes: Vec<ExtensionNode>,
}

/// One contributed node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionNode {
    pub node_name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ExtensionNode {
    /// Create a node without attributes.
    pub fn new(node_name: &str) -> Self {
        Self { node_name: node_name.to_string(), attributes: BTreeMap::new() }
    }

    /// Set an attribute value.
    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Full name of the type behind this node (`type`, falling back to `id`).
    pub fn object_type_name(&self) -> Option<&str> {
        self.attribute("type").or_else(|| self.attribute("id"))
    }
}
