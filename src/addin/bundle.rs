//! JSON module bundle provider.
//!
//! A bundle module is a JSON document describing what a module declares:
//! module-level attributes, the types it defines (with their base types,
//! attributes and fields) and the modules it references. It backs the
//! [`MetadataProvider`] contract for interpreted plugin bundles and is the
//! provider the CLI uses.
//!
//! ```json
//! {
//!   "name": "acme-tools",
//!   "references": ["helper.dll"],
//!   "attributes": [
//!     { "kind": "addin", "id": "tools", "namespace": "acme", "version": "1.0" },
//!     { "kind": "extension_point", "path": "/acme/tools", "node_name": "Tool" }
//!   ],
//!   "types": [
//!     { "name": "Hammer", "namespace": "Acme", "base_types": ["Acme.ITool"],
//!       "attributes": [{ "kind": "extension", "path": "/acme/tools" }] }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::{
    Attribute, AttributeKind, AttributeTarget, MetadataProvider, ProviderResult,
};
use super::types::DEFAULT_NODE_TYPE;
use super::ProviderError;

/// Serialized form of a bundle module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDocument {
    /// Module name.
    pub name: String,
    /// Embedded TOML add-in manifest.
    pub manifest: Option<String>,
    /// Referenced module files, relative to this module's folder.
    pub references: Vec<String>,
    /// Module-level attributes.
    pub attributes: Vec<Attribute>,
    /// Types defined by the module.
    pub types: Vec<TypeDocument>,
}

/// Serialized form of a type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeDocument {
    /// Short name.
    pub name: String,
    /// Namespace, joined to the name with a dot.
    pub namespace: String,
    /// Full names of base types and interfaces, nearest first.
    pub base_types: Vec<String>,
    /// Type-level attributes.
    pub attributes: Vec<Attribute>,
    /// Fields.
    pub fields: Vec<FieldDocument>,
}

impl TypeDocument {
    /// Full name (`Namespace.Name`).
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// Serialized form of a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDocument {
    pub name: String,
    pub type_name: String,
    pub attributes: Vec<Attribute>,
}

/// A loaded bundle module.
#[derive(Debug, Clone)]
pub struct BundleModule {
    path: PathBuf,
    doc: Arc<ModuleDocument>,
}

impl BundleModule {
    /// Path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module name, falling back to the file stem.
    pub fn name(&self) -> String {
        if self.doc.name.is_empty() {
            self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
        } else {
            self.doc.name.clone()
        }
    }
}

/// A type in a bundle module.
#[derive(Debug, Clone)]
pub struct BundleType {
    module: BundleModule,
    index: usize,
}

impl BundleType {
    fn doc(&self) -> &TypeDocument {
        &self.module.doc.types[self.index]
    }
}

/// A field of a bundle type.
#[derive(Debug, Clone)]
pub struct BundleField {
    ty: BundleType,
    index: usize,
}

impl BundleField {
    fn doc(&self) -> &FieldDocument {
        &self.ty.doc().fields[self.index]
    }
}

/// A reference from a bundle module to another module file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReference {
    base_dir: PathBuf,
    name: String,
}

/// Provider reading JSON module bundles.
///
/// Modules are read from disk on every load, so a provider can be reused
/// across scans of a changing tree.
pub struct BundleProvider {
    host: Option<BundleModule>,
}

impl Default for BundleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleProvider {
    /// Create a provider with the built-in host module.
    pub fn new() -> Self {
        Self { host: Some(builtin_host_module()) }
    }

    /// Create a provider with a custom host module.
    pub fn with_host_module(host: ModuleDocument) -> Self {
        let host = BundleModule { path: PathBuf::from("<host>"), doc: Arc::new(host) };
        Self { host: Some(host) }
    }

    /// Parse a bundle document.
    pub fn parse(path: &Path, content: &str) -> ProviderResult<ModuleDocument> {
        serde_json::from_str(content).map_err(|e| ProviderError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn attributes_of<'a>(
        &self,
        target: &'a AttributeTarget<'_, Self>,
    ) -> &'a [Attribute] {
        match target {
            AttributeTarget::Module(m) => &m.doc.attributes,
            AttributeTarget::Type(t) => &t.doc().attributes,
            AttributeTarget::Field(f) => &f.doc().attributes,
        }
    }
}

impl MetadataProvider for BundleProvider {
    type Module = BundleModule;
    type Type = BundleType;
    type Field = BundleField;
    type Reference = BundleReference;

    fn load_module(&self, path: &Path) -> ProviderResult<BundleModule> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(path.to_path_buf()),
            _ => ProviderError::Other(format!("{}: {e}", path.display())),
        })?;
        let doc = Self::parse(path, &content)?;
        Ok(BundleModule { path: path.to_path_buf(), doc: Arc::new(doc) })
    }

    fn declared_attributes(
        &self,
        target: AttributeTarget<'_, Self>,
        kind: AttributeKind,
    ) -> ProviderResult<Vec<Attribute>> {
        Ok(self.attributes_of(&target).iter().filter(|a| a.kind() == kind).cloned().collect())
    }

    fn enumerate_types(&self, module: &BundleModule) -> ProviderResult<Vec<BundleType>> {
        Ok((0..module.doc.types.len())
            .map(|index| BundleType { module: module.clone(), index })
            .collect())
    }

    fn enumerate_fields(&self, ty: &BundleType) -> ProviderResult<Vec<BundleField>> {
        Ok((0..ty.doc().fields.len()).map(|index| BundleField { ty: ty.clone(), index }).collect())
    }

    fn enumerate_references(&self, module: &BundleModule) -> ProviderResult<Vec<BundleReference>> {
        let base_dir = module.path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(module
            .doc
            .references
            .iter()
            .map(|name| BundleReference { base_dir: base_dir.clone(), name: name.clone() })
            .collect())
    }

    fn resolve_reference(
        &self,
        reference: &BundleReference,
    ) -> ProviderResult<Option<BundleModule>> {
        let path = reference.base_dir.join(&reference.name);
        if !path.is_file() {
            return Ok(None);
        }
        self.load_module(&path).map(Some)
    }

    fn is_assignable_from(&self, base: &BundleType, ty: &BundleType) -> bool {
        let base_name = base.doc().full_name();
        ty.doc().full_name() == base_name || ty.doc().base_types.iter().any(|b| *b == base_name)
    }

    fn find_type(
        &self,
        module: &BundleModule,
        full_name: &str,
    ) -> ProviderResult<Option<BundleType>> {
        Ok(module
            .doc
            .types
            .iter()
            .position(|t| t.full_name() == full_name)
            .map(|index| BundleType { module: module.clone(), index }))
    }

    fn type_name(&self, ty: &BundleType) -> String {
        ty.doc().name.clone()
    }

    fn type_full_name(&self, ty: &BundleType) -> String {
        ty.doc().full_name()
    }

    fn type_qualified_name(&self, ty: &BundleType) -> String {
        format!("{}, {}", ty.doc().full_name(), ty.module.name())
    }

    fn base_type_names(&self, ty: &BundleType) -> ProviderResult<Vec<String>> {
        Ok(ty.doc().base_types.clone())
    }

    fn field_name(&self, field: &BundleField) -> String {
        field.doc().name.clone()
    }

    fn field_type_name(&self, field: &BundleField) -> String {
        field.doc().type_name.clone()
    }

    fn host_module(&self) -> Option<BundleModule> {
        self.host.clone()
    }

    fn embedded_manifest(&self, module: &BundleModule) -> ProviderResult<Option<String>> {
        Ok(module.doc.manifest.clone())
    }
}

/// Host module defining the default extension node type.
fn builtin_host_module() -> BundleModule {
    let (namespace, name) = DEFAULT_NODE_TYPE.rsplit_once('.').unwrap_or(("", DEFAULT_NODE_TYPE));
    let doc = ModuleDocument {
        name: "addins-host".to_string(),
        types: vec![TypeDocument {
            name: name.to_string(),
            namespace: namespace.to_string(),
            attributes: vec![Attribute::NodeAttribute {
                name: "type".to_string(),
                type_name: Some("System.Type".to_string()),
                required: false,
                description: "Type of the extension object".to_string(),
            }],
            ..TypeDocument::default()
        }],
        ..ModuleDocument::default()
    };
    BundleModule { path: PathBuf::from("<host>"), doc: Arc::new(doc) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODULE: &str = r#"{
        "name": "acme-tools",
        "references": ["helper.dll", "missing.dll"],
        "attributes": [
            { "kind": "addin", "id": "tools", "namespace": "acme", "version": "1.0" },
            { "kind": "dependency", "id": "core", "version": "1.0" }
        ],
        "types": [
            { "name": "Hammer", "namespace": "Acme", "base_types": ["Acme.ITool"],
              "attributes": [{ "kind": "extension", "path": "/acme/tools" }],
              "fields": [{ "name": "label", "type_name": "System.String",
                           "attributes": [{ "kind": "node_attribute", "required": true }] }] },
            { "name": "ITool", "namespace": "Acme" }
        ]
    }"#;

    fn write_module(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_and_query_attributes() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_module(temp_dir.path(), "p.dll", MODULE);

        let provider = BundleProvider::new();
        let module = provider.load_module(&path).unwrap();

        let addin = provider
            .declared_attributes(AttributeTarget::Module(&module), AttributeKind::Addin)
            .unwrap();
        assert_eq!(addin.len(), 1);

        let deps = provider
            .declared_attributes(AttributeTarget::Module(&module), AttributeKind::Dependency)
            .unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn test_types_and_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_module(temp_dir.path(), "p.dll", MODULE);

        let provider = BundleProvider::new();
        let module = provider.load_module(&path).unwrap();
        let types = provider.enumerate_types(&module).unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(provider.type_full_name(&types[0]), "Acme.Hammer");
        assert_eq!(provider.type_name(&types[0]), "Hammer");
        assert_eq!(provider.type_qualified_name(&types[0]), "Acme.Hammer, acme-tools");

        let fields = provider.enumerate_fields(&types[0]).unwrap();
        assert_eq!(provider.field_name(&fields[0]), "label");
        assert_eq!(provider.field_type_name(&fields[0]), "System.String");

        assert!(provider.is_assignable_from(&types[1], &types[0]));
        assert!(!provider.is_assignable_from(&types[0], &types[1]));
    }

    #[test]
    fn test_resolve_references() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_module(temp_dir.path(), "p.dll", MODULE);
        write_module(temp_dir.path(), "helper.dll", r#"{ "name": "helper" }"#);

        let provider = BundleProvider::new();
        let module = provider.load_module(&path).unwrap();
        let refs = provider.enumerate_references(&module).unwrap();
        assert_eq!(refs.len(), 2);

        let helper = provider.resolve_reference(&refs[0]).unwrap().unwrap();
        assert_eq!(helper.name(), "helper");
        assert!(provider.resolve_reference(&refs[1]).unwrap().is_none());
    }

    #[test]
    fn test_malformed_module() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_module(temp_dir.path(), "bad.dll", "MZ\u{0}\u{0}not json");

        let provider = BundleProvider::new();
        let result = provider.load_module(&path);
        assert!(matches!(result, Err(ProviderError::Malformed { .. })));
    }

    #[test]
    fn test_missing_module() {
        let provider = BundleProvider::new();
        let result = provider.load_module(Path::new("/nonexistent/p.dll"));
        assert!(matches!(result, Err(ProviderError::NotFound(_))));
    }

    #[test]
    fn test_host_module_defines_default_node_type() {
        let provider = BundleProvider::new();
        let host = provider.host_module().unwrap();
        let ty = provider.find_type(&host, DEFAULT_NODE_TYPE).unwrap();
        assert!(ty.is_some());
    }
}
