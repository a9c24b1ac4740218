//! Metadata provider contract.
//!
//! A [`MetadataProvider`] inspects a loaded module for declarative add-in
//! metadata. The engine never depends on a specific runtime's introspection
//! facilities: everything it needs goes through the operations below, so
//! native libraries, managed assemblies and interpreted bundles can all be
//! backed by their own provider.
//!
//! Every call is fallible. A failure inside a provider is always treated as
//! a failure of the file being scanned, never of the whole scan.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Result type for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Kind of declarative attribute to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Add-in identity (`Addin` / `AddinRoot`).
    Addin,
    /// Dependency on another add-in.
    Dependency,
    /// Module-level extension point declaration.
    ExtensionPoint,
    /// Extension contribution on a type.
    Extension,
    /// Type-level extension point declaration.
    TypeExtensionPoint,
    /// Node attribute declaration (on a node type or one of its fields).
    NodeAttribute,
    /// Child node declaration on a node type.
    NodeChild,
}

/// A declarative attribute surfaced by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attribute {
    /// Add-in identity.
    Addin {
        #[serde(default)]
        id: String,
        #[serde(default)]
        namespace: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        category: String,
        /// Set for add-in roots, which anchor their own domain.
        #[serde(default)]
        is_root: bool,
    },
    /// Dependency on another add-in.
    Dependency {
        id: String,
        #[serde(default)]
        version: String,
    },
    /// Module-level extension point.
    ExtensionPoint {
        path: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        node_name: String,
        #[serde(default)]
        node_type_name: String,
        /// Type contributed objects must be assignable to.
        #[serde(default)]
        object_type_name: String,
    },
    /// Contribution of the annotated type to an extension point.
    Extension {
        #[serde(default)]
        path: String,
        #[serde(default)]
        node_name: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        insert_after: String,
        #[serde(default)]
        insert_before: String,
    },
    /// Extension point whose nodes are instances of the annotated type.
    TypeExtensionPoint {
        #[serde(default)]
        path: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        node_name: String,
        #[serde(default)]
        node_type_name: String,
    },
    /// Node type metadata and node attributes.
    NodeAttribute {
        #[serde(default)]
        name: String,
        #[serde(default)]
        type_name: Option<String>,
        #[serde(default)]
        required: bool,
        #[serde(default)]
        description: String,
    },
    /// Extension node declaration on a node type (name and description).
    ExtensionNode {
        #[serde(default)]
        node_name: String,
        #[serde(default)]
        description: String,
    },
    /// Allowed child node type.
    NodeChild {
        node_name: String,
        node_type_name: String,
    },
}

impl Attribute {
    /// The kind this attribute answers to.
    ///
    /// `ExtensionNode` declarations answer to [`AttributeKind::NodeAttribute`]
    /// queries together with plain node attributes.
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Addin { .. } => AttributeKind::Addin,
            Self::Dependency { .. } => AttributeKind::Dependency,
            Self::ExtensionPoint { .. } => AttributeKind::ExtensionPoint,
            Self::Extension { .. } => AttributeKind::Extension,
            Self::TypeExtensionPoint { .. } => AttributeKind::TypeExtensionPoint,
            Self::NodeAttribute { .. } | Self::ExtensionNode { .. } => {
                AttributeKind::NodeAttribute
            }
            Self::NodeChild { .. } => AttributeKind::NodeChild,
        }
    }
}

/// Target of an attribute query.
pub enum AttributeTarget<'a, P: MetadataProvider + ?Sized> {
    Module(&'a P::Module),
    Type(&'a P::Type),
    Field(&'a P::Field),
}

/// Module inspection backend.
pub trait MetadataProvider {
    /// A loaded module.
    type Module: Clone;
    /// A type defined in a module.
    type Type: Clone;
    /// A field of a type.
    type Field;
    /// A reference from one module to another.
    type Reference: PartialEq;

    /// Load a module for inspection.
    fn load_module(&self, path: &Path) -> ProviderResult<Self::Module>;

    /// Attributes of the given kind declared directly on `target`.
    fn declared_attributes(
        &self,
        target: AttributeTarget<'_, Self>,
        kind: AttributeKind,
    ) -> ProviderResult<Vec<Attribute>>;

    /// Types defined in a module.
    fn enumerate_types(&self, module: &Self::Module) -> ProviderResult<Vec<Self::Type>>;

    /// Fields of a type.
    fn enumerate_fields(&self, ty: &Self::Type) -> ProviderResult<Vec<Self::Field>>;

    /// Modules referenced by a module.
    fn enumerate_references(&self, module: &Self::Module) -> ProviderResult<Vec<Self::Reference>>;

    /// Load a referenced module, `None` if it cannot be located.
    fn resolve_reference(&self, reference: &Self::Reference)
        -> ProviderResult<Option<Self::Module>>;

    /// Whether values of `ty` can be assigned to `base`.
    fn is_assignable_from(&self, base: &Self::Type, ty: &Self::Type) -> bool;

    /// Look up a type by full name in a module.
    fn find_type(
        &self,
        module: &Self::Module,
        full_name: &str,
    ) -> ProviderResult<Option<Self::Type>>;

    /// Short name of a type.
    fn type_name(&self, ty: &Self::Type) -> String;

    /// Full name of a type.
    fn type_full_name(&self, ty: &Self::Type) -> String;

    /// Name qualified with the defining module.
    fn type_qualified_name(&self, ty: &Self::Type) -> String;

    /// Full names of the base types and interfaces of a type, nearest first.
    fn base_type_names(&self, ty: &Self::Type) -> ProviderResult<Vec<String>>;

    /// Name of a field.
    fn field_name(&self, field: &Self::Field) -> String;

    /// Full type name of a field.
    fn field_type_name(&self, field: &Self::Field) -> String;

    /// Module defining the host's own node types, if any.
    fn host_module(&self) -> Option<Self::Module> {
        None
    }

    /// Declarative manifest embedded in a module, if any.
    fn embedded_manifest(&self, _module: &Self::Module) -> ProviderResult<Option<String>> {
        Ok(None)
    }
}
