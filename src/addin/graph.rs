//! Extension graph resolution.
//!
//! Turns the raw declarations a [`MetadataProvider`] surfaces into the
//! extension points, node sets and node types of a descriptor.

use std::collections::HashMap;

use uuid::Uuid;

use super::provider::{Attribute, AttributeKind, AttributeTarget, MetadataProvider, ProviderResult};
use super::types::{
    id_name, AddinDependency, AddinDescriptor, ModuleDescription, NodeSet, NodeType,
    NodeTypeAttribute, DEFAULT_NODE_TYPE, TYPE_NODE_NAME, TYPE_PATH_MARKER,
};

/// Module of a descriptor that receives scanned contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleTarget {
    Main,
    Optional(usize),
}

/// Child node sets already built for a node type, keyed by type name and
/// by qualified type name. `None` records a type without children.
pub type NodeSetMemo = HashMap<String, Option<String>>;

#[derive(Debug, Clone, Copy)]
enum SetRef {
    Named(usize),
    Point(usize),
}

/// Resolves extension points and node types for one provider.
pub struct ExtensionGraphResolver<'p, P: MetadataProvider + ?Sized> {
    provider: &'p P,
    host: Option<P::Module>,
}

impl<'p, P: MetadataProvider + ?Sized> ExtensionGraphResolver<'p, P> {
    /// Create a resolver.
    pub fn new(provider: &'p P) -> Self {
        Self { provider, host: provider.host_module() }
    }

    fn module_attributes(
        &self,
        module: &P::Module,
        kind: AttributeKind,
    ) -> ProviderResult<Vec<Attribute>> {
        self.provider.declared_attributes(AttributeTarget::Module(module), kind)
    }

    fn type_attributes(&self, ty: &P::Type, kind: AttributeKind) -> ProviderResult<Vec<Attribute>> {
        self.provider.declared_attributes(AttributeTarget::Type(ty), kind)
    }

    /// Apply the identity attribute of `module`. Returns `false` if it has none.
    pub fn scan_headers(
        &self,
        desc: &mut AddinDescriptor,
        module: &P::Module,
    ) -> ProviderResult<bool> {
        let attrs = self.module_attributes(module, AttributeKind::Addin)?;
        let Some(Attribute::Addin { id, namespace, version, category, is_root }) =
            attrs.into_iter().next()
        else {
            return Ok(false);
        };

        if !id.is_empty() {
            desc.local_id = id;
            desc.has_user_id = true;
        }
        if !version.is_empty() {
            desc.version = version;
        }
        if !namespace.is_empty() {
            desc.namespace = namespace;
        }
        if !category.is_empty() {
            desc.category = category;
        }
        desc.is_root = is_root;
        Ok(true)
    }

    /// Collect dependencies, extension points and contributions declared in `module`.
    ///
    /// Un-pathed contributions of a root descriptor are pushed to `deferred`
    /// and bound later by [`register_host_type_nodes`](Self::register_host_type_nodes).
    pub fn scan_contents(
        &self,
        desc: &mut AddinDescriptor,
        target: ModuleTarget,
        module: &P::Module,
        deferred: &mut Vec<P::Type>,
    ) -> ProviderResult<()> {
        for attr in self.module_attributes(module, AttributeKind::Dependency)? {
            if let Attribute::Dependency { id, version } = attr {
                module_mut(desc, target)
                    .dependencies
                    .push(AddinDependency { addin_id: id, version });
            }
        }

        for attr in self.module_attributes(module, AttributeKind::ExtensionPoint)? {
            if let Attribute::ExtensionPoint {
                path,
                name,
                description,
                node_name,
                node_type_name,
                object_type_name,
            } = attr
            {
                let ep = desc.add_extension_point(&path);
                ep.name = name;
                ep.description = description;
                ep.add_node_type(&node_name, &node_type_name).object_type_name = object_type_name;
            }
        }

        for ty in self.provider.enumerate_types(module)? {
            let full_name = self.provider.type_full_name(&ty);
            let extensions = self.type_attributes(&ty, AttributeKind::Extension)?;

            if extensions.is_empty() {
                self.scan_type_extension_points(desc, &ty, &full_name)?;
                continue;
            }

            let mut is_deferred = false;
            for attr in extensions {
                let Attribute::Extension { path, node_name, id, insert_after, insert_before } = attr
                else {
                    continue;
                };
                let (path, node_name) = if path.is_empty() {
                    if desc.is_root {
                        if !is_deferred {
                            deferred.push(ty.clone());
                            is_deferred = true;
                        }
                        continue;
                    }
                    (self.base_type_path(&ty, &full_name)?, TYPE_NODE_NAME.to_string())
                } else if node_name.is_empty() {
                    (path, TYPE_NODE_NAME.to_string())
                } else {
                    (path, node_name)
                };

                add_type_node(
                    module_mut(desc, target),
                    &path,
                    &node_name,
                    &full_name,
                    &id,
                    &insert_after,
                    &insert_before,
                );
            }
        }

        Ok(())
    }

    fn scan_type_extension_points(
        &self,
        desc: &mut AddinDescriptor,
        ty: &P::Type,
        full_name: &str,
    ) -> ProviderResult<()> {
        for attr in self.type_attributes(ty, AttributeKind::TypeExtensionPoint)? {
            let Attribute::TypeExtensionPoint {
                path,
                name,
                description,
                node_name,
                node_type_name,
            } = attr
            else {
                continue;
            };

            let addin_id = desc.addin_id();
            let (path, object_type_name) = if path.is_empty() {
                (default_type_extension_path(&addin_id, full_name), full_name.to_string())
            } else {
                (path, String::new())
            };

            let ep = desc.add_extension_point(&path);
            ep.add_node_type(&node_name, &node_type_name).object_type_name = object_type_name;
            ep.description = description;
            ep.name = name;
            ep.root_addin.clone_from(&addin_id);
        }
        Ok(())
    }

    /// Bind deferred contributions of a root descriptor to its own extension points.
    ///
    /// Each type binds to the first node type, in declaration order, whose
    /// object type it is assignable to. Returns the full names of types that
    /// matched nothing.
    pub fn register_host_type_nodes(
        &self,
        desc: &mut AddinDescriptor,
        deferred: &[P::Type],
        modules: &[P::Module],
    ) -> ProviderResult<Vec<String>> {
        let candidates: Vec<(String, String, String)> = desc
            .extension_points
            .iter()
            .flat_map(|ep| {
                ep.node_set
                    .node_types
                    .iter()
                    .filter(|nt| !nt.object_type_name.is_empty())
                    .map(|nt| (ep.path.clone(), nt.id.clone(), nt.object_type_name.clone()))
            })
            .collect();

        let mut unbound = Vec::new();
        'types: for ty in deferred {
            let full_name = self.provider.type_full_name(ty);
            let extensions = self.type_attributes(ty, AttributeKind::Extension)?;

            for attr in extensions {
                let Attribute::Extension { path, id, insert_after, insert_before, .. } = attr else {
                    continue;
                };
                if !path.is_empty() {
                    continue;
                }
                for (ep_path, node_id, object_type) in &candidates {
                    let Some(base) = self.find_type(object_type, modules)? else {
                        continue;
                    };
                    if self.provider.is_assignable_from(&base, ty) {
                        add_type_node(
                            &mut desc.main_module,
                            ep_path,
                            node_id,
                            &full_name,
                            &id,
                            &insert_after,
                            &insert_before,
                        );
                        continue 'types;
                    }
                }
            }
            unbound.push(full_name);
        }
        Ok(unbound)
    }

    /// Expand every node type of the descriptor, materializing child node sets.
    pub fn resolve_node_sets(
        &self,
        desc: &mut AddinDescriptor,
        modules: &[P::Module],
    ) -> ProviderResult<()> {
        let mut memo = NodeSetMemo::new();
        let declared = desc.node_sets.len();
        for i in 0..declared {
            self.scan_node_set(desc, SetRef::Named(i), modules, &mut memo)?;
        }
        for i in 0..desc.extension_points.len() {
            self.scan_node_set(desc, SetRef::Point(i), modules, &mut memo)?;
        }
        Ok(())
    }

    fn scan_node_set(
        &self,
        desc: &mut AddinDescriptor,
        set: SetRef,
        modules: &[P::Module],
        memo: &mut NodeSetMemo,
    ) -> ProviderResult<()> {
        let count = node_types_mut(desc, set).len();
        for index in 0..count {
            self.scan_node_type(desc, set, index, modules, memo)?;
        }
        Ok(())
    }

    fn scan_node_type(
        &self,
        desc: &mut AddinDescriptor,
        set: SetRef,
        index: usize,
        modules: &[P::Module],
        memo: &mut NodeSetMemo,
    ) -> ProviderResult<()> {
        let mut nt = node_types_mut(desc, set)[index].clone();
        if nt.type_name.is_empty() {
            nt.type_name = DEFAULT_NODE_TYPE.to_string();
        }

        let Some(ty) = self.find_type(&nt.type_name, modules)? else {
            node_types_mut(desc, set)[index] = nt;
            return Ok(());
        };

        self.apply_node_metadata(&mut nt, &ty)?;

        let qualified = self.provider.type_qualified_name(&ty);
        if let Some(cached) = memo.get(&nt.type_name).or_else(|| memo.get(&qualified)).cloned() {
            if let Some(set_id) = cached {
                if !nt.child_node_set_ids.contains(&set_id) {
                    nt.child_node_set_ids.push(set_id);
                }
            }
            node_types_mut(desc, set)[index] = nt;
            return Ok(());
        }

        let children: Vec<NodeType> = self
            .type_attributes(&ty, AttributeKind::NodeChild)?
            .into_iter()
            .filter_map(|attr| match attr {
                Attribute::NodeChild { node_name, node_type_name } => {
                    Some(NodeType {
                        id: node_name,
                        type_name: node_type_name,
                        ..NodeType::default()
                    })
                }
                _ => None,
            })
            .collect();

        if children.is_empty() {
            memo.insert(nt.type_name.clone(), None);
            memo.insert(qualified, None);
            node_types_mut(desc, set)[index] = nt;
            return Ok(());
        }

        // A fresh set per type keeps self-referencing families finite.
        let set_id = format!("{}_{}", self.provider.type_name(&ty), Uuid::new_v4().simple());
        desc.node_sets.push(NodeSet { id: set_id.clone(), node_types: children });
        let child_set = SetRef::Named(desc.node_sets.len() - 1);

        nt.child_node_set_ids.push(set_id.clone());
        memo.insert(nt.type_name.clone(), Some(set_id.clone()));
        memo.insert(qualified, Some(set_id));
        node_types_mut(desc, set)[index] = nt;

        self.scan_node_set(desc, child_set, modules, memo)
    }

    fn apply_node_metadata(&self, nt: &mut NodeType, ty: &P::Type) -> ProviderResult<()> {
        let attrs = self.type_attributes(ty, AttributeKind::NodeAttribute)?;

        let declaration = attrs.iter().find_map(|a| match a {
            Attribute::ExtensionNode { node_name, description } => Some((node_name, description)),
            _ => None,
        });
        match declaration {
            Some((node_name, description)) => {
                if nt.id.is_empty() && !node_name.is_empty() {
                    nt.id.clone_from(node_name);
                }
                if nt.description.is_empty() && !description.is_empty() {
                    nt.description.clone_from(description);
                }
            }
            None if nt.id.is_empty() => nt.id = self.provider.type_name(ty),
            None => {}
        }

        for attr in &attrs {
            if let Attribute::NodeAttribute { name, type_name, required, description } = attr {
                if !nt.has_attribute(name) {
                    nt.attributes.push(NodeTypeAttribute {
                        name: name.clone(),
                        type_name: type_name.clone().unwrap_or_default(),
                        required: *required,
                        description: description.clone(),
                    });
                }
            }
        }

        for field in self.provider.enumerate_fields(ty)? {
            let attrs = self
                .provider
                .declared_attributes(AttributeTarget::Field(&field), AttributeKind::NodeAttribute)?;
            let Some(Attribute::NodeAttribute { name, required, description, .. }) = attrs
                .into_iter()
                .find(|a| matches!(a, Attribute::NodeAttribute { .. }))
            else {
                continue;
            };

            let name = if name.is_empty() { self.provider.field_name(&field) } else { name };
            if nt.has_attribute(&name) {
                continue;
            }
            nt.attributes.push(NodeTypeAttribute {
                name,
                type_name: self.provider.field_type_name(&field),
                required,
                description,
            });
        }

        Ok(())
    }

    /// Look a type up in the host module, then `modules`, then their references.
    pub fn find_type(
        &self,
        full_name: &str,
        modules: &[P::Module],
    ) -> ProviderResult<Option<P::Type>> {
        if let Some(host) = &self.host {
            if let Some(ty) = self.provider.find_type(host, full_name)? {
                return Ok(Some(ty));
            }
        }

        for module in modules {
            if let Some(ty) = self.provider.find_type(module, full_name)? {
                return Ok(Some(ty));
            }
        }

        let mut visited: Vec<P::Reference> = Vec::new();
        for module in modules {
            for reference in self.provider.enumerate_references(module)? {
                if visited.contains(&reference) {
                    continue;
                }
                let resolved = self.provider.resolve_reference(&reference)?;
                visited.push(reference);
                if let Some(referenced) = resolved {
                    if let Some(ty) = self.provider.find_type(&referenced, full_name)? {
                        return Ok(Some(ty));
                    }
                }
            }
        }

        Ok(None)
    }

    fn base_type_path(&self, ty: &P::Type, full_name: &str) -> ProviderResult<String> {
        let bases = self.provider.base_type_names(ty)?;
        if bases.is_empty() {
            Ok(format!("{TYPE_PATH_MARKER}{full_name}"))
        } else {
            Ok(format!("{TYPE_PATH_MARKER}{}", bases.join(",")))
        }
    }
}

/// Default path of a type extension point that declares none.
pub fn default_type_extension_path(addin_id: &str, type_full_name: &str) -> String {
    format!("/{}/TypeExtensions/{type_full_name}", id_name(addin_id))
}

fn module_mut(desc: &mut AddinDescriptor, target: ModuleTarget) -> &mut ModuleDescription {
    match target {
        ModuleTarget::Optional(i) if i < desc.optional_modules.len() => {
            &mut desc.optional_modules[i]
        }
        _ => &mut desc.main_module,
    }
}

fn node_types_mut(desc: &mut AddinDescriptor, set: SetRef) -> &mut Vec<NodeType> {
    match set {
        SetRef::Named(i) => &mut desc.node_sets[i].node_types,
        SetRef::Point(i) => &mut desc.extension_points[i].node_set.node_types,
    }
}

fn add_type_node(
    module: &mut ModuleDescription,
    path: &str,
    node_name: &str,
    type_full_name: &str,
    id: &str,
    insert_after: &str,
    insert_before: &str,
) {
    let node = module.add_extension_node(path, node_name);
    if id.is_empty() {
        node.set_attribute("id", type_full_name);
    } else {
        node.set_attribute("id", id);
        node.set_attribute("type", type_full_name);
    }
    if !insert_after.is_empty() {
        node.set_attribute("insertafter", insert_after);
    }
    if !insert_before.is_empty() {
        node.set_attribute("insertbefore", insert_before);
    }
}
