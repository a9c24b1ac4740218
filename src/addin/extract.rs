//! Single-file descriptor extraction.
//!
//! Runs inside the orchestrator (in-process extraction) or inside an isolated
//! worker. Its output is plain data so it can cross the process boundary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::cache::normalize_path;
use super::graph::{ExtensionGraphResolver, ModuleTarget};
use super::manifest::AddinManifest;
use super::provider::MetadataProvider;
use super::types::AddinDescriptor;
use super::{ProviderError, ScanResult};

/// How a file must be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Declarative TOML manifest.
    Manifest,
    /// Loadable module inspected through the metadata provider.
    Module,
}

/// A diagnostic produced while extracting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: Option<PathBuf>,
    pub addin_id: Option<String>,
    pub message: String,
}

/// Result of extracting one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOutput {
    /// Descriptor built from the file, `None` if the file is not an add-in
    /// or extraction failed.
    pub descriptor: Option<AddinDescriptor>,
    /// Whether extraction succeeded.
    pub success: bool,
    /// Absolute paths the descriptor claims; the scanner must not scan them on their own.
    pub ignore_paths: Vec<PathBuf>,
    /// Files that could not be loaded.
    pub failed_files: Vec<PathBuf>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ExtractionOutput {
    fn error(&mut self, file: &Path, addin_id: Option<String>, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            file: Some(file.to_path_buf()),
            addin_id,
            message: message.into(),
        });
    }

    fn warning(&mut self, file: &Path, message: impl Into<String>) {
        self.warnings.push(Diagnostic {
            file: Some(file.to_path_buf()),
            addin_id: None,
            message: message.into(),
        });
    }

    fn fail(&mut self, file: &Path) {
        if !self.failed_files.iter().any(|f| f == file) {
            self.failed_files.push(file.to_path_buf());
        }
    }
}

/// Extract the descriptor declared by `file`.
///
/// Never fails: every problem is recorded in the output and `success` is
/// cleared.
pub fn extract_file<P: MetadataProvider + ?Sized>(
    provider: &P,
    file: &Path,
    kind: FileKind,
) -> ExtractionOutput {
    let mut out = ExtractionOutput::default();
    let base_path = file.parent().map(Path::to_path_buf).unwrap_or_default();

    let descriptor = match kind {
        FileKind::Manifest => read_manifest(file, &base_path),
        FileKind::Module => read_module_header(provider, file, &base_path),
    };

    let mut descriptor = match descriptor {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            out.success = true;
            return out;
        }
        Err(e) => {
            out.error(file, None, e.to_string());
            out.fail(file);
            return out;
        }
    };

    if scan_description(provider, &mut descriptor, &mut out) {
        out.success = true;
        out.descriptor = Some(descriptor);
    }
    out
}

fn read_manifest(file: &Path, base_path: &Path) -> ScanResult<Option<AddinDescriptor>> {
    let manifest = AddinManifest::from_file(file)?;
    manifest.validate(file)?;
    Ok(Some(manifest.into_descriptor(base_path, file)))
}

fn read_module_header<P: MetadataProvider + ?Sized>(
    provider: &P,
    file: &Path,
    base_path: &Path,
) -> ScanResult<Option<AddinDescriptor>> {
    let module = provider.load_module(file)?;

    let mut descriptor = match provider.embedded_manifest(&module)? {
        Some(content) => {
            let manifest = AddinManifest::from_toml(&content, file)?;
            manifest.validate(file)?;
            manifest.into_descriptor(base_path, file)
        }
        None => {
            let mut descriptor = AddinDescriptor {
                base_path: base_path.to_path_buf(),
                source_file: file.to_path_buf(),
                ..AddinDescriptor::default()
            };
            let resolver = ExtensionGraphResolver::new(provider);
            if !resolver.scan_headers(&mut descriptor, &module)? {
                return Ok(None);
            }
            descriptor
        }
    };

    let file_name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if !descriptor.main_module.assemblies.contains(&file_name) {
        descriptor.main_module.assemblies.insert(0, file_name);
    }
    Ok(Some(descriptor))
}

/// Inspect the modules of a descriptor and fill in its extension graph.
fn scan_description<P: MetadataProvider + ?Sized>(
    provider: &P,
    desc: &mut AddinDescriptor,
    out: &mut ExtractionOutput,
) -> bool {
    let base_path = desc.base_path.clone();
    for path in desc.all_files().iter().chain(desc.all_ignore_paths().iter()) {
        let path = normalize_path(&base_path.join(path));
        if !out.ignore_paths.contains(&path) {
            out.ignore_paths.push(path);
        }
    }

    let mut modules = Vec::new();
    for name in desc.main_module.assemblies.clone() {
        let path = base_path.join(&name);
        match provider.load_module(&path) {
            Ok(module) => modules.push(module),
            Err(e) => {
                out.error(&path, Some(desc.addin_id()), format!("Could not load module: {e}"));
                out.fail(&path);
                out.warning(
                    &desc.source_file,
                    format!("[{}] Could not load some add-in modules", desc.addin_id()),
                );
                return false;
            }
        }
    }

    let resolver = ExtensionGraphResolver::new(provider);
    if let Err(e) = resolve_main_modules(&resolver, desc, &modules, out) {
        report_provider_error(desc, e, out);
        return false;
    }

    if !desc.is_root {
        for index in 0..desc.optional_modules.len() {
            for name in desc.optional_modules[index].assemblies.clone() {
                let path = base_path.join(&name);
                let scanned = provider.load_module(&path).and_then(|module| {
                    let mut deferred = Vec::new();
                    let target = ModuleTarget::Optional(index);
                    resolver.scan_contents(desc, target, &module, &mut deferred)
                });
                if let Err(e) = scanned {
                    out.error(
                        &path,
                        Some(desc.addin_id()),
                        format!("Could not load optional module: {e}"),
                    );
                }
            }
        }
    }

    true
}

fn resolve_main_modules<P: MetadataProvider + ?Sized>(
    resolver: &ExtensionGraphResolver<'_, P>,
    desc: &mut AddinDescriptor,
    modules: &[P::Module],
    out: &mut ExtractionOutput,
) -> Result<(), ProviderError> {
    for module in modules {
        resolver.scan_headers(desc, module)?;
    }

    let mut deferred = Vec::new();
    for module in modules {
        resolver.scan_contents(desc, ModuleTarget::Main, module, &mut deferred)?;
    }

    if !deferred.is_empty() {
        let unbound = resolver.register_host_type_nodes(desc, &deferred, modules)?;
        for name in unbound {
            out.warning(
                &desc.source_file,
                format!("Type '{name}' extends no extension point declared by this add-in"),
            );
        }
    }

    resolver.resolve_node_sets(desc, modules)
}

fn report_provider_error(desc: &AddinDescriptor, error: ProviderError, out: &mut ExtractionOutput) {
    let file = desc.source_file.clone();
    out.error(&file, Some(desc.addin_id()), format!("Error while scanning add-in: {error}"));
    out.fail(&file);
    out.warning(&file, format!("[{}] Could not load some add-in modules", desc.addin_id()));
}
