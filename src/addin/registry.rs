//! Add-in registry.
//!
//! The registry owns persisted descriptors. The scanner only talks to it
//! through [`AddinRegistry`], so hosts can plug in their own storage.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::types::{id_name, AddinDescriptor};
use super::{ScanError, ScanResult};

/// Storage for add-in descriptors, partitioned by domain.
pub trait AddinRegistry {
    /// Whether a descriptor is registered.
    fn descriptor_exists(&self, domain: &str, addin_id: &str) -> bool;

    /// Load a descriptor. `Err` means the entry exists but cannot be read.
    fn get_descriptor(&self, domain: &str, addin_id: &str) -> ScanResult<Option<AddinDescriptor>>;

    /// Persist a descriptor, replacing `replace_file` if given.
    ///
    /// `Ok(false)` means the registry refused the descriptor.
    fn save_descriptor(
        &mut self,
        descriptor: &AddinDescriptor,
        replace_file: Option<&Path>,
    ) -> ScanResult<bool>;

    /// Remove a descriptor.
    fn uninstall_addin(&mut self, domain: &str, addin_id: &str) -> ScanResult<()>;

    /// Create a new private domain id.
    fn allocate_unique_domain_id(&mut self) -> String;

    /// Generate a local id for an add-in that declares none.
    fn allocate_unique_addin_id(
        &self,
        source_file: &Path,
        previous_id: Option<&str>,
        namespace: &str,
        version: &str,
    ) -> String {
        generated_addin_id(source_file, previous_id, namespace, version)
    }

    /// Whether every add-in lives in the global domain.
    fn is_global_only(&self) -> bool;

    /// Registered descriptors, optionally restricted to one domain.
    fn list_descriptors(&self, domain: Option<&str>) -> ScanResult<Vec<AddinDescriptor>>;
}

/// Deterministic local id derived from the source file.
///
/// A previously generated id is reused so the add-in keeps its identity
/// across rescans.
pub fn generated_addin_id(
    source_file: &Path,
    previous_id: Option<&str>,
    namespace: &str,
    _version: &str,
) -> String {
    if let Some(previous) = previous_id {
        let name = id_name(previous);
        let local = match namespace {
            "" => name,
            ns => name.strip_prefix(ns).and_then(|n| n.strip_prefix('.')).unwrap_or(name),
        };
        if local.starts_with("__") {
            return local.to_string();
        }
    }

    let stem = source_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .replace(['.', '@'], "_");
    let mut hasher = Sha256::new();
    hasher.update(source_file.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("__{stem}_{}", &digest[..8])
}

fn new_domain_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Registry storing one JSON file per descriptor under `<root>/addins/<domain>/`.
#[derive(Debug)]
pub struct FileRegistry {
    root: PathBuf,
    global_only: bool,
}

impl FileRegistry {
    /// Open a registry rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> ScanResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("addins")).map_err(|e| {
            ScanError::Registry(format!("cannot create registry {}: {e}", root.display()))
        })?;
        Ok(Self { root, global_only: false })
    }

    /// Only accept add-ins in the global domain.
    pub fn with_global_only(mut self, global_only: bool) -> Self {
        self.global_only = global_only;
        self
    }

    /// Registry root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_dir(&self, domain: &str) -> PathBuf {
        self.root.join("addins").join(sanitize(domain))
    }

    fn descriptor_path(&self, domain: &str, addin_id: &str) -> PathBuf {
        self.domain_dir(domain).join(format!("{}.json", sanitize(addin_id)))
    }

    fn read_descriptor(path: &Path) -> ScanResult<AddinDescriptor> {
        let content = std::fs::read_to_string(path)?;
        let mut descriptor: AddinDescriptor = serde_json::from_str(&content).map_err(|e| {
            ScanError::Registry(format!("cannot read descriptor {}: {e}", path.display()))
        })?;
        descriptor.file_name = Some(path.to_path_buf());
        Ok(descriptor)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || "._-@,".contains(c) { c } else { '_' })
        .collect()
}

impl AddinRegistry for FileRegistry {
    fn descriptor_exists(&self, domain: &str, addin_id: &str) -> bool {
        self.descriptor_path(domain, addin_id).is_file()
    }

    fn get_descriptor(&self, domain: &str, addin_id: &str) -> ScanResult<Option<AddinDescriptor>> {
        let path = self.descriptor_path(domain, addin_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_descriptor(&path).map(Some)
    }

    fn save_descriptor(
        &mut self,
        descriptor: &AddinDescriptor,
        replace_file: Option<&Path>,
    ) -> ScanResult<bool> {
        let addin_id = descriptor.addin_id();
        let path = self.descriptor_path(&descriptor.domain, &addin_id);

        if let Ok(Some(existing)) = self.get_descriptor(&descriptor.domain, &addin_id) {
            if duplicate_of(&existing, descriptor) {
                tracing::warn!(
                    addin = %addin_id,
                    existing = %existing.source_file.display(),
                    "Add-in id already registered by another file"
                );
                return Ok(false);
            }
        }

        std::fs::create_dir_all(self.domain_dir(&descriptor.domain))?;
        let content = serde_json::to_string_pretty(descriptor)
            .map_err(|e| ScanError::Registry(e.to_string()))?;
        std::fs::write(&path, content)?;

        if let Some(old) = replace_file {
            if old != path && old.exists() {
                std::fs::remove_file(old)?;
            }
        }

        tracing::debug!(addin = %addin_id, domain = %descriptor.domain, "Saved add-in descriptor");
        Ok(true)
    }

    fn uninstall_addin(&mut self, domain: &str, addin_id: &str) -> ScanResult<()> {
        let path = self.descriptor_path(domain, addin_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(addin = %addin_id, domain = %domain, "Uninstalled add-in");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn allocate_unique_domain_id(&mut self) -> String {
        loop {
            let id = new_domain_id();
            if !self.domain_dir(&id).exists() {
                return id;
            }
        }
    }

    fn is_global_only(&self) -> bool {
        self.global_only
    }

    fn list_descriptors(&self, domain: Option<&str>) -> ScanResult<Vec<AddinDescriptor>> {
        let dirs: Vec<PathBuf> = match domain {
            Some(domain) => vec![self.domain_dir(domain)],
            None => std::fs::read_dir(self.root.join("addins"))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect(),
        };

        let mut descriptors = Vec::new();
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    match Self::read_descriptor(&path) {
                        Ok(descriptor) => descriptors.push(descriptor),
                        Err(e) => {
                            tracing::warn!(
                                file = %path.display(),
                                error = %e,
                                "Skipping unreadable descriptor"
                            );
                        }
                    }
                }
            }
        }

        descriptors.sort_by(|a, b| (&a.domain, a.addin_id()).cmp(&(&b.domain, b.addin_id())));
        Ok(descriptors)
    }
}

/// Whether `existing` is a different add-in that already owns the id.
fn duplicate_of(existing: &AddinDescriptor, descriptor: &AddinDescriptor) -> bool {
    existing.source_file != descriptor.source_file && existing.source_file.exists()
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    descriptors: BTreeMap<(String, String), AddinDescriptor>,
    global_only: bool,
    rejected: HashSet<String>,
    unreadable: HashSet<String>,
    uninstalled: Vec<(String, String)>,
    saved: Vec<String>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept add-ins in the global domain.
    pub fn with_global_only(mut self, global_only: bool) -> Self {
        self.global_only = global_only;
        self
    }

    /// Refuse to save the add-in with this id.
    pub fn reject(&mut self, addin_id: &str) {
        self.rejected.insert(addin_id.to_string());
    }

    /// Make lookups of this id fail as if the entry were damaged.
    pub fn mark_unreadable(&mut self, addin_id: &str) {
        self.unreadable.insert(addin_id.to_string());
    }

    /// Every `(domain, addin_id)` passed to `uninstall_addin`, in order.
    pub fn uninstalled(&self) -> &[(String, String)] {
        &self.uninstalled
    }

    /// Ids of every accepted save, in order.
    pub fn saved(&self) -> &[String] {
        &self.saved
    }

    /// Look up a descriptor without going through the trait.
    pub fn get(&self, domain: &str, addin_id: &str) -> Option<&AddinDescriptor> {
        self.descriptors.get(&(domain.to_string(), addin_id.to_string()))
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl AddinRegistry for MemoryRegistry {
    fn descriptor_exists(&self, domain: &str, addin_id: &str) -> bool {
        self.get(domain, addin_id).is_some()
    }

    fn get_descriptor(&self, domain: &str, addin_id: &str) -> ScanResult<Option<AddinDescriptor>> {
        if self.unreadable.contains(addin_id) {
            return Err(ScanError::Registry(format!("descriptor {addin_id} is unreadable")));
        }
        Ok(self.get(domain, addin_id).cloned())
    }

    fn save_descriptor(
        &mut self,
        descriptor: &AddinDescriptor,
        _replace_file: Option<&Path>,
    ) -> ScanResult<bool> {
        let addin_id = descriptor.addin_id();
        if self.rejected.contains(&addin_id) {
            return Ok(false);
        }
        let key = (descriptor.domain.clone(), addin_id.clone());
        if self.descriptors.get(&key).is_some_and(|existing| duplicate_of(existing, descriptor)) {
            return Ok(false);
        }
        self.descriptors.insert(key, descriptor.clone());
        self.saved.push(addin_id);
        Ok(true)
    }

    fn uninstall_addin(&mut self, domain: &str, addin_id: &str) -> ScanResult<()> {
        self.descriptors.remove(&(domain.to_string(), addin_id.to_string()));
        self.uninstalled.push((domain.to_string(), addin_id.to_string()));
        Ok(())
    }

    fn allocate_unique_domain_id(&mut self) -> String {
        new_domain_id()
    }

    fn is_global_only(&self) -> bool {
        self.global_only
    }

    fn list_descriptors(&self, domain: Option<&str>) -> ScanResult<Vec<AddinDescriptor>> {
        Ok(self
            .descriptors
            .iter()
            .filter(|((d, _), _)| domain.is_none_or(|wanted| wanted == d))
            .map(|(_, descriptor)| descriptor.clone())
            .collect())
    }
}
