//! Scan orchestrator.
//!
//! Walks add-in folders, decides which files need extraction, drives the
//! extractor and keeps the registry and the scan cache in sync.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use walkdir::WalkDir;

use super::cache::{
    modified_time, normalize_path, FolderGuard, FolderLookup, ScanCacheStore, ScanFolderInfo,
};
use super::dirlist::{DirectoryList, DomainHint};
use super::domain::{
    assign_addin_domain, is_excluded, pin_session_domain, resolve_folder_domain, GLOBAL_DOMAIN,
};
use super::extract::{ExtractionOutput, FileKind};
use super::manifest::is_manifest_file;
use super::monitor::{LogLevel, ScanMonitor, TracingMonitor};
use super::registry::AddinRegistry;
use super::session::{QueuedFile, RootModule, ScanSession, SessionDomain};
use super::types::{id_name, AddinDescriptor, DEFAULT_VERSION};
use super::worker::{request_for, Extractor};
use super::{ScanError, ScanResult};

/// A folder to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRoot {
    pub path: PathBuf,
    /// Requested domain; `None` asks for a private domain.
    pub domain: Option<String>,
    /// Whether subdirectories are scanned too.
    pub recursive: bool,
}

impl ScanRoot {
    /// Scan `path` alone, in a private domain.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), domain: None, recursive: false }
    }

    /// Scan in the given domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Scan in the global domain.
    pub fn shared(self) -> Self {
        self.with_domain(GLOBAL_DOMAIN)
    }

    /// Scan subdirectories too.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

/// Options of one scan call.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Only detect changes.
    pub check_only: bool,
    /// Extract every file regardless of the cache.
    pub regenerate_all: bool,
    /// Only build the module location index.
    pub locate_modules_only: bool,
    /// Domain restriction of the session.
    pub domain: SessionDomain,
    /// Set to abort the scan.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// File classification settings.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    /// Extensions of loadable modules, without the dot.
    pub module_extensions: Vec<String>,
    /// File name suffixes of declarative manifests.
    pub manifest_suffixes: Vec<String>,
    /// Extension of directory-list files, without the dot.
    pub directory_list_extension: String,
    /// Directories searched for globally resolvable modules.
    pub global_module_dirs: Vec<PathBuf>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            module_extensions: ["dll", "exe", "so", "dylib", "bundle"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            manifest_suffixes: vec![".addin".to_string(), ".addin.toml".to_string()],
            directory_list_extension: "addins".to_string(),
            global_module_dirs: Vec::new(),
        }
    }
}

impl ScannerSettings {
    fn is_manifest(&self, path: &Path) -> bool {
        is_manifest_file(path, &self.manifest_suffixes)
    }

    fn is_module(&self, path: &Path) -> bool {
        !self.is_manifest(path)
            && extension(path).is_some_and(|ext| self.module_extensions.iter().any(|m| *m == ext))
    }

    fn kind_of(&self, path: &Path) -> FileKind {
        if self.is_manifest(path) {
            FileKind::Manifest
        } else {
            FileKind::Module
        }
    }

    fn is_directory_list(&self, path: &Path) -> bool {
        extension(path).is_some_and(|ext| ext == self.directory_list_extension)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// What extracting one file produced.
#[derive(Debug, Default)]
struct FileOutcome {
    success: bool,
    addin_id: Option<String>,
    is_root: bool,
    ignore_paths: Vec<PathBuf>,
}

impl FileOutcome {
    fn failed() -> Self {
        Self::default()
    }
}

/// Scans add-in folders and keeps the registry up to date.
pub struct AddinScanner<R: AddinRegistry, E: Extractor> {
    registry: R,
    cache: Arc<ScanCacheStore>,
    extractor: E,
    monitor: Arc<dyn ScanMonitor>,
    settings: ScannerSettings,
    cancel: Option<Arc<AtomicBool>>,
    /// Writer locks of the folders visited by the running scan.
    held: Vec<FolderGuard>,
}

impl<R: AddinRegistry, E: Extractor> std::fmt::Debug for AddinScanner<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddinScanner")
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<R: AddinRegistry, E: Extractor> AddinScanner<R, E> {
    /// Create a scanner; diagnostics go to `tracing` until a monitor is set.
    pub fn new(registry: R, cache: Arc<ScanCacheStore>, extractor: E) -> Self {
        Self {
            registry,
            cache,
            extractor,
            monitor: Arc::new(TracingMonitor),
            settings: ScannerSettings::default(),
            cancel: None,
            held: Vec::new(),
        }
    }

    /// Send diagnostics to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<dyn ScanMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Use custom classification settings.
    pub fn with_settings(mut self, settings: ScannerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn into_registry(self) -> R {
        self.registry
    }

    pub fn cache(&self) -> &ScanCacheStore {
        &self.cache
    }

    /// Scan `roots` and update the registry.
    ///
    /// Per-file problems are reported to the monitor and recorded in the
    /// session. Only cache store failures and cancellation are returned as
    /// errors.
    ///
    /// The record of every visited folder stays locked until the scan
    /// returns, so scanners sharing a store never interleave writes to it.
    pub fn scan(&mut self, roots: &[ScanRoot], options: &ScanOptions) -> ScanResult<ScanSession> {
        let result = self.run_scan(roots, options);
        self.held.clear();
        result
    }

    fn run_scan(&mut self, roots: &[ScanRoot], options: &ScanOptions) -> ScanResult<ScanSession> {
        let mut session = ScanSession::new(options.domain.clone());
        session.check_only = options.check_only;
        session.regenerate_all_data = options.regenerate_all;
        session.locate_modules_only = options.locate_modules_only;
        self.cancel.clone_from(&options.cancel);

        tracing::info!(
            roots = roots.len(),
            check_only = options.check_only,
            "Starting add-in scan"
        );

        for root in roots {
            self.check_cancelled()?;
            let path = normalize_path(&root.path);
            if root.recursive {
                self.scan_folder_rec(&path, root.domain.as_deref(), &mut session)?;
            } else {
                self.scan_folder(&path, root.domain.as_deref(), &mut session)?;
            }
        }

        let mut index = 0;
        while index < session.files_to_scan.len() {
            self.check_cancelled()?;
            let queued = session.files_to_scan[index].clone();
            self.scan_file(&queued, &mut session);
            index += 1;
        }

        self.save_folders(&session)?;

        tracing::info!(
            changes = session.changes_found,
            saved = session.saved_addin_ids.len(),
            uninstalled = session.uninstalled_addin_ids.len(),
            failed = session.failed_files.len(),
            "Add-in scan finished"
        );
        Ok(session)
    }

    fn check_cancelled(&self) -> ScanResult<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(ScanError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Scan one folder. Returns the folder's domain when it was entered.
    fn scan_folder(
        &mut self,
        path: &Path,
        requested: Option<&str>,
        session: &mut ScanSession,
    ) -> ScanResult<Option<String>> {
        let folder = normalize_path(path);
        if !session.visit_folder(&folder) {
            return Ok(session.folder_info(&folder).map(|info| info.domain.clone()));
        }

        let exists = folder.is_dir();
        let guard = self.cache.lock(&folder);
        let lookup = self.cache.get_or_create(&folder)?;

        let corrupt = matches!(lookup, FolderLookup::Corrupt(_));
        if lookup.is_new() && !corrupt && !exists {
            return Ok(None);
        }
        self.held.push(guard);
        let is_new = lookup.is_new();
        let mut info = lookup.into_info();
        if corrupt {
            session.regenerate_relation_data = true;
            session.register_modified_folder(&folder);
        }

        let domain =
            resolve_folder_domain(&mut info, requested, is_new, &mut self.registry, session);
        pin_session_domain(session, &domain);
        if is_excluded(session, &domain) {
            tracing::debug!(
                folder = %folder.display(),
                domain = %domain,
                "Folder outside the session domain"
            );
            session.folders.insert(folder, info);
            return Ok(Some(domain));
        }

        if !session.locate_modules_only {
            self.monitor.log(LogLevel::Debug, &format!("Checking: {}", folder.display()));
        }

        let mut deleted = false;
        if exists {
            self.classify_folder(&folder, &domain, &mut info, session)?;
        } else if !session.locate_modules_only {
            session.regenerate_relation_data = true;
            session.changes_found = true;
            if session.check_only {
                session.folders.insert(folder, info);
                return Ok(Some(domain));
            }
            self.cache.delete(&info)?;
            deleted = true;
        }

        if !session.locate_modules_only {
            self.update_deleted_addins(&mut info, session);
        }

        if deleted {
            session.modified_folders.remove(&folder);
        } else {
            session.folders.insert(folder, info);
        }
        Ok(Some(domain))
    }

    /// Scan a folder and, depth first, every subdirectory beneath it.
    fn scan_folder_rec(
        &mut self,
        path: &Path,
        requested: Option<&str>,
        session: &mut ScanSession,
    ) -> ScanResult<()> {
        if !session.enter_directory(path) {
            tracing::debug!(folder = %path.display(), "Directory already walked");
            return Ok(());
        }
        let resolved = self.scan_folder(path, requested, session)?;
        if !path.is_dir() {
            return Ok(());
        }

        let inherited = requested.map(str::to_string).or(resolved);
        let subdirs: Vec<PathBuf> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| normalize_path(entry.path()))
            .collect();

        for dir in subdirs {
            self.check_cancelled()?;
            if session.ignore_path(&dir) {
                continue;
            }
            self.scan_folder_rec(&dir, inherited.as_deref(), session)?;
        }
        Ok(())
    }

    fn classify_folder(
        &mut self,
        folder: &Path,
        domain: &str,
        info: &mut ScanFolderInfo,
        session: &mut ScanSession,
    ) -> ScanResult<()> {
        let files: Vec<PathBuf> = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| normalize_path(entry.path()))
            .collect();

        // Exclusions must be known before any module of this folder is classified.
        let mut lists = Vec::new();
        for file in files.iter().filter(|f| self.settings.is_directory_list(f)) {
            match DirectoryList::from_file(file) {
                Ok(list) => {
                    session.add_paths_to_ignore(list.excludes.iter().cloned());
                    lists.push((file.clone(), list));
                }
                Err(e) => {
                    self.monitor.report_error(
                        Some(file),
                        None,
                        &format!("Could not process directory list: {e}"),
                    );
                }
            }
        }

        for file in files.iter().filter(|f| self.settings.is_manifest(f)) {
            if !session.ignore_path(file) {
                self.register_file_to_scan(file, info, session);
            }
        }

        for file in files.iter().filter(|f| self.settings.is_module(f)) {
            session.add_module_location(file);
            if !session.ignore_path(file) {
                self.register_file_to_scan(file, info, session);
            }
        }

        for (list_path, list) in lists {
            self.scan_directory_list(&list_path, &list, domain, session)?;
        }
        Ok(())
    }

    /// Queue a file unless its cache entry shows it is unchanged.
    fn register_file_to_scan(
        &self,
        file: &Path,
        info: &ScanFolderInfo,
        session: &mut ScanSession,
    ) {
        if session.locate_modules_only {
            return;
        }

        let mut added = false;
        if let Some(entry) = info.file(file) {
            let same_domain = !entry.is_addin() || entry.domain == info.domain_for(entry.is_root);
            let unchanged = modified_time(file).is_ok_and(|t| t == entry.last_write_time);
            if same_domain && unchanged && !session.regenerate_all_data {
                if entry.scan_error {
                    // Retried without counting as a change.
                    if !session.check_only {
                        session.add_file_to_scan(file, &info.folder);
                    }
                    added = true;
                }

                let Some(addin_id) = &entry.addin_id else {
                    return;
                };
                if self.registry.descriptor_exists(&entry.domain, addin_id) {
                    session.add_paths_to_ignore(entry.ignore_paths.iter().cloned());
                    return;
                }
            }
        }

        session.changes_found = true;
        if !session.check_only && !added {
            session.add_file_to_scan(file, &info.folder);
        }
    }

    fn scan_directory_list(
        &mut self,
        list_path: &Path,
        list: &DirectoryList,
        folder_domain: &str,
        session: &mut ScanSession,
    ) -> ScanResult<()> {
        let entry_domain = |hint: DomainHint| match hint {
            DomainHint::Shared => Some(GLOBAL_DOMAIN.to_string()),
            DomainHint::Private => None,
            DomainHint::Inherit => Some(folder_domain.to_string()),
        };

        for entry in list.directories.iter().filter(|d| !d.include_subdirs) {
            self.check_cancelled()?;
            if !session.ignore_path(&entry.path) {
                self.scan_folder(&entry.path, entry_domain(entry.domain).as_deref(), session)?;
            }
        }

        for name in &list.global_modules {
            match self.resolve_global_module(name) {
                Some(dir) => {
                    self.scan_folder(&dir, Some(GLOBAL_DOMAIN), session)?;
                }
                None => self.monitor.report_warning(
                    Some(list_path),
                    &format!("Global module '{name}' not found"),
                ),
            }
        }

        for entry in list.directories.iter().filter(|d| d.include_subdirs) {
            self.check_cancelled()?;
            if !session.ignore_path(&entry.path) {
                self.scan_folder_rec(&entry.path, entry_domain(entry.domain).as_deref(), session)?;
            }
        }
        Ok(())
    }

    fn resolve_global_module(&self, name: &str) -> Option<PathBuf> {
        self.settings
            .global_module_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_dir())
    }

    /// Uninstall add-ins whose files disappeared from a folder.
    fn update_deleted_addins(&mut self, info: &mut ScanFolderInfo, session: &mut ScanSession) {
        let missing = info.missing_addins();
        if missing.is_empty() {
            return;
        }
        if info.folder.is_dir() {
            session.register_modified_folder(&info.folder);
        }
        session.changes_found = true;
        if session.check_only {
            return;
        }

        for entry in missing {
            if let Some(addin_id) = &entry.addin_id {
                self.uninstall(&entry.domain, addin_id, session);
            }
        }
    }

    fn uninstall(&mut self, domain: &str, addin_id: &str, session: &mut ScanSession) {
        match self.registry.uninstall_addin(domain, addin_id) {
            Ok(()) => {
                tracing::info!(addin = %addin_id, domain = %domain, "Uninstalled add-in");
                session.uninstalled_addin_ids.push(addin_id.to_string());
                session.add_addin_to_update_relations(addin_id);
            }
            Err(e) => self.monitor.report_error(
                None,
                Some(addin_id),
                &format!("Could not uninstall add-in: {e}"),
            ),
        }
    }

    fn scan_file(&mut self, queued: &QueuedFile, session: &mut ScanSession) {
        let Some(mut info) = session.folders.remove(&queued.folder) else {
            tracing::warn!(folder = %queued.folder.display(), "Queued file without folder record");
            return;
        };
        self.scan_file_in(&queued.file, &mut info, session);
        session.folders.insert(queued.folder.clone(), info);
    }

    fn scan_file_in(&mut self, file: &Path, info: &mut ScanFolderInfo, session: &mut ScanSession) {
        let mtime = match modified_time(file) {
            Ok(mtime) => mtime,
            Err(e) => {
                self.monitor.report_error(Some(file), None, &format!("Could not read file: {e}"));
                session.record_failure(file);
                return;
            }
        };

        // Claimed by another add-in, or crashed the scanner before.
        if session.ignore_path(file) {
            info.set_last_scan_time(file, None, false, mtime, true);
            session.register_modified_folder(&info.folder);
            return;
        }

        let kind = self.settings.kind_of(file);
        session.extracted_files.push(file.to_path_buf());

        let request = request_for(file, kind);
        let outcome = match self.extractor.extract(&request, self.monitor.as_ref()) {
            Ok(output) => {
                self.report_diagnostics(&output);
                // Files claimed by this add-in are not extracted on their own.
                session.add_paths_to_ignore(output.ignore_paths.iter().cloned());
                self.apply_extraction(file, output, info, session)
            }
            Err(ScanError::Crashed { path, reason }) => {
                self.monitor.report_error(
                    Some(&path),
                    None,
                    &format!("Extraction crashed: {reason}"),
                );
                session.record_failure(&path);
                FileOutcome::failed()
            }
            Err(e) => {
                self.monitor.report_error(Some(file), None, &format!("Extraction failed: {e}"));
                FileOutcome::failed()
            }
        };

        let entry = info.set_last_scan_time(
            file,
            outcome.addin_id.as_deref(),
            outcome.is_root,
            mtime,
            !outcome.success,
        );
        if outcome.success {
            entry.ignore_paths = outcome.ignore_paths;
        } else {
            session.record_failure(file);
        }
        session.register_modified_folder(&info.folder);
    }

    fn report_diagnostics(&self, output: &ExtractionOutput) {
        for error in &output.errors {
            self.monitor.report_error(
                error.file.as_deref(),
                error.addin_id.as_deref(),
                &error.message,
            );
        }
        for warning in &output.warnings {
            self.monitor.report_warning(warning.file.as_deref(), &warning.message);
        }
    }

    /// Register the descriptor an extraction produced.
    fn apply_extraction(
        &mut self,
        file: &Path,
        output: ExtractionOutput,
        info: &mut ScanFolderInfo,
        session: &mut ScanSession,
    ) -> FileOutcome {
        for failed in &output.failed_files {
            session.record_failure(failed);
        }
        let Some(mut desc) = output.descriptor else {
            return FileOutcome { success: output.success, ..FileOutcome::default() };
        };

        let previous = info.file(file).cloned();
        if desc.version.is_empty() {
            desc.version = DEFAULT_VERSION.to_string();
        }
        if desc.local_id.is_empty() {
            let previous_id = previous.as_ref().and_then(|p| p.addin_id.as_deref());
            desc.local_id = self.registry.allocate_unique_addin_id(
                file,
                previous_id,
                &desc.namespace,
                &desc.version,
            );
            desc.has_user_id = false;
        }

        let addin_id = desc.addin_id();
        let mut errors = desc.verify();
        if self.registry.is_global_only() && !id_name(&addin_id).contains('.') {
            errors.push("Add-ins in a global-only registry must have a namespace".to_string());
        }
        let mut success = true;
        if !errors.is_empty() {
            success = false;
            self.monitor.report_error(Some(file), Some(&addin_id), "Errors found in add-in");
            for error in &errors {
                self.monitor.report_error(Some(file), Some(&addin_id), error);
            }
        }

        desc.set_extensions_addin_id(&addin_id);
        session.changes_found = true;

        let lookup_domain = info.domain_for(desc.is_root).to_string();
        let mut replace_file = None;
        match self.registry.get_descriptor(&lookup_domain, &addin_id) {
            Ok(Some(existing)) => {
                desc.merge_external_data(&existing);
                add_dependencies(&existing, session);
                replace_file = existing.file_name;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    addin = %addin_id,
                    error = %e,
                    "Could not read registered descriptor"
                );
                session.regenerate_relation_data = true;
            }
        }

        if let Some(previous_id) = previous.as_ref().and_then(|p| p.addin_id.clone()) {
            if previous_id != addin_id {
                let previous_domain =
                    previous.as_ref().map(|p| p.domain.clone()).unwrap_or_default();
                self.uninstall(&previous_domain, &previous_id, session);
                if id_name(&previous_id) != id_name(&addin_id) {
                    session.regenerate_relation_data = true;
                }
            }
        }

        if !success {
            return FileOutcome::failed();
        }

        if assign_addin_domain(info, &mut desc, session, &mut self.registry) {
            session.register_modified_folder(&info.folder);
        }
        if desc.is_root {
            for name in &desc.main_module.assemblies {
                session.root_modules.push(RootModule {
                    file: normalize_path(&desc.base_path.join(name)),
                    addin_id: addin_id.clone(),
                    domain: desc.domain.clone(),
                });
            }
        }

        match self.registry.save_descriptor(&desc, replace_file.as_deref()) {
            Ok(true) => {
                tracing::info!(
                    addin = %addin_id,
                    domain = %desc.domain,
                    file = %file.display(),
                    "Registered add-in"
                );
                add_dependencies(&desc, session);
                session.add_addin_to_update_relations(&addin_id);
                session.saved_addin_ids.push(addin_id.clone());
                FileOutcome {
                    success: true,
                    addin_id: Some(addin_id),
                    is_root: desc.is_root,
                    ignore_paths: output.ignore_paths,
                }
            }
            Ok(false) => {
                self.monitor.report_error(Some(file), Some(&addin_id), "Registry rejected add-in");
                FileOutcome::failed()
            }
            Err(e) => {
                self.monitor.report_error(
                    Some(file),
                    Some(&addin_id),
                    &format!("Could not save add-in: {e}"),
                );
                FileOutcome::failed()
            }
        }
    }

    fn save_folders(&self, session: &ScanSession) -> ScanResult<()> {
        if session.check_only {
            return Ok(());
        }
        for folder in &session.modified_folders {
            if let Some(info) = session.folder_info(folder) {
                self.cache.save(info)?;
            }
        }
        Ok(())
    }

    /// Extract a single file into a global-domain descriptor.
    ///
    /// Neither the cache nor the registry is touched.
    pub fn scan_single_file(&mut self, file: &Path) -> ScanResult<Option<AddinDescriptor>> {
        let file = normalize_path(file);
        let kind = self.settings.kind_of(&file);
        let output = self.extractor.extract(&request_for(&file, kind), self.monitor.as_ref())?;
        self.report_diagnostics(&output);

        if !output.success {
            return Ok(None);
        }
        let Some(mut desc) = output.descriptor else {
            return Ok(None);
        };

        desc.domain = GLOBAL_DOMAIN.to_string();
        if desc.version.is_empty() {
            desc.version = DEFAULT_VERSION.to_string();
        }
        if desc.local_id.is_empty() {
            desc.local_id =
                self.registry.allocate_unique_addin_id(&file, None, &desc.namespace, &desc.version);
            desc.has_user_id = false;
        }
        Ok(Some(desc))
    }
}

fn add_dependencies(desc: &AddinDescriptor, session: &mut ScanSession) {
    for id in desc.dependency_ids() {
        session.add_addin_to_update_relations(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addin::bundle::BundleProvider;
    use crate::addin::monitor::RecordingMonitor;
    use crate::addin::registry::MemoryRegistry;
    use crate::addin::worker::{ExtractionRequest, InProcessExtractor};
    use tempfile::TempDir;

    type TestScanner = AddinScanner<MemoryRegistry, InProcessExtractor<BundleProvider>>;

    fn scanner(temp: &TempDir) -> (TestScanner, Arc<RecordingMonitor>) {
        let cache = Arc::new(ScanCacheStore::open(temp.path().join("cache")).unwrap());
        let monitor = Arc::new(RecordingMonitor::new());
        let scanner = AddinScanner::new(
            MemoryRegistry::new(),
            cache,
            InProcessExtractor::new(BundleProvider::new()),
        )
        .with_monitor(monitor.clone());
        (scanner, monitor)
    }

    /// Records whether the folder record was locked while a file was extracted.
    struct LockCheckingExtractor {
        inner: InProcessExtractor<BundleProvider>,
        cache: Arc<ScanCacheStore>,
        locked: AtomicBool,
    }

    impl Extractor for LockCheckingExtractor {
        fn extract(
            &self,
            request: &ExtractionRequest,
            monitor: &dyn ScanMonitor,
        ) -> ScanResult<ExtractionOutput> {
            let folder = request.file.parent().unwrap();
            self.locked.store(self.cache.try_lock(folder).is_none(), Ordering::Relaxed);
            self.inner.extract(request, monitor)
        }
    }

    fn addin(id: &str) -> String {
        format!(r#"{{ "attributes": [{{ "kind": "addin", "id": "{id}", "version": "1.0" }}] }}"#)
    }

    #[test]
    fn test_settings_classification() {
        let settings = ScannerSettings::default();
        assert!(settings.is_module(Path::new("/a/p.DLL")));
        assert!(settings.is_module(Path::new("/a/libp.so")));
        assert!(!settings.is_module(Path::new("/a/p.addin.toml")));
        assert!(settings.is_manifest(Path::new("/a/p.addin.toml")));
        assert!(settings.is_manifest(Path::new("/a/p.addin")));
        assert!(settings.is_directory_list(Path::new("/a/more.addins")));
        assert!(!settings.is_directory_list(Path::new("/a/p.addin")));
    }

    #[test]
    fn test_scan_registers_addin() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();
        std::fs::write(dir.join("readme.txt"), "not a module").unwrap();

        let (mut scanner, monitor) = scanner(&temp);
        let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();

        assert!(session.changes_found);
        assert_eq!(session.saved_addin_ids, vec!["tools@1.0"]);
        assert_eq!(monitor.scanned_files(), vec![normalize_path(&dir.join("p.dll"))]);
        assert_eq!(scanner.registry().len(), 1);
    }

    #[test]
    fn test_check_only_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();

        let (mut scanner, monitor) = scanner(&temp);
        let options = ScanOptions { check_only: true, ..ScanOptions::default() };
        let session = scanner.scan(&[ScanRoot::new(&dir)], &options).unwrap();

        assert!(session.changes_found);
        assert!(session.files_to_scan.is_empty());
        assert!(monitor.scanned_files().is_empty());
        assert!(scanner.registry().is_empty());
    }

    #[test]
    fn test_missing_root_folder_is_ignored() {
        let temp = TempDir::new().unwrap();
        let (mut scanner, _) = scanner(&temp);
        let session = scanner
            .scan(&[ScanRoot::new(temp.path().join("nowhere"))], &ScanOptions::default())
            .unwrap();
        assert!(!session.changes_found);
        assert!(session.modified_folders.is_empty());
    }

    #[test]
    fn test_cancelled_scan() {
        let temp = TempDir::new().unwrap();
        let (mut scanner, _) = scanner(&temp);
        let cancel = Arc::new(AtomicBool::new(true));
        let options = ScanOptions { cancel: Some(cancel), ..ScanOptions::default() };

        let result = scanner.scan(&[ScanRoot::new(temp.path())], &options);
        assert!(matches!(result, Err(ScanError::Cancelled)));
    }

    #[test]
    fn test_generated_id_and_default_version() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("anon.dll"), r#"{ "attributes": [{ "kind": "addin" }] }"#).unwrap();

        let (mut scanner, _) = scanner(&temp);
        let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();

        assert_eq!(session.saved_addin_ids.len(), 1);
        let id = &session.saved_addin_ids[0];
        assert!(id.starts_with("__anon_"), "{id}");
        assert!(id.ends_with("@0.0.0.0"));
    }

    #[test]
    fn test_global_only_registry_requires_namespace() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();

        let cache = Arc::new(ScanCacheStore::open(temp.path().join("cache")).unwrap());
        let monitor = Arc::new(RecordingMonitor::new());
        let mut scanner = AddinScanner::new(
            MemoryRegistry::new().with_global_only(true),
            cache,
            InProcessExtractor::new(BundleProvider::new()),
        )
        .with_monitor(monitor.clone());

        let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();
        assert!(session.saved_addin_ids.is_empty());
        assert_eq!(session.failed_files, vec![normalize_path(&dir.join("p.dll"))]);
        assert!(monitor.error_count() >= 2);
    }

    #[test]
    fn test_registry_rejection_is_a_failure() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();

        let (mut scanner, _) = scanner(&temp);
        scanner.registry_mut().reject("tools@1.0");
        let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();

        assert!(session.saved_addin_ids.is_empty());
        assert_eq!(session.failed_files.len(), 1);
    }

    #[test]
    fn test_root_addin_gets_roots_domain() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("host");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join("host.exe"),
            r#"{ "attributes": [{ "kind": "addin", "id": "host", "is_root": true }] }"#,
        )
        .unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();

        let (mut scanner, _) = scanner(&temp);
        let options = ScanOptions { domain: SessionDomain::Any, ..ScanOptions::default() };
        let session = scanner.scan(&[ScanRoot::new(&dir).shared()], &options).unwrap();

        assert_eq!(session.root_modules.len(), 1);
        let root = &session.root_modules[0];
        assert_eq!(root.addin_id, "host@0.0.0.0");
        assert_ne!(root.domain, GLOBAL_DOMAIN);
        assert!(scanner.registry().get(&root.domain, "host@0.0.0.0").is_some());
        assert!(scanner.registry().get(GLOBAL_DOMAIN, "tools@1.0").is_some());
    }

    #[test]
    fn test_folder_record_locked_until_scan_returns() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p.dll"), addin("tools")).unwrap();

        let cache = Arc::new(ScanCacheStore::open(temp.path().join("cache")).unwrap());
        let extractor = LockCheckingExtractor {
            inner: InProcessExtractor::new(BundleProvider::new()),
            cache: cache.clone(),
            locked: AtomicBool::new(false),
        };
        let mut scanner = AddinScanner::new(MemoryRegistry::new(), cache.clone(), extractor);
        let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();

        assert_eq!(session.saved_addin_ids, vec!["tools@1.0"]);
        assert!(scanner.extractor.locked.load(Ordering::Relaxed));
        assert!(scanner.held.is_empty());
        assert!(cache.try_lock(&normalize_path(&dir)).is_some());
    }

    /// Cancels the scan it belongs to after the first extraction.
    struct CancellingExtractor {
        inner: InProcessExtractor<BundleProvider>,
        cancel: Arc<AtomicBool>,
    }

    impl Extractor for CancellingExtractor {
        fn extract(
            &self,
            request: &ExtractionRequest,
            monitor: &dyn ScanMonitor,
        ) -> ScanResult<ExtractionOutput> {
            self.cancel.store(true, Ordering::Relaxed);
            self.inner.extract(request, monitor)
        }
    }

    #[test]
    fn test_cancelled_scan_releases_folder_locks() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a.dll"), addin("a")).unwrap();
        std::fs::write(dir.join("b.dll"), addin("b")).unwrap();

        let cache = Arc::new(ScanCacheStore::open(temp.path().join("cache")).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));
        let extractor = CancellingExtractor {
            inner: InProcessExtractor::new(BundleProvider::new()),
            cancel: cancel.clone(),
        };
        let mut scanner = AddinScanner::new(MemoryRegistry::new(), cache.clone(), extractor);
        let options = ScanOptions { cancel: Some(cancel), ..ScanOptions::default() };

        let result = scanner.scan(&[ScanRoot::new(&dir)], &options);
        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(scanner.held.is_empty());
        assert!(cache.try_lock(&normalize_path(&dir)).is_some());
    }

    #[test]
    fn test_scan_single_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("p.dll");
        std::fs::write(&path, r#"{ "attributes": [{ "kind": "addin", "namespace": "acme" }] }"#)
            .unwrap();

        let (mut scanner, _) = scanner(&temp);
        let desc = scanner.scan_single_file(&path).unwrap().unwrap();
        assert_eq!(desc.domain, GLOBAL_DOMAIN);
        assert_eq!(desc.version, DEFAULT_VERSION);
        assert!(desc.local_id.starts_with("__p_"));
        assert!(!desc.has_user_id);
        assert!(scanner.registry().is_empty());
    }

    #[test]
    fn test_module_locations_indexed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("addins");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("lib.dll"), r#"{ }"#).unwrap();

        let (mut scanner, monitor) = scanner(&temp);
        let options = ScanOptions { locate_modules_only: true, ..ScanOptions::default() };
        let session = scanner.scan(&[ScanRoot::new(&dir)], &options).unwrap();

        assert_eq!(session.module_locations("lib.dll"), &[normalize_path(&dir.join("lib.dll"))]);
        assert!(monitor.scanned_files().is_empty());
    }
}
