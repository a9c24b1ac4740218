//! Per-scan accumulator.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::cache::ScanFolderInfo;
use super::domain::GLOBAL_DOMAIN;

/// Domain restriction of a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionDomain {
    /// Scan folders of every domain.
    Any,
    /// Adopt the domain of the first folder visited.
    #[default]
    Unpinned,
    /// Only scan folders of this domain (and global folders).
    Pinned(String),
}

/// A file waiting for extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedFile {
    pub file: PathBuf,
    pub folder: PathBuf,
}

/// Main module of a root add-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootModule {
    pub file: PathBuf,
    pub addin_id: String,
    pub domain: String,
}

/// Everything one scan call found and decided.
#[derive(Debug, Default, Serialize)]
pub struct ScanSession {
    /// Whether anything on disk differs from the registry.
    pub changes_found: bool,
    /// Whether dependents must be re-resolved.
    pub regenerate_relation_data: bool,
    /// Ignore cached state and extract everything.
    pub regenerate_all_data: bool,
    /// Only detect changes, never extract or uninstall.
    pub check_only: bool,
    /// Only build the module location index.
    pub locate_modules_only: bool,
    /// Files queued for extraction, in classification order.
    pub files_to_scan: Vec<QueuedFile>,
    /// Absolute paths excluded from scanning.
    pub paths_to_ignore: BTreeSet<PathBuf>,
    /// Add-ins whose relation data must be recomputed.
    pub updated_addin_ids: BTreeSet<String>,
    /// Add-ins removed from the registry.
    pub uninstalled_addin_ids: Vec<String>,
    /// Add-ins saved to the registry.
    pub saved_addin_ids: Vec<String>,
    /// Files whose extraction failed.
    pub failed_files: Vec<PathBuf>,
    /// Domain restriction.
    pub domain: SessionDomain,
    /// Folders entered.
    pub visited_folders: BTreeSet<PathBuf>,
    /// Folders whose cache record must be saved.
    pub modified_folders: BTreeSet<PathBuf>,
    /// Module file name to every location it was seen at.
    pub module_locations: BTreeMap<String, Vec<PathBuf>>,
    /// Main modules of root add-ins.
    pub root_modules: Vec<RootModule>,
    /// Files handed to the extractor.
    pub extracted_files: Vec<PathBuf>,
    #[serde(skip)]
    pub(crate) folders: BTreeMap<PathBuf, ScanFolderInfo>,
    #[serde(skip)]
    queued: HashSet<PathBuf>,
    /// Resolved paths of directories entered by recursive walks.
    #[serde(skip)]
    directories: HashSet<PathBuf>,
}

impl ScanSession {
    /// Create a session with the given domain restriction.
    pub fn new(domain: SessionDomain) -> Self {
        Self { domain, ..Self::default() }
    }

    /// Mark a folder visited. Returns `false` if it already was.
    pub fn visit_folder(&mut self, folder: &Path) -> bool {
        self.visited_folders.insert(folder.to_path_buf())
    }

    /// Enter a directory of a recursive walk. Returns `false` if the
    /// directory was already entered, possibly through a symlink.
    pub fn enter_directory(&mut self, dir: &Path) -> bool {
        let resolved = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.directories.insert(resolved)
    }

    /// Queue a file for extraction, once.
    pub fn add_file_to_scan(&mut self, file: &Path, folder: &Path) {
        if self.queued.insert(file.to_path_buf()) {
            self.files_to_scan
                .push(QueuedFile { file: file.to_path_buf(), folder: folder.to_path_buf() });
        }
    }

    /// Whether a file is queued.
    pub fn is_queued(&self, file: &Path) -> bool {
        self.queued.contains(file)
    }

    /// Exclude a path (file or directory) from scanning.
    pub fn add_path_to_ignore(&mut self, path: impl Into<PathBuf>) {
        self.paths_to_ignore.insert(path.into());
    }

    /// Exclude several paths.
    pub fn add_paths_to_ignore<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.add_path_to_ignore(path);
        }
    }

    /// Whether a path is excluded, directly or through an excluded directory.
    pub fn ignore_path(&self, path: &Path) -> bool {
        self.paths_to_ignore.iter().any(|ignored| path.starts_with(ignored))
    }

    /// Mark an add-in for relation update.
    pub fn add_addin_to_update_relations(&mut self, addin_id: &str) {
        self.updated_addin_ids.insert(addin_id.to_string());
    }

    /// Index a module file by name.
    pub fn add_module_location(&mut self, file: &Path) {
        if let Some(name) = file.file_name() {
            let locations =
                self.module_locations.entry(name.to_string_lossy().to_string()).or_default();
            if !locations.iter().any(|l| l == file) {
                locations.push(file.to_path_buf());
            }
        }
    }

    /// Every known location of a module file name.
    pub fn module_locations(&self, name: &str) -> &[PathBuf] {
        self.module_locations.get(name).map_or(&[], Vec::as_slice)
    }

    /// Record that a folder record changed.
    pub fn register_modified_folder(&mut self, folder: &Path) {
        self.modified_folders.insert(folder.to_path_buf());
    }

    /// Record a failed file.
    pub fn record_failure(&mut self, file: &Path) {
        if !self.failed_files.iter().any(|f| f == file) {
            self.failed_files.push(file.to_path_buf());
        }
    }

    /// Adopt `domain` if the session has not been pinned yet.
    pub fn pin_domain(&mut self, domain: &str) {
        if self.domain == SessionDomain::Unpinned {
            self.domain = SessionDomain::Pinned(domain.to_string());
        }
    }

    /// The pinned domain, if any.
    pub fn pinned_domain(&self) -> Option<&str> {
        match &self.domain {
            SessionDomain::Pinned(domain) => Some(domain),
            _ => None,
        }
    }

    /// Whether folders of `domain` fall outside this session.
    pub fn is_excluded(&self, domain: &str) -> bool {
        match &self.domain {
            SessionDomain::Pinned(pinned) => domain != pinned && domain != GLOBAL_DOMAIN,
            SessionDomain::Any | SessionDomain::Unpinned => false,
        }
    }

    /// Cache record of a folder visited in this session.
    pub fn folder_info(&self, folder: &Path) -> Option<&ScanFolderInfo> {
        self.folders.get(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_folder_once() {
        let mut session = ScanSession::default();
        assert!(session.visit_folder(Path::new("/a")));
        assert!(!session.visit_folder(Path::new("/a")));
    }

    #[test]
    fn test_directory_entered_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut session = ScanSession::default();
        assert!(session.enter_directory(temp.path()));
        assert!(!session.enter_directory(&temp.path().join(".")));
        assert!(session.enter_directory(Path::new("/nowhere/gone")));
    }

    #[test]
    fn test_files_queued_once() {
        let mut session = ScanSession::default();
        session.add_file_to_scan(Path::new("/a/p.dll"), Path::new("/a"));
        session.add_file_to_scan(Path::new("/a/p.dll"), Path::new("/a"));
        assert_eq!(session.files_to_scan.len(), 1);
        assert!(session.is_queued(Path::new("/a/p.dll")));
    }

    #[test]
    fn test_ignore_path_covers_directories() {
        let mut session = ScanSession::default();
        session.add_path_to_ignore("/a/helper.dll");
        session.add_path_to_ignore("/a/legacy");

        assert!(session.ignore_path(Path::new("/a/helper.dll")));
        assert!(session.ignore_path(Path::new("/a/legacy/old.dll")));
        assert!(!session.ignore_path(Path::new("/a/helper.dll.bak")));
        assert!(!session.ignore_path(Path::new("/a/legacy2/x.dll")));
    }

    #[test]
    fn test_domain_pinning() {
        let mut session = ScanSession::default();
        assert!(!session.is_excluded("x"));

        session.pin_domain("x");
        session.pin_domain("y");
        assert_eq!(session.pinned_domain(), Some("x"));
        assert!(session.is_excluded("y"));
        assert!(!session.is_excluded("x"));
        assert!(!session.is_excluded(GLOBAL_DOMAIN));
    }

    #[test]
    fn test_any_domain_never_pins() {
        let mut session = ScanSession::new(SessionDomain::Any);
        session.pin_domain("x");
        assert_eq!(session.pinned_domain(), None);
        assert!(!session.is_excluded("y"));
    }

    #[test]
    fn test_module_locations() {
        let mut session = ScanSession::default();
        session.add_module_location(Path::new("/a/p.dll"));
        session.add_module_location(Path::new("/b/p.dll"));
        session.add_module_location(Path::new("/a/p.dll"));
        assert_eq!(session.module_locations("p.dll").len(), 2);
        assert!(session.module_locations("q.dll").is_empty());
    }
}
