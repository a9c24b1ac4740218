//! Scan cache store.
//!
//! One JSON record per scanned folder remembers, for every file seen there,
//! when it was last scanned, which add-in it produced and whether the scan
//! failed. Records live under `<cache_dir>/folders/` and are named after a
//! hash of the folder path.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ScanError, ScanResult};

/// Scan state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScanInfo {
    /// File path.
    pub file: PathBuf,
    /// Modification time observed at the last scan.
    pub last_write_time: DateTime<Utc>,
    /// Add-in the file produced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addin_id: Option<String>,
    /// Whether that add-in is a root.
    #[serde(default)]
    pub is_root: bool,
    /// Domain the add-in was registered in.
    #[serde(default)]
    pub domain: String,
    /// Whether the last scan failed.
    #[serde(default)]
    pub scan_error: bool,
    /// Paths the add-in asked to ignore.
    #[serde(default)]
    pub ignore_paths: Vec<PathBuf>,
}

impl FileScanInfo {
    /// Whether the file produced an add-in.
    pub fn is_addin(&self) -> bool {
        self.addin_id.is_some()
    }
}

/// Scan state of one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFolderInfo {
    /// Folder path.
    pub folder: PathBuf,
    /// Domain of non-root add-ins in this folder, empty while unassigned.
    #[serde(default)]
    pub domain: String,
    /// Whether the folder was scanned as shared (global domain).
    #[serde(default)]
    pub shared_folder: bool,
    /// Domain anchored by root add-ins found in this folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots_domain: Option<String>,
    /// Per-file state.
    #[serde(default)]
    pub files: BTreeMap<PathBuf, FileScanInfo>,
}

impl ScanFolderInfo {
    /// Create an empty record.
    pub fn new(folder: &Path) -> Self {
        Self {
            folder: folder.to_path_buf(),
            domain: String::new(),
            shared_folder: false,
            roots_domain: None,
            files: BTreeMap::new(),
        }
    }

    /// State of a file, if it was scanned before.
    pub fn file(&self, file: &Path) -> Option<&FileScanInfo> {
        self.files.get(file)
    }

    /// Domain an add-in with the given root flag gets in this folder.
    pub fn domain_for(&self, is_root: bool) -> &str {
        if is_root {
            self.roots_domain.as_deref().unwrap_or("")
        } else {
            &self.domain
        }
    }

    /// Record the outcome of a scan attempt.
    pub fn set_last_scan_time(
        &mut self,
        file: &Path,
        addin_id: Option<&str>,
        is_root: bool,
        time: DateTime<Utc>,
        scan_error: bool,
    ) -> &mut FileScanInfo {
        let domain =
            if addin_id.is_some() { self.domain_for(is_root).to_string() } else { String::new() };
        let info = self.files.entry(file.to_path_buf()).or_insert_with(|| FileScanInfo {
            file: file.to_path_buf(),
            last_write_time: time,
            addin_id: None,
            is_root: false,
            domain: String::new(),
            scan_error: false,
            ignore_paths: Vec::new(),
        });
        info.last_write_time = time;
        info.addin_id = addin_id.map(str::to_string);
        info.is_root = is_root;
        info.domain = domain;
        info.scan_error = scan_error;
        info.ignore_paths.clear();
        info
    }

    /// Remove and return add-in entries whose file is gone.
    ///
    /// Entries for files that still exist are kept. When the folder itself is
    /// gone every entry is removed.
    pub fn missing_addins(&mut self) -> Vec<FileScanInfo> {
        let folder_exists = self.folder.is_dir();
        let missing: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|file| !folder_exists || !file.exists())
            .cloned()
            .collect();

        missing
            .into_iter()
            .filter_map(|file| self.files.remove(&file))
            .filter(FileScanInfo::is_addin)
            .collect()
    }
}

/// Result of looking up a folder record.
#[derive(Debug)]
pub enum FolderLookup {
    /// A record was loaded.
    Existing(ScanFolderInfo),
    /// No record existed; a fresh one was created.
    New(ScanFolderInfo),
    /// The record could not be read; a fresh one was created.
    Corrupt(ScanFolderInfo),
}

impl FolderLookup {
    /// The folder record.
    pub fn into_info(self) -> ScanFolderInfo {
        match self {
            Self::Existing(info) | Self::New(info) | Self::Corrupt(info) => info,
        }
    }

    /// Whether the record was created by this lookup.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Existing(_))
    }
}

/// Exclusive write access to one folder record.
pub struct FolderGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

/// Persistent store of folder scan records.
pub struct ScanCacheStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ScanCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCacheStore").field("root", &self.root).finish()
    }
}

impl ScanCacheStore {
    /// Open a store rooted at `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> ScanResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("folders")).map_err(|e| {
            ScanError::Cache(format!("cannot create cache directory {}: {e}", root.display()))
        })?;
        Ok(Self { root, locks: Mutex::new(HashMap::new()) })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, folder: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(folder.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.root.join("folders").join(format!("{}.json", &digest[..16]))
    }

    /// Load the record for `folder`, or create an empty one.
    pub fn get_or_create(&self, folder: &Path) -> ScanResult<FolderLookup> {
        let path = self.record_path(folder);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FolderLookup::New(ScanFolderInfo::new(folder)));
            }
            Err(e) => {
                return Err(ScanError::Cache(format!("cannot read {}: {e}", path.display())));
            }
        };

        match serde_json::from_str::<ScanFolderInfo>(&content) {
            Ok(info) if info.folder == folder => Ok(FolderLookup::Existing(info)),
            Ok(_) => {
                tracing::warn!(
                    folder = %folder.display(),
                    "Scan cache record belongs to another folder"
                );
                Ok(FolderLookup::Corrupt(ScanFolderInfo::new(folder)))
            }
            Err(e) => {
                tracing::warn!(folder = %folder.display(), error = %e, "Corrupt scan cache record");
                Ok(FolderLookup::Corrupt(ScanFolderInfo::new(folder)))
            }
        }
    }

    /// Persist a folder record.
    pub fn save(&self, info: &ScanFolderInfo) -> ScanResult<()> {
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| ScanError::Cache(e.to_string()))?;
        std::fs::write(self.record_path(&info.folder), content)?;
        Ok(())
    }

    /// Remove a folder record.
    pub fn delete(&self, info: &ScanFolderInfo) -> ScanResult<()> {
        match std::fs::remove_file(self.record_path(&info.folder)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the writer lock of a folder record.
    pub fn lock(&self, folder: &Path) -> FolderGuard {
        let mutex = Arc::clone(self.locks.lock().entry(folder.to_path_buf()).or_default());
        FolderGuard { _guard: mutex.lock_arc() }
    }

    /// Try to take the writer lock without blocking.
    pub fn try_lock(&self, folder: &Path) -> Option<FolderGuard> {
        let mutex = Arc::clone(self.locks.lock().entry(folder.to_path_buf()).or_default());
        mutex.try_lock_arc().map(|guard| FolderGuard { _guard: guard })
    }
}

/// Modification time of a file.
pub fn modified_time(path: &Path) -> ScanResult<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Make a path absolute and remove `.` and `..` components without touching the disk.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_record() {
        let temp = TempDir::new().unwrap();
        let store = ScanCacheStore::open(temp.path().join("cache")).unwrap();

        let lookup = store.get_or_create(Path::new("/addins")).unwrap();
        assert!(matches!(lookup, FolderLookup::New(_)));
        assert_eq!(lookup.into_info().folder, PathBuf::from("/addins"));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = ScanCacheStore::open(temp.path()).unwrap();

        let mut info = ScanFolderInfo::new(Path::new("/addins"));
        info.domain = "d1".to_string();
        let file = Path::new("/addins/p.dll");
        info.set_last_scan_time(file, Some("acme.tools@1.0"), false, Utc::now(), false)
            .ignore_paths
            .push(PathBuf::from("/addins/helper.dll"));
        store.save(&info).unwrap();

        let lookup = store.get_or_create(Path::new("/addins")).unwrap();
        let FolderLookup::Existing(loaded) = lookup else {
            panic!("expected existing record");
        };
        assert_eq!(loaded, info);
        let file = loaded.file(Path::new("/addins/p.dll")).unwrap();
        assert_eq!(file.domain, "d1");
        assert!(file.is_addin());
    }

    #[test]
    fn test_corrupt_record() {
        let temp = TempDir::new().unwrap();
        let store = ScanCacheStore::open(temp.path()).unwrap();
        let info = ScanFolderInfo::new(Path::new("/addins"));
        store.save(&info).unwrap();

        let record = store.record_path(Path::new("/addins"));
        std::fs::write(&record, "{ not json").unwrap();

        let lookup = store.get_or_create(Path::new("/addins")).unwrap();
        assert!(matches!(lookup, FolderLookup::Corrupt(_)));
        assert!(lookup.is_new());
    }

    #[test]
    fn test_delete_record() {
        let temp = TempDir::new().unwrap();
        let store = ScanCacheStore::open(temp.path()).unwrap();
        let info = ScanFolderInfo::new(Path::new("/addins"));
        store.save(&info).unwrap();
        store.delete(&info).unwrap();
        store.delete(&info).unwrap();

        assert!(store.get_or_create(Path::new("/addins")).unwrap().is_new());
    }

    #[test]
    fn test_missing_addins() {
        let temp = TempDir::new().unwrap();
        let kept = temp.path().join("kept.dll");
        std::fs::write(&kept, "").unwrap();

        let mut info = ScanFolderInfo::new(temp.path());
        info.set_last_scan_time(&kept, Some("kept"), false, Utc::now(), false);
        let gone = temp.path().join("gone.dll");
        info.set_last_scan_time(&gone, Some("gone"), false, Utc::now(), false);
        info.set_last_scan_time(&temp.path().join("plain.dll"), None, false, Utc::now(), false);

        let missing = info.missing_addins();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].addin_id.as_deref(), Some("gone"));
        assert_eq!(info.files.len(), 1);
        assert!(info.file(&kept).is_some());
    }

    #[test]
    fn test_domain_for_root_flag() {
        let mut info = ScanFolderInfo::new(Path::new("/addins"));
        info.domain = "folder".to_string();
        assert_eq!(info.domain_for(false), "folder");
        assert_eq!(info.domain_for(true), "");
        info.roots_domain = Some("roots".to_string());
        assert_eq!(info.domain_for(true), "roots");

        let root = Path::new("/addins/root.dll");
        let entry = info.set_last_scan_time(root, Some("root"), true, Utc::now(), false);
        assert_eq!(entry.domain, "roots");
    }

    #[test]
    fn test_folder_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let store = ScanCacheStore::open(temp.path()).unwrap();

        let guard = store.lock(Path::new("/addins"));
        assert!(store.try_lock(Path::new("/addins")).is_none());
        assert!(store.try_lock(Path::new("/other")).is_some());
        drop(guard);
        assert!(store.try_lock(Path::new("/addins")).is_some());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert!(normalize_path(Path::new("rel")).is_absolute());
    }
}
