//! Configuration management for addinscan.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addin::ScannerSettings;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scanner settings
    pub scanner: ScannerConfig,

    /// Registry settings
    pub registry: RegistryConfig,

    /// Scan cache settings
    pub cache: CacheConfig,

    /// Extraction worker settings
    pub worker: WorkerConfig,
}

/// Scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Add-in directories scanned when none are given on the command line
    pub directories: Vec<String>,

    /// Extensions of loadable modules (without the dot)
    pub module_extensions: Vec<String>,

    /// File name suffixes of declarative manifests
    pub manifest_suffixes: Vec<String>,

    /// Extension of directory-list files (without the dot)
    pub directory_list_extension: String,

    /// Directories searched for `GlobalModule` entries
    pub global_module_dirs: Vec<String>,

    /// Only report changes, never update the registry
    pub check_only: bool,
}

/// Registry settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry root (default: `<data_dir>/registry`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Register every add-in in the global domain
    pub global_only: bool,
}

/// Scan cache settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root (default: `<data_dir>/cache`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Extraction worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Extract in a separate process
    pub isolated: bool,

    /// Worker executable (default: this binary's `worker` subcommand)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Worker arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Seconds before a worker is declared crashed (0 waits forever)
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from `.addinscan.toml` or the user config directory.
    pub fn load() -> anyhow::Result<Self> {
        // Try local config first
        let local_config = PathBuf::from(".addinscan.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(global_config) = Self::config_path() {
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save to the user config directory.
    pub fn save(&self) -> anyhow::Result<()> {
        let config_dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join("config.toml"), content)?;

        Ok(())
    }

    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("addinscan"))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("addinscan"))
    }

    /// Configured add-in directories, with `~` and environment variables expanded.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.scanner.directories.iter().map(|d| expand(d)).collect()
    }

    /// Registry root.
    pub fn registry_path(&self) -> anyhow::Result<PathBuf> {
        Self::resolve_dir(self.registry.path.as_deref(), "registry")
    }

    /// Scan cache root.
    pub fn cache_path(&self) -> anyhow::Result<PathBuf> {
        Self::resolve_dir(self.cache.path.as_deref(), "cache")
    }

    fn resolve_dir(configured: Option<&str>, default_name: &str) -> anyhow::Result<PathBuf> {
        match configured {
            Some(path) => Ok(expand(path)),
            None => Self::data_dir()
                .map(|d| d.join(default_name))
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory")),
        }
    }

    /// Classification settings for the scanner.
    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            module_extensions: self.scanner.module_extensions.clone(),
            manifest_suffixes: self.scanner.manifest_suffixes.clone(),
            directory_list_extension: self.scanner.directory_list_extension.clone(),
            global_module_dirs: self.scanner.global_module_dirs.iter().map(|d| expand(d)).collect(),
        }
    }
}

impl WorkerConfig {
    /// Worker timeout, `None` if unlimited.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map_or_else(|_| path.to_string(), |p| p.into_owned()))
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let settings = ScannerSettings::default();
        Self {
            directories: Vec::new(),
            module_extensions: settings.module_extensions,
            manifest_suffixes: settings.manifest_suffixes,
            directory_list_extension: settings.directory_list_extension,
            global_module_dirs: Vec::new(),
            check_only: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { isolated: false, command: None, args: Vec::new(), timeout_secs: 60 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.scanner.check_only);
        assert!(config.scanner.module_extensions.contains(&"dll".to_string()));
        assert_eq!(config.scanner.directory_list_extension, "addins");
        assert!(!config.worker.isolated);
        assert_eq!(config.worker.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[scanner]"));
        assert!(toml_str.contains("[worker]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [scanner]
            directories = ["/opt/app/addins"]
            module_extensions = ["so"]

            [registry]
            path = "/var/lib/app/registry"
            global_only = true

            [worker]
            isolated = true
            timeout_secs = 0
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.directories(), vec![PathBuf::from("/opt/app/addins")]);
        assert_eq!(config.scanner.module_extensions, vec!["so"]);
        assert_eq!(config.scanner.manifest_suffixes, vec![".addin", ".addin.toml"]);
        assert!(config.registry.global_only);
        assert_eq!(config.registry_path().unwrap(), PathBuf::from("/var/lib/app/registry"));
        assert!(config.worker.isolated);
        assert_eq!(config.worker.timeout(), None);
    }

    #[test]
    fn test_scanner_settings() {
        let mut config = Config::default();
        config.scanner.global_module_dirs = vec!["/usr/lib/addins".to_string()];
        let settings = config.scanner_settings();
        assert_eq!(settings.global_module_dirs, vec![PathBuf::from("/usr/lib/addins")]);
        assert_eq!(settings.directory_list_extension, "addins");
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\npath = \"/tmp/addinscan-cache\"\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.cache_path().unwrap(), PathBuf::from("/tmp/addinscan-cache"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[worker]\ntimeout_secs = \"soon\"\n").unwrap();

        assert!(Config::load_from_file(&path).is_err());
    }
}
