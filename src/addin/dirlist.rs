//! Directory-list (`.addins`) files.
//!
//! A directory list names further folders to scan:
//!
//! ```xml
//! <Addins>
//!   <Directory include-subdirs="true">plugins</Directory>
//!   <Directory shared="true">/opt/shared/addins</Directory>
//!   <GlobalModule>Acme.Common</GlobalModule>
//!   <Exclude>plugins/helper.dll</Exclude>
//! </Addins>
//! ```
//!
//! Relative paths resolve against the folder containing the list. Unknown
//! elements are skipped.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{ScanError, ScanResult};

/// Domain annotation of a listed directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainHint {
    /// Scan in the domain of the folder holding the list.
    #[default]
    Inherit,
    /// `shared="true"`: scan in the global domain.
    Shared,
    /// `shared="false"`: scan in a domain of its own.
    Private,
}

/// One `Directory` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Absolute directory path.
    pub path: PathBuf,
    /// Whether subdirectories are scanned too.
    pub include_subdirs: bool,
    /// Domain annotation.
    pub domain: DomainHint,
}

/// Parsed directory list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryList {
    /// Directories to scan, in file order.
    pub directories: Vec<DirectoryEntry>,
    /// Globally resolvable module names (`GlobalModule` / `GacAssembly`).
    pub global_modules: Vec<String>,
    /// Absolute paths to exclude.
    pub excludes: Vec<PathBuf>,
}

impl DirectoryList {
    /// Parse a directory list from a file.
    pub fn from_file(path: &Path) -> ScanResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Parse a directory list. `path` is the location of the list itself.
    pub fn parse(content: &str, path: &Path) -> ScanResult<Self> {
        let fail = |e: &dyn Display| ScanError::DirectoryList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let base = path.parent().unwrap_or_else(|| Path::new(""));

        let mut list = Self::default();
        let mut reader = Reader::from_str(content);
        let mut in_root = false;

        loop {
            match reader.read_event().map_err(|e| fail(&e))? {
                Event::Start(_) if !in_root => in_root = true,
                Event::Empty(_) if !in_root => break,
                Event::Start(e) => {
                    let kind = match e.local_name().as_ref() {
                        b"Directory" => EntryKind::Directory,
                        b"GacAssembly" | b"GlobalModule" => EntryKind::GlobalModule,
                        b"Exclude" => EntryKind::Exclude,
                        _ => {
                            reader.read_to_end(e.name()).map_err(|e| fail(&e))?;
                            continue;
                        }
                    };
                    let (include_subdirs, domain) =
                        directory_attributes(&e).map_err(|e| fail(&e))?;
                    let raw = reader.read_text(e.name()).map_err(|e| fail(&e))?;
                    let text = quick_xml::escape::unescape(&raw).map_err(|e| fail(&e))?;
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match kind {
                        EntryKind::Directory => list.directories.push(DirectoryEntry {
                            path: resolve(base, text),
                            include_subdirs,
                            domain,
                        }),
                        EntryKind::GlobalModule => list.global_modules.push(text.to_string()),
                        EntryKind::Exclude => list.excludes.push(resolve(base, text)),
                    }
                }
                Event::End(_) | Event::Eof => break,
                _ => {}
            }
        }

        Ok(list)
    }
}

enum EntryKind {
    Directory,
    GlobalModule,
    Exclude,
}

fn directory_attributes(e: &BytesStart<'_>) -> Result<(bool, DomainHint), String> {
    let mut include_subdirs = false;
    let mut domain = DomainHint::Inherit;
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        match attr.key.local_name().as_ref() {
            b"include-subdirs" => include_subdirs = value.as_ref() == "true",
            b"shared" => {
                domain = match value.as_ref() {
                    "true" => DomainHint::Shared,
                    "false" => DomainHint::Private,
                    _ => DomainHint::Inherit,
                };
            }
            _ => {}
        }
    }
    Ok((include_subdirs, domain))
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
