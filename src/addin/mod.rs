//! Add-in discovery engine.
//!
//! The [`AddinScanner`] walks add-in folders, classifies the files it finds,
//! extracts descriptors from the ones that changed and keeps an
//! [`AddinRegistry`] in sync. Extraction goes through a [`MetadataProvider`]
//! and can run in an isolated worker process so that a module that crashes
//! the loader only fails its own file.
//!
//! ```text
//! folders ──▶ AddinScanner ──▶ Extractor ──▶ MetadataProvider
//!                 │                │
//!                 ▼                ▼
//!          ScanCacheStore   ExtensionGraphResolver
//!                 │
//!                 ▼
//!           AddinRegistry
//! ```

pub mod bundle;
pub mod cache;
pub mod dirlist;
pub mod domain;
mod error;
pub mod extract;
pub mod graph;
pub mod manifest;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod types;
pub mod worker;

pub use bundle::BundleProvider;
pub use cache::{FileScanInfo, FolderLookup, ScanCacheStore, ScanFolderInfo};
pub use dirlist::DirectoryList;
pub use domain::{GLOBAL_DOMAIN, UNKNOWN_DOMAIN};
pub use error::{ProviderError, ScanError, ScanResult};
pub use extract::{extract_file, ExtractionOutput, FileKind};
pub use graph::ExtensionGraphResolver;
pub use manifest::AddinManifest;
pub use monitor::{LogLevel, MonitorEvent, RecordingMonitor, ScanMonitor, TracingMonitor};
pub use provider::{Attribute, AttributeKind, AttributeTarget, MetadataProvider};
pub use registry::{AddinRegistry, FileRegistry, MemoryRegistry};
pub use scanner::{AddinScanner, ScanOptions, ScanRoot, ScannerSettings};
pub use session::{ScanSession, SessionDomain};
pub use types::{
    format_addin_id, id_name, id_version, AddinDependency, AddinDescriptor, Extension,
    ExtensionNode, ExtensionPoint, ModuleDescription, NodeSet, NodeType, NodeTypeAttribute,
};
pub use worker::{
    run_worker, ExtractionRequest, Extractor, InProcessExtractor, ProcessExtractor,
};
