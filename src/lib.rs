//! # Addinscan
//!
//! Add-in discovery and extension registry engine.
//!
//! Addinscan walks add-in folders, detects which files changed since the last
//! pass, extracts add-in descriptors from manifests and modules, and keeps a
//! registry of installed add-ins in sync. Extraction of untrusted modules can
//! run in an isolated worker process so a crashing module only fails itself.
//!
//! ## Quick Start
//!
//! ```bash
//! # Scan a folder and update the registry
//! addinscan scan ./addins
//!
//! # Only report whether anything changed
//! addinscan scan ./addins --check-only
//!
//! # Show what the registry holds
//! addinscan list
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::if_not_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unnecessary_debug_formatting)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]

pub mod addin;
pub mod core;

// Re-export commonly used types
pub use addin::{
    AddinDescriptor, AddinRegistry, AddinScanner, FileRegistry, ScanCacheStore, ScanError,
    ScanOptions, ScanRoot, ScanSession,
};
pub use core::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "addinscan";
