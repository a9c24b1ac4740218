//! Application-level types shared by the binary.

mod config;

pub use config::{CacheConfig, Config, RegistryConfig, ScannerConfig, WorkerConfig};
