//! Addinscan - add-in discovery and extension registry engine.
//!
//! Scans add-in folders incrementally and keeps a registry of the add-ins
//! found in them.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use addinscan::addin::{
    run_worker, AddinRegistry, AddinScanner, BundleProvider, Extractor, FileRegistry,
    InProcessExtractor, ProcessExtractor, ScanCacheStore, ScanError, ScanOptions, ScanRoot,
    ScanSession, SessionDomain, GLOBAL_DOMAIN,
};
use addinscan::Config;

/// Add-in discovery and extension registry engine
#[derive(Parser)]
#[command(name = "addinscan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    stores: StoreArgs,
}

/// Locations of the registry and the scan cache.
#[derive(clap::Args)]
struct StoreArgs {
    /// Registry directory (overrides the configuration)
    #[arg(long, global = true, env = "ADDINSCAN_REGISTRY")]
    registry: Option<PathBuf>,

    /// Scan cache directory (overrides the configuration)
    #[arg(long, global = true, env = "ADDINSCAN_CACHE")]
    cache: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan add-in folders and update the registry
    Scan {
        /// Folders to scan (defaults to the configured directories)
        dirs: Vec<PathBuf>,

        /// Only report whether anything changed
        #[arg(long)]
        check_only: bool,

        /// Scan in this domain and skip folders of other domains
        #[arg(short, long, conflicts_with = "shared")]
        domain: Option<String>,

        /// Scan in the global domain
        #[arg(long)]
        shared: bool,

        /// Scan subfolders too
        #[arg(short, long)]
        recursive: bool,

        /// Extract every file, ignoring cached timestamps
        #[arg(long)]
        regenerate: bool,

        /// Extract modules in a separate worker process
        #[arg(long)]
        isolated: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List registered add-ins
    List {
        /// Only list add-ins of this domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Extract and print the descriptor of a single file
    Inspect {
        /// Manifest or module to inspect
        file: PathBuf,

        /// Extract in a separate worker process
        #[arg(long)]
        isolated: bool,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Serve extraction requests on stdin (used by isolated scans)
    #[command(hide = true)]
    Worker,
}

type CliScanner = AddinScanner<FileRegistry, Box<dyn Extractor>>;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout belongs to command output and the worker protocol
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Scan {
            dirs,
            check_only,
            domain,
            shared,
            recursive,
            regenerate,
            isolated,
            format,
        } => {
            let request = ScanRequest { dirs, check_only, domain, shared, recursive, regenerate };
            cmd_scan(&cli.stores, &request, isolated, &format)?;
        }
        Commands::List { domain, format } => {
            cmd_list(&cli.stores, domain.as_deref(), &format)?;
        }
        Commands::Inspect { file, isolated } => {
            cmd_inspect(&cli.stores, &file, isolated)?;
        }
        Commands::Config { path } => {
            cmd_config(path)?;
        }
        Commands::Worker => {
            cmd_worker()?;
        }
    }

    Ok(())
}

struct ScanRequest {
    dirs: Vec<PathBuf>,
    check_only: bool,
    domain: Option<String>,
    shared: bool,
    recursive: bool,
    regenerate: bool,
}

fn open_registry(config: &Config, stores: &StoreArgs) -> Result<FileRegistry> {
    let path = match &stores.registry {
        Some(path) => path.clone(),
        None => config.registry_path()?,
    };
    Ok(FileRegistry::open(path)?.with_global_only(config.registry.global_only))
}

fn build_scanner(config: &Config, stores: &StoreArgs, isolated: bool) -> Result<CliScanner> {
    let cache_path = match &stores.cache {
        Some(path) => path.clone(),
        None => config.cache_path()?,
    };
    let cache = Arc::new(ScanCacheStore::open(cache_path)?);

    let extractor: Box<dyn Extractor> = if isolated || config.worker.isolated {
        let worker = match &config.worker.command {
            Some(command) => ProcessExtractor::new(command, config.worker.args.clone()),
            None => ProcessExtractor::current_exe()?,
        };
        Box::new(worker.with_timeout(config.worker.timeout()))
    } else {
        Box::new(InProcessExtractor::new(BundleProvider::new()))
    };

    Ok(AddinScanner::new(open_registry(config, stores)?, cache, extractor)
        .with_settings(config.scanner_settings()))
}

/// Scan add-in folders.
fn cmd_scan(stores: &StoreArgs, request: &ScanRequest, isolated: bool, format: &str) -> Result<()> {
    let config = Config::load()?;

    let dirs = if request.dirs.is_empty() { config.directories() } else { request.dirs.clone() };
    if dirs.is_empty() {
        anyhow::bail!("No add-in folders given and none configured in [scanner] directories");
    }

    let roots: Vec<ScanRoot> = dirs
        .iter()
        .map(|dir| {
            let root = ScanRoot::new(dir).recursive(request.recursive);
            match (&request.domain, request.shared) {
                (Some(domain), _) => root.with_domain(domain.clone()),
                (None, true) => root.shared(),
                (None, false) => root,
            }
        })
        .collect();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })?;

    let options = ScanOptions {
        check_only: request.check_only || config.scanner.check_only,
        regenerate_all: request.regenerate,
        locate_modules_only: false,
        domain: request.domain.clone().map_or(SessionDomain::Any, SessionDomain::Pinned),
        cancel: Some(cancel),
    };

    let mut scanner = build_scanner(&config, stores, isolated)?;
    let session = match scanner.scan(&roots, &options) {
        Ok(session) => session,
        Err(ScanError::Cancelled) => {
            eprintln!("Scan cancelled");
            std::process::exit(130);
        }
        Err(e) => return Err(e.into()),
    };

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&session)?;
            println!("{json}");
        }
        _ => print_session(&session),
    }

    Ok(())
}

fn print_session(session: &ScanSession) {
    println!("Scanned {} folder(s)", session.visited_folders.len());
    for id in &session.saved_addin_ids {
        println!("  + {id}");
    }
    for id in &session.uninstalled_addin_ids {
        println!("  - {id}");
    }
    for file in &session.failed_files {
        println!("  ! {}", file.display());
    }
    if session.check_only {
        let verdict = if session.changes_found { "changes found" } else { "up to date" };
        println!("\nRegistry is {verdict}");
    } else {
        println!(
            "\nSaved: {}, uninstalled: {}, failed: {}",
            session.saved_addin_ids.len(),
            session.uninstalled_addin_ids.len(),
            session.failed_files.len()
        );
    }
}

/// List registered add-ins.
fn cmd_list(stores: &StoreArgs, domain: Option<&str>, format: &str) -> Result<()> {
    let config = Config::load()?;
    let registry = open_registry(&config, stores)?;
    let addins = registry.list_descriptors(domain)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&addins)?;
            println!("{json}");
        }
        _ => {
            for desc in &addins {
                let marker = if desc.domain == GLOBAL_DOMAIN { "*" } else { " " };
                let source = desc.source_file.display();
                println!("{marker} {} [{}] {source}", desc.addin_id(), desc.domain);
            }
            println!("\nTotal: {} add-ins", addins.len());
        }
    }

    Ok(())
}

/// Print the descriptor of a single file.
fn cmd_inspect(stores: &StoreArgs, file: &Path, isolated: bool) -> Result<()> {
    let config = Config::load()?;
    let mut scanner = build_scanner(&config, stores, isolated)?;

    match scanner.scan_single_file(file)? {
        Some(desc) => {
            let json = serde_json::to_string_pretty(&desc)?;
            println!("{json}");
            Ok(())
        }
        None => anyhow::bail!("{} does not describe an add-in", file.display()),
    }
}

/// Show configuration.
fn cmd_config(show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_path() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load()?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Serve extraction requests for an isolated scan.
fn cmd_worker() -> Result<()> {
    let provider = BundleProvider::new();
    run_worker(&provider, io::stdin().lock(), io::stdout().lock())?;
    Ok(())
}
