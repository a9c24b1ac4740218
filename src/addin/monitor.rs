//! Diagnostic sink for scan progress and errors.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Log level for scan messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

/// Receives diagnostics produced during a scan.
///
/// `begin_file` and `end_file` bracket every extraction attempt; a crash
/// between them is attributed to the file passed to `begin_file`.
pub trait ScanMonitor: Send + Sync {
    /// Log a message.
    fn log(&self, level: LogLevel, message: &str);

    /// Report an error, with the file and add-in it concerns when known.
    fn report_error(&self, file: Option<&Path>, addin_id: Option<&str>, message: &str);

    /// Report a warning.
    fn report_warning(&self, file: Option<&Path>, message: &str);

    /// Extraction of `file` is about to start.
    fn begin_file(&self, file: &Path);

    /// The current extraction finished.
    fn end_file(&self);
}

/// Monitor that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl ScanMonitor for TracingMonitor {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }

    fn report_error(&self, file: Option<&Path>, addin_id: Option<&str>, message: &str) {
        let file = file.map(|f| f.display().to_string());
        tracing::error!(file = file.as_deref(), addin = addin_id, "{}", message);
    }

    fn report_warning(&self, file: Option<&Path>, message: &str) {
        let file = file.map(|f| f.display().to_string());
        tracing::warn!(file = file.as_deref(), "{}", message);
    }

    fn begin_file(&self, file: &Path) {
        tracing::debug!(file = %file.display(), "Scanning file");
    }

    fn end_file(&self) {
        tracing::trace!("Finished scanning file");
    }
}

/// Something a [`RecordingMonitor`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Log(LogLevel, String),
    Error { file: Option<PathBuf>, addin_id: Option<String>, message: String },
    Warning { file: Option<PathBuf>, message: String },
    BeginFile(PathBuf),
    EndFile,
}

/// Monitor that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<MonitorEvent>>,
}

impl RecordingMonitor {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    /// Files passed to `begin_file`, in order.
    pub fn scanned_files(&self) -> Vec<PathBuf> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::BeginFile(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of reported errors.
    pub fn error_count(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, MonitorEvent::Error { .. })).count()
    }
}

impl ScanMonitor for RecordingMonitor {
    fn log(&self, level: LogLevel, message: &str) {
        self.events.lock().push(MonitorEvent::Log(level, message.to_string()));
    }

    fn report_error(&self, file: Option<&Path>, addin_id: Option<&str>, message: &str) {
        self.events.lock().push(MonitorEvent::Error {
            file: file.map(Path::to_path_buf),
            addin_id: addin_id.map(str::to_string),
            message: message.to_string(),
        });
    }

    fn report_warning(&self, file: Option<&Path>, message: &str) {
        self.events.lock().push(MonitorEvent::Warning {
            file: file.map(Path::to_path_buf),
            message: message.to_string(),
        });
    }

    fn begin_file(&self, file: &Path) {
        self.events.lock().push(MonitorEvent::BeginFile(file.to_path_buf()));
    }

    fn end_file(&self) {
        self.events.lock().push(MonitorEvent::EndFile);
    }
}
