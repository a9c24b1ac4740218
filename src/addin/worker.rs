//! Extraction backends and the isolated worker protocol.
//!
//! The worker reads one JSON [`ExtractionRequest`] per stdin line and answers
//! on stdout with:
//!
//! ```text
//! plog:scan:/addins/p.dll
//! plog:result:{"descriptor":...,"success":true,...}
//! plog:endscan
//! ```
//!
//! The supervisor treats a worker that stops between the scan and endscan
//! markers as a crash of the file named by the scan marker.

use std::io::{BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::extract::{extract_file, ExtractionOutput, FileKind};
use super::monitor::ScanMonitor;
use super::provider::MetadataProvider;
use super::{ScanError, ScanResult};

/// Marker written before a file is extracted.
pub const SCAN_MARKER: &str = "plog:scan:";
/// Marker written after a file was extracted.
pub const END_SCAN_MARKER: &str = "plog:endscan";
/// Prefix of the result line.
pub const RESULT_MARKER: &str = "plog:result:";

/// One file to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub file: PathBuf,
    pub kind: FileKind,
}

/// Runs single-file extraction on behalf of the scanner.
///
/// Implementations must call [`ScanMonitor::begin_file`] before touching the
/// file and [`ScanMonitor::end_file`] once extraction completed. A crash is
/// returned as [`ScanError::Crashed`].
pub trait Extractor {
    fn extract(
        &self,
        request: &ExtractionRequest,
        monitor: &dyn ScanMonitor,
    ) -> ScanResult<ExtractionOutput>;
}

impl<E: Extractor + ?Sized> Extractor for Box<E> {
    fn extract(
        &self,
        request: &ExtractionRequest,
        monitor: &dyn ScanMonitor,
    ) -> ScanResult<ExtractionOutput> {
        (**self).extract(request, monitor)
    }
}

/// Extracts in the calling process, containing provider panics.
pub struct InProcessExtractor<P> {
    provider: P,
}

impl<P: MetadataProvider> InProcessExtractor<P> {
    /// Wrap a provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P: MetadataProvider> Extractor for InProcessExtractor<P> {
    fn extract(
        &self,
        request: &ExtractionRequest,
        monitor: &dyn ScanMonitor,
    ) -> ScanResult<ExtractionOutput> {
        monitor.begin_file(&request.file);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            extract_file(&self.provider, &request.file, request.kind)
        }));

        match result {
            Ok(output) => {
                monitor.end_file();
                Ok(output)
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "provider panicked".to_string());
                Err(ScanError::Crashed { path: request.file.clone(), reason })
            }
        }
    }
}

/// Extracts in a child process, one process per file.
#[derive(Debug, Clone)]
pub struct ProcessExtractor {
    command: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessExtractor {
    /// Run `command args...` as the worker.
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { command: command.into(), args, timeout: None }
    }

    /// Run the current executable's `worker` subcommand.
    pub fn current_exe() -> ScanResult<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| ScanError::Worker(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(exe, vec!["worker".to_string()]))
    }

    /// Kill workers that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self) -> ScanResult<Child> {
        Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ScanError::Worker(format!("cannot start {}: {e}", self.command.display()))
            })
    }
}

impl Extractor for ProcessExtractor {
    fn extract(
        &self,
        request: &ExtractionRequest,
        monitor: &dyn ScanMonitor,
    ) -> ScanResult<ExtractionOutput> {
        let mut child = self.spawn()?;
        let payload =
            serde_json::to_string(request).map_err(|e| ScanError::Worker(e.to_string()))?;

        // Closing stdin tells the worker there is nothing else to do.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = writeln!(stdin, "{payload}") {
                tracing::debug!(error = %e, "Worker closed its input early");
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::Worker("worker stdout not captured".to_string()))?;
        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut in_flight: Option<PathBuf> = None;
        let mut output = None;

        loop {
            let line = match deadline {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(line) => line,
                        Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let _ = child.kill();
                            let _ = child.wait();
                            let path = in_flight.unwrap_or_else(|| request.file.clone());
                            tracing::warn!(file = %path.display(), "Worker timed out");
                            return Err(ScanError::Crashed {
                                path,
                                reason: "worker timed out".to_string(),
                            });
                        }
                    }
                }
                None => match rx.recv() {
                    Ok(line) => line,
                    Err(_) => break,
                },
            };

            if let Some(file) = line.strip_prefix(SCAN_MARKER) {
                let file = PathBuf::from(file.trim_end());
                monitor.begin_file(&file);
                in_flight = Some(file);
            } else if line.trim_end() == END_SCAN_MARKER {
                monitor.end_file();
                in_flight = None;
            } else if let Some(json) = line.strip_prefix(RESULT_MARKER) {
                let parsed = serde_json::from_str::<ExtractionOutput>(json).map_err(|e| {
                    ScanError::Worker(format!("invalid worker result: {e}"))
                })?;
                output = Some(parsed);
            } else {
                tracing::debug!(line = %line, "Worker output");
            }
        }

        let status = child.wait()?;
        let _ = reader.join();

        match (in_flight, output) {
            (Some(path), _) => Err(ScanError::Crashed {
                path,
                reason: format!("worker exited while scanning ({status})"),
            }),
            (None, Some(output)) => Ok(output),
            (None, None) => Err(ScanError::Crashed {
                path: request.file.clone(),
                reason: format!("worker exited without a result ({status})"),
            }),
        }
    }
}

/// Serve extraction requests read from `input`, one per line.
pub fn run_worker<P, R, W>(provider: &P, input: R, mut output: W) -> ScanResult<()>
where
    P: MetadataProvider + ?Sized,
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: ExtractionRequest = serde_json::from_str(&line)
            .map_err(|e| ScanError::Worker(format!("invalid request: {e}")))?;

        writeln!(output, "{SCAN_MARKER}{}", request.file.display())?;
        output.flush()?;

        let result = extract_file(provider, &request.file, request.kind);
        let json = serde_json::to_string(&result).map_err(|e| ScanError::Worker(e.to_string()))?;
        writeln!(output, "{RESULT_MARKER}{json}")?;
        writeln!(output, "{END_SCAN_MARKER}")?;
        output.flush()?;
    }
    Ok(())
}

/// Build an extraction request for a file.
pub fn request_for(file: &Path, kind: FileKind) -> ExtractionRequest {
    ExtractionRequest { file: file.to_path_buf(), kind }
}
