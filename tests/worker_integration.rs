//! Worker Process Integration Tests
//!
//! Runs extraction in child processes and checks crash attribution.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use addinscan::addin::{
    AddinScanner, ExtractionRequest, Extractor, FileKind, MemoryRegistry, MonitorEvent,
    ProcessExtractor, RecordingMonitor, ScanCacheStore, ScanError, ScanOptions, ScanRoot,
};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_addinscan");

/// A worker implemented as a shell script; `$1` is the addinscan binary.
fn scripted(script: &str, extra: &[&str]) -> ProcessExtractor {
    let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string(), BIN.to_string()];
    args.extend(extra.iter().map(|arg| (*arg).to_string()));
    ProcessExtractor::new("sh", args)
}

fn real_worker() -> ProcessExtractor {
    ProcessExtractor::new(BIN, vec!["worker".to_string()])
}

fn request(file: &Path) -> ExtractionRequest {
    ExtractionRequest { file: file.to_path_buf(), kind: FileKind::Module }
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn module(id: &str) -> String {
    format!(
        r#"{{ "attributes": [{{ "kind": "addin", "id": "{id}", "namespace": "acme",
                               "version": "1.0" }}] }}"#
    )
}

// ============================================================================
// Protocol Tests
// ============================================================================

#[test]
fn test_result_is_returned() {
    let worker = scripted(
        r#"read line
           echo "plog:scan:/x/a.dll"
           echo 'plog:result:{"success":true}'
           echo plog:endscan"#,
        &[],
    );
    let monitor = RecordingMonitor::new();

    let output = worker.extract(&request(Path::new("/x/a.dll")), &monitor).unwrap();
    assert!(output.success);
    assert_eq!(
        monitor.events(),
        vec![MonitorEvent::BeginFile(PathBuf::from("/x/a.dll")), MonitorEvent::EndFile]
    );
}

#[test]
fn test_exit_between_markers_is_a_crash() {
    let worker = scripted(r#"read line; echo "plog:scan:/x/b.dll"; exit 3"#, &[]);
    let monitor = RecordingMonitor::new();

    let result = worker.extract(&request(Path::new("/x/b.dll")), &monitor);
    match result {
        Err(ScanError::Crashed { path, .. }) => assert_eq!(path, PathBuf::from("/x/b.dll")),
        other => panic!("expected a crash, got {other:?}"),
    }
    assert_eq!(monitor.scanned_files(), vec![PathBuf::from("/x/b.dll")]);
}

#[test]
fn test_exit_without_result_is_a_crash() {
    let worker = scripted("read line; exit 0", &[]);
    let result = worker.extract(&request(Path::new("/x/c.dll")), &RecordingMonitor::new());
    assert!(matches!(result, Err(ScanError::Crashed { .. })));
}

#[test]
fn test_hung_worker_times_out() {
    let worker = scripted(r#"read line; echo "plog:scan:/x/slow.dll"; exec sleep 30"#, &[])
        .with_timeout(Some(Duration::from_millis(300)));

    let result = worker.extract(&request(Path::new("/x/slow.dll")), &RecordingMonitor::new());
    match result {
        Err(ScanError::Crashed { path, reason }) => {
            assert_eq!(path, PathBuf::from("/x/slow.dll"));
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn test_missing_worker_binary() {
    let worker = ProcessExtractor::new("/nonexistent/addinscan-worker", Vec::new());
    let result = worker.extract(&request(Path::new("/x/a.dll")), &RecordingMonitor::new());
    assert!(matches!(result, Err(ScanError::Worker(_))));
}

// ============================================================================
// Real Worker Tests
// ============================================================================

#[test]
fn test_real_worker_extracts_module() {
    let temp = TempDir::new().unwrap();
    let file = write(temp.path(), "p.dll", &module("tools"));

    let output = real_worker().extract(&request(&file), &RecordingMonitor::new()).unwrap();
    assert!(output.success);
    assert_eq!(output.descriptor.unwrap().addin_id(), "acme.tools@1.0");
}

#[test]
fn test_isolated_scan_survives_crash() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("addins");
    fs::create_dir_all(&dir).unwrap();
    write(&dir, "a.dll", &module("a"));
    let b = write(&dir, "b.dll", &module("b"));
    write(&dir, "c.dll", &module("c"));

    // Dies on b.dll, delegates everything else to the real worker
    let b_path = b.display().to_string();
    let worker = scripted(
        r#"read line
           case "$line" in
             *b.dll*) echo "plog:scan:$2"; kill -9 $$ ;;
             *) echo "$line" | "$1" worker ;;
           esac"#,
        &[&b_path],
    );

    let monitor = Arc::new(RecordingMonitor::new());
    let mut scanner = AddinScanner::new(
        MemoryRegistry::new(),
        Arc::new(ScanCacheStore::open(temp.path().join("cache")).unwrap()),
        worker,
    )
    .with_monitor(monitor.clone());

    let session = scanner.scan(&[ScanRoot::new(&dir)], &ScanOptions::default()).unwrap();
    assert_eq!(session.saved_addin_ids, vec!["acme.a@1.0", "acme.c@1.0"]);
    assert_eq!(session.failed_files, vec![b.clone()]);

    let crash_reported = monitor.events().iter().any(|event| {
        matches!(event, MonitorEvent::Error { file: Some(file), message, .. }
            if file == &b && message.contains("crashed"))
    });
    assert!(crash_reported);
}
