//! Local runner tests with real child processes
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use batchpipe::config::PipelineConfig;
use batchpipe::error::{BatchError, TaskFailure};
use batchpipe::notify::{NodeState, Notifier, ROOT_NODE, WORKERS_NODE};
use batchpipe::orchestrator::{Orchestrator, RunState};
use batchpipe::registry::TempFileRegistry;
use batchpipe::runner::{LocalRunner, RunContext, Runner};
use batchpipe::task::{ParallelSpec, TaskArgs};
use batchpipe::test_fixtures::RecordingNotifier;
use batchpipe::watch::WaitOptions;
use tempfile::TempDir;

// =============================================================================
// HELPERS
// =============================================================================

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Exits 3 for items starting with `bad`, 0 otherwise
const WORKER: &str = r#"for arg in "$@"; do
  case "$arg" in
    --item=bad*) exit 3 ;;
  esac
done
exit 0
"#;

/// Writes three work items to `--bunch_list`
const PREP: &str = r#"for arg in "$@"; do
  case "$arg" in
    --bunch_list=*) list="${arg#--bunch_list=}" ;;
  esac
done
printf '["s1.fits", "s2.fits", "s3.fits"]' > "$list"
"#;

/// Records its output directory argument
const RECORDER: &str = r#"for arg in "$@"; do
  case "$arg" in
    --output_dir=*) echo "${arg#--output_dir=}" >> seen.txt ;;
  esac
done
"#;

fn context(dir: &Path, notifier: Arc<dyn Notifier>, wait: WaitOptions) -> RunContext {
    RunContext::new(dir, notifier, Arc::new(TempFileRegistry::new())).with_wait(wait)
}

fn fast() -> WaitOptions {
    WaitOptions::new(Duration::from_secs(30), Duration::from_millis(20))
}

fn list(dir: &Path, items: &str) -> PathBuf {
    let path = dir.join("items.json");
    std::fs::write(&path, items).unwrap();
    path
}

// =============================================================================
// PARALLEL
// =============================================================================

#[tokio::test]
async fn failing_children_are_all_reported() {
    let dir = TempDir::new().unwrap();
    let worker = write_script(dir.path(), "worker.sh", WORKER);
    let notifier = Arc::new(RecordingNotifier::new());
    let ctx = context(dir.path(), notifier.clone(), fast());

    let spec = ParallelSpec::new(
        "workers",
        worker.display().to_string(),
        list(dir.path(), r#"["ok1", "bad2", "ok3", "bad4"]"#),
        "item",
        TaskArgs::new(),
    );
    let err = LocalRunner::new(2).parallel(&spec, &ctx).await.unwrap_err();

    assert_eq!(
        err.failures(),
        &[
            TaskFailure {
                index: Some(2),
                exit_code: Some(3)
            },
            TaskFailure {
                index: Some(4),
                exit_code: Some(3)
            },
        ]
    );
    // Every task ran and wrote its marker
    let markers = ctx.registry.paths();
    assert_eq!(markers.len(), 4);
    assert!(markers.iter().all(|m| m.exists()));

    assert_eq!(notifier.state_of("workers-1"), Some(NodeState::Success));
    assert_eq!(notifier.state_of("workers-2"), Some(NodeState::Error));
    assert_eq!(notifier.state_of("workers-3"), Some(NodeState::Success));
    assert_eq!(notifier.state_of("workers-4"), Some(NodeState::Error));
}

#[tokio::test]
async fn sequence_argument_is_distinct_per_task() {
    let dir = TempDir::new().unwrap();
    let recorder = write_script(dir.path(), "recorder.sh", RECORDER);
    let ctx = context(dir.path(), Arc::new(RecordingNotifier::new()), fast());

    let spec = ParallelSpec::new(
        "workers",
        recorder.display().to_string(),
        list(dir.path(), r#"["a", "b", "c", "d", "e"]"#),
        "item",
        TaskArgs::new().with("output_dir", "output-").unwrap(),
    )
    .with_sequence_arg("output_dir");
    LocalRunner::new(3).parallel(&spec, &ctx).await.unwrap();

    let mut seen: Vec<String> = std::fs::read_to_string(dir.path().join("seen.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["output-1", "output-2", "output-3", "output-4", "output-5"]);
}

#[tokio::test]
async fn pool_timeout_kills_children_and_lists_missing_markers() {
    let dir = TempDir::new().unwrap();
    let sleeper = write_script(dir.path(), "sleeper.sh", "exec sleep 10\n");
    let wait = WaitOptions::new(Duration::from_millis(300), Duration::from_millis(20));
    let ctx = context(dir.path(), Arc::new(RecordingNotifier::new()), wait);

    let spec = ParallelSpec::new(
        "workers",
        sleeper.display().to_string(),
        list(dir.path(), r#"["a", "b"]"#),
        "item",
        TaskArgs::new(),
    );

    let started = Instant::now();
    let err = LocalRunner::new(2).parallel(&spec, &ctx).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        BatchError::Timeout { missing, .. } => assert_eq!(missing.len(), 2),
        other => panic!("expected timeout, got {other:?}"),
    }
}

// =============================================================================
// FULL PIPELINE
// =============================================================================

#[tokio::test]
async fn local_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let prep = write_script(dir.path(), "prep.sh", PREP);
    let worker = write_script(dir.path(), "worker.sh", WORKER);

    let mut config = PipelineConfig {
        workdir: dir.path().to_path_buf(),
        max_workers: Some(2),
        ..PipelineConfig::default()
    };
    config.commands.pre_process = prep.display().to_string();
    config.commands.process_spectra = worker.display().to_string();
    config.wait.poll_interval_secs = 1;

    let runner = Arc::new(LocalRunner::new(config.worker_count()));
    let notifier = Arc::new(RecordingNotifier::new());
    let report = Orchestrator::new(config, runner, notifier.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.state, RunState::DoneSuccess);
    assert_eq!(report.tasks_dispatched, 4);
    assert_eq!(notifier.state_of(ROOT_NODE), Some(NodeState::Success));
    assert_eq!(notifier.children_of(WORKERS_NODE).unwrap().len(), 3);

    // Payload logs stay, markers and the list are removed
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("out-")));
    assert!(!names.iter().any(|n| n.ends_with(".done")));
    assert!(!names.iter().any(|n| n.starts_with("list_")));
}
