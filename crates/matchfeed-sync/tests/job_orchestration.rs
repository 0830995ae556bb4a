// Fake workers are `/bin/sh -c` scripts speaking the progress protocol.
#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use matchfeed_core::{IngestionJob, SourceStatus};
use matchfeed_sync::{JobOrchestrator, OrchestratorConfig, OrchestratorError, StatusBroadcaster, WorkerLauncher};
use tempfile::tempdir;
use tokio::process::Command;

struct ShellLauncher {
    scripts: HashMap<String, String>,
    aggregation: Option<String>,
}

impl ShellLauncher {
    fn new(scripts: &[(&str, &str)], aggregation: Option<&str>) -> Self {
        Self {
            scripts: scripts.iter().map(|(id, s)| (id.to_string(), s.to_string())).collect(),
            aggregation: aggregation.map(str::to_string),
        }
    }
}

fn sh(script: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(script);
    command
}

impl WorkerLauncher for ShellLauncher {
    fn source_command(&self, source_id: &str) -> Command {
        sh(self.scripts.get(source_id).map(String::as_str).unwrap_or("exit 3"))
    }

    fn aggregation_command(&self) -> Option<Command> {
        self.aggregation.as_deref().map(sh)
    }
}

const HEALTHY: &str = "echo 'Found 2 matches.'; echo 'Match 1/2'; echo 'selector drift' >&2; \
                       echo 'Match 2/2'; echo 'Final sync: 2 records'; \
                       echo 'Sync complete: inserted=2 updated=0 unchanged=0 failed=0'";
const CRASHING: &str = "echo 'Found 3 matches.'; echo 'Match 1/3'; echo 'boom' >&2; exit 1";

fn orchestrator(launcher: ShellLauncher, sources: &[&str], reports: &Path) -> JobOrchestrator {
    JobOrchestrator::new(
        Arc::new(launcher),
        StatusBroadcaster::new(),
        sources.iter().map(|s| s.to_string()).collect(),
        OrchestratorConfig {
            pause: Duration::ZERO,
            reports_dir: reports.to_path_buf(),
        },
    )
    .expect("orchestrator")
}

fn read_report(reports: &Path, job: &IngestionJob) -> IngestionJob {
    let path = reports.join(job.job_id.to_string()).join("job.json");
    let bytes = std::fs::read(&path).expect("job report written");
    serde_json::from_slice(&bytes).expect("job report parses")
}

#[tokio::test]
async fn one_failing_source_does_not_block_the_next() {
    let dir = tempdir().expect("tempdir");
    let launcher = ShellLauncher::new(&[("a", HEALTHY), ("b", CRASHING)], Some("echo 'Sync complete: inserted=0'"));
    let orch = orchestrator(launcher, &["a", "b"], dir.path());

    let job = orch.run(None).await.expect("job");

    assert_eq!(job.count(SourceStatus::Success), 1);
    assert_eq!(job.count(SourceStatus::Failed), 1);
    assert_eq!(job.outcomes[0].status, SourceStatus::Success);
    assert_eq!(job.outcomes[0].exit_code, Some(0));
    // stderr is merged into the same stream
    assert_eq!(job.outcomes[0].output_lines, 6);
    assert_eq!(job.outcomes[1].status, SourceStatus::Failed);
    assert_eq!(job.outcomes[1].exit_code, Some(1));
    assert_eq!(job.outcomes[1].output_lines, 3);
    let aggregation = job.aggregation.as_ref().expect("aggregation ran");
    assert_eq!(aggregation.status, SourceStatus::Success);
    assert!(job.is_terminal());
    assert!(!job.stopped);

    let snapshot = orch.status().read();
    assert!(!snapshot.is_running);
    assert_eq!(snapshot.overall_progress, 100);
    assert!(!orch.is_running());

    let report = read_report(dir.path(), &job);
    assert_eq!(report, job);
}

#[tokio::test]
async fn progress_is_visible_while_the_worker_runs() {
    let dir = tempdir().expect("tempdir");
    let slow = "echo 'Found 4 matches.'; echo 'Match 2/4'; sleep 2; echo 'Match 4/4'";
    let orch = orchestrator(ShellLauncher::new(&[("a", slow)], None), &["a"], dir.path());

    let handle = orch.try_start(Some("a".into())).expect("start");
    let mut seen_mid_run = None;
    for _ in 0..100 {
        let snapshot = orch.status().read();
        if snapshot.is_running && snapshot.progress > 5 {
            seen_mid_run = Some(snapshot);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let job = handle.join.await.expect("join");

    let mid = seen_mid_run.expect("progress observed before the worker exited");
    assert!(mid.progress < 90, "{mid:?}");
    assert!(job.aggregation.is_none(), "single-source jobs skip aggregation");
    assert_eq!(orch.status().read().progress, 100);
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let dir = tempdir().expect("tempdir");
    let orch = orchestrator(ShellLauncher::new(&[("a", "sleep 1")], None), &["a"], dir.path());

    let handle = orch.try_start(None).expect("first start");
    assert!(orch.is_running());
    assert!(matches!(orch.try_start(Some("a".into())), Err(OrchestratorError::AlreadyRunning)));

    handle.join.await.expect("join");
    assert!(!orch.is_running());
    let again = orch.try_start(None).expect("start after finish");
    again.join.await.expect("join");
}

#[tokio::test]
async fn stop_leaves_unattempted_sources_pending() {
    let dir = tempdir().expect("tempdir");
    let launcher = ShellLauncher::new(&[("a", "sleep 1"), ("b", "exit 0"), ("c", "exit 0")], Some("exit 0"));
    let orch = orchestrator(launcher, &["a", "b", "c"], dir.path());

    let handle = orch.try_start(None).expect("start");
    assert!(orch.request_stop());
    let job = handle.join.await.expect("join");

    assert!(job.stopped);
    assert_eq!(job.outcomes[1].status, SourceStatus::Pending);
    assert_eq!(job.outcomes[2].status, SourceStatus::Pending);
    assert!(job.aggregation.is_none());

    let report = read_report(dir.path(), &job);
    assert!(report.stopped);
    assert!(!orch.status().read().is_running);
}

#[tokio::test]
async fn stop_during_the_final_pause_skips_fixtures() {
    let dir = tempdir().expect("tempdir");
    let orch = JobOrchestrator::new(
        Arc::new(ShellLauncher::new(&[("a", "exit 0")], Some("exit 0"))),
        StatusBroadcaster::new(),
        vec!["a".to_string()],
        OrchestratorConfig {
            pause: Duration::from_millis(800),
            reports_dir: dir.path().to_path_buf(),
        },
    )
    .expect("orchestrator");

    let handle = orch.try_start(None).expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(orch.request_stop());
    let job = handle.join.await.expect("join");

    assert_eq!(job.outcomes[0].status, SourceStatus::Success);
    assert!(job.stopped);
    assert!(job.aggregation.is_none());
    assert!(read_report(dir.path(), &job).stopped);
}
