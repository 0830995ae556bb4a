//! Job orchestration: one worker subprocess per source, strictly in sequence,
//! with the merged stdout+stderr stream classified into status updates as it
//! arrives.

use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use matchfeed_core::{IngestionJob, SourceOutcome, SourceStatus, StatusUpdate};
use thiserror::Error;
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::progress::{overall_progress, ProgressClassifier, ProgressTracker, COMPLETE};
use crate::status::StatusBroadcaster;
use crate::SyncConfig;

const AGGREGATION_STEP: &str = "fixtures";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("an ingestion job is already running")]
    AlreadyRunning,
    #[error("unknown or disabled source `{0}`")]
    UnknownSource(String),
    #[error("invalid progress pattern: {0}")]
    Classifier(#[from] regex::Error),
    #[error("job task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Builds the subprocess commands a job runs.
pub trait WorkerLauncher: Send + Sync {
    fn source_command(&self, source_id: &str) -> Command;

    /// `None` skips the aggregation step.
    fn aggregation_command(&self) -> Option<Command>;
}

/// Re-executes the running binary with its `scrape` / `fixtures` subcommands.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("resolving current executable")?;
        Ok(Self::new(program))
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn source_command(&self, source_id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(["scrape", source_id, "--last-round", "--skip-analysis"]);
        command
    }

    fn aggregation_command(&self) -> Option<Command> {
        let mut command = Command::new(&self.program);
        command.arg(AGGREGATION_STEP);
        Some(command)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pause: Duration,
    pub reports_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            pause: config.source_pause(),
            reports_dir: config.reports_dir(),
        }
    }
}

#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub join: JoinHandle<IngestionJob>,
}

struct Inner {
    launcher: Arc<dyn WorkerLauncher>,
    status: StatusBroadcaster,
    sources: Vec<String>,
    config: OrchestratorConfig,
    classifier: ProgressClassifier,
    guard: Arc<Mutex<()>>,
    stop: AtomicBool,
}

/// Scheduled and on-demand runs share one instance, so at most one job runs
/// at a time.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

struct WorkerRun {
    status: SourceStatus,
    exit_code: Option<i32>,
    lines: usize,
}

impl WorkerRun {
    fn outcome(&self, source_id: &str) -> SourceOutcome {
        SourceOutcome {
            source_id: source_id.to_string(),
            status: self.status,
            exit_code: self.exit_code,
            output_lines: self.lines,
        }
    }
}

impl JobOrchestrator {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        status: StatusBroadcaster,
        sources: Vec<String>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        Ok(Self {
            inner: Arc::new(Inner {
                launcher,
                status,
                sources,
                config,
                classifier: ProgressClassifier::new()?,
                guard: Arc::new(Mutex::new(())),
                stop: AtomicBool::new(false),
            }),
        })
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.inner.status
    }

    pub fn sources(&self) -> &[String] {
        &self.inner.sources
    }

    pub fn is_running(&self) -> bool {
        self.inner.guard.try_lock().is_err()
    }

    /// Takes effect before the next source starts. Returns whether a job was running.
    pub fn request_stop(&self) -> bool {
        let running = self.is_running();
        if running {
            info!("stop requested; finishing the current source");
            self.inner.stop.store(true, Ordering::SeqCst);
        }
        running
    }

    /// Starts a job in the background. A full job (`only = None`) covers every
    /// configured source and ends with the aggregation step.
    pub fn try_start(&self, only: Option<String>) -> Result<JobHandle, OrchestratorError> {
        let guard = Arc::clone(&self.inner.guard)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::AlreadyRunning)?;

        let (sources, aggregate) = match only {
            Some(source_id) => {
                if !self.inner.sources.contains(&source_id) {
                    return Err(OrchestratorError::UnknownSource(source_id));
                }
                (vec![source_id], false)
            }
            None => (self.inner.sources.clone(), true),
        };

        self.inner.stop.store(false, Ordering::SeqCst);
        let job = IngestionJob::new(sources);
        let job_id = job.job_id;
        self.inner.status.update(
            StatusUpdate::default()
                .running(true)
                .message(format!("Starting job {job_id}"))
                .progress(0)
                .overall(0),
        );
        info!(%job_id, sources = job.outcomes.len(), aggregate, "ingestion job started");

        let this = self.clone();
        let join = tokio::spawn(
            async move {
                let _guard = guard;
                this.execute(job, aggregate).await
            }
            .instrument(info_span!("ingestion_job", %job_id)),
        );
        Ok(JobHandle { job_id, join })
    }

    /// Runs a job to completion.
    pub async fn run(&self, only: Option<String>) -> Result<IngestionJob, OrchestratorError> {
        let handle = self.try_start(only)?;
        Ok(handle.join.await?)
    }

    async fn execute(&self, mut job: IngestionJob, aggregate: bool) -> IngestionJob {
        let status = &self.inner.status;
        let total = job.outcomes.len();
        let steps = total + usize::from(aggregate);

        for index in 0..total {
            if index > 0 && !self.inner.config.pause.is_zero() {
                tokio::time::sleep(self.inner.config.pause).await;
            }
            if self.inner.stop.load(Ordering::SeqCst) {
                warn!(remaining = total - index, "job stopped before all sources ran");
                job.stopped = true;
                break;
            }

            let source_id = job.outcomes[index].source_id.clone();
            status.update(
                StatusUpdate::default()
                    .message(format!("Scraping {source_id} ({}/{total})", index + 1))
                    .progress(0)
                    .overall(overall_progress(index, 0, steps)),
            );
            let command = self.inner.launcher.source_command(&source_id);
            let run = self
                .run_worker(&source_id, command, index, steps)
                .instrument(info_span!("source_run", source = %source_id))
                .await;
            job.record(index, run.status, run.exit_code, run.lines);
            job.overall_progress = overall_progress(index + 1, 0, steps);
        }

        if aggregate && !job.stopped {
            if total > 0 && !self.inner.config.pause.is_zero() {
                tokio::time::sleep(self.inner.config.pause).await;
            }
            if self.inner.stop.load(Ordering::SeqCst) {
                warn!("job stopped before the fixtures step");
                job.stopped = true;
            } else if let Some(command) = self.inner.launcher.aggregation_command() {
                status.update(
                    StatusUpdate::default()
                        .message("Updating fixtures")
                        .progress(0)
                        .overall(overall_progress(total, 0, steps)),
                );
                let run = self
                    .run_worker(AGGREGATION_STEP, command, total, steps)
                    .instrument(info_span!("source_run", source = AGGREGATION_STEP))
                    .await;
                job.aggregation = Some(run.outcome(AGGREGATION_STEP));
            }
        }

        job.finished_at = Some(Utc::now());
        job.overall_progress = COMPLETE;
        let succeeded = job.count(SourceStatus::Success);
        let failed = job.count(SourceStatus::Failed);
        let pending = job.count(SourceStatus::Pending);
        info!(job_id = %job.job_id, succeeded, failed, pending, stopped = job.stopped, "ingestion job finished");

        if let Err(err) = write_job_report(&self.inner.config.reports_dir, &job).await {
            warn!(job_id = %job.job_id, error = %err, "writing job report failed");
        }

        let message = if job.stopped {
            format!("Stopped: {succeeded} succeeded, {failed} failed, {pending} not run")
        } else {
            format!("Finished: {succeeded} succeeded, {failed} failed")
        };
        status.update(
            StatusUpdate::default()
                .running(false)
                .message(message)
                .progress(COMPLETE)
                .overall(COMPLETE),
        );
        job
    }

    /// Every path ends in SUCCESS or FAILED; spawn errors count as FAILED.
    async fn run_worker(&self, label: &str, command: Command, step: usize, steps: usize) -> WorkerRun {
        let (mut child, reader) = match spawn_merged(command) {
            Ok(spawned) => spawned,
            Err(err) => {
                error!(source = label, error = %err, "worker failed to start");
                return WorkerRun {
                    status: SourceStatus::Failed,
                    exit_code: None,
                    lines: 0,
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let pump = tokio::task::spawn_blocking(move || pump_lines(reader, tx));

        let mut tracker = ProgressTracker::new(self.inner.classifier.clone());
        let mut lines = 0usize;
        while let Some(line) = rx.recv().await {
            lines += 1;
            info!(source = label, "{line}");
            if let Some(progress) = tracker.observe(&line) {
                self.inner.status.update(
                    StatusUpdate::default()
                        .progress(progress)
                        .overall(overall_progress(step, progress, steps)),
                );
            }
        }
        if let Err(err) = pump.await {
            warn!(source = label, error = %err, "output reader task failed");
        }

        let exit_code = match child.wait().await {
            Ok(exit) => exit.code(),
            Err(err) => {
                error!(source = label, error = %err, "waiting for worker failed");
                None
            }
        };
        let status = if exit_code == Some(0) {
            info!(source = label, lines, "worker finished");
            SourceStatus::Success
        } else {
            error!(source = label, exit_code, lines, "worker failed");
            SourceStatus::Failed
        };

        if let Some(progress) = tracker.finish(status == SourceStatus::Success) {
            self.inner.status.update(
                StatusUpdate::default()
                    .progress(progress)
                    .overall(overall_progress(step, progress, steps)),
            );
        }
        WorkerRun {
            status,
            exit_code,
            lines,
        }
    }
}

/// Spawns with stdout and stderr sharing one pipe so lines keep their order.
fn spawn_merged(mut command: Command) -> std::io::Result<(Child, PipeReader)> {
    let (reader, writer) = std::io::pipe()?;
    let stderr = writer.try_clone()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr));
    let child = command.spawn()?;
    // The command holds the parent's write ends; EOF only arrives once they close.
    drop(command);
    Ok((child, reader))
}

fn pump_lines(reader: PipeReader, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "reading worker output failed");
                break;
            }
        }
    }
}

/// Writes `reports/<job_id>/job.json`.
pub async fn write_job_report(reports_root: &Path, job: &IngestionJob) -> Result<PathBuf> {
    let dir = reports_root.join(job.job_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("job.json");
    let json = serde_json::to_vec_pretty(job).context("serializing job report")?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: JobOrchestrator,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run(None).await {
                Ok(job) => info!(job_id = %job.job_id, "scheduled ingestion job done"),
                Err(OrchestratorError::AlreadyRunning) => {
                    warn!("scheduled ingestion skipped; a job is already running")
                }
                Err(err) => error!(error = %err, "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "recurring ingestion scheduled");
    Ok(Some(sched))
}
