//! JSON status and trigger surface over the job orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use matchfeed_core::IngestionJob;
use matchfeed_sync::{
    load_source_registry, maybe_build_scheduler, JobOrchestrator, OrchestratorConfig, OrchestratorError,
    SelfExecLauncher, StatusBroadcaster, SyncConfig,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: JobOrchestrator,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(orchestrator: JobOrchestrator, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartJobRequest {
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
    pub source: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/jobs", post(start_job_handler))
        .route("/jobs/running", get(running_handler))
        .route("/jobs/stop", post(stop_job_handler))
        .route("/jobs/latest", get(latest_job_handler))
        .with_state(Arc::new(state))
}

/// Wires config, registry, orchestrator and the optional recurring job, then serves.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    // Nothing can be reconciled without the store; fail before accepting jobs.
    config.connect_store()?;

    let registry = load_source_registry(&config.workspace_root).await?;
    let sources = registry.enabled().map(|s| s.source_id.clone()).collect::<Vec<_>>();
    let orchestrator = JobOrchestrator::new(
        Arc::new(SelfExecLauncher::current_exe()?),
        StatusBroadcaster::new(),
        sources,
        OrchestratorConfig::from_sync_config(&config),
    )?;

    let scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let state = AppState::new(orchestrator, config.reports_dir());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, scheduler = scheduler.is_some(), "serving");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": "matchfeed" })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status().read()).into_response()
}

async fn running_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({ "running": state.orchestrator.is_running() })).into_response()
}

/// Body is optional; an empty body starts a full job.
async fn start_job_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartJobRequest::default()
    } else {
        match serde_json::from_slice::<StartJobRequest>(&body) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")),
        }
    };

    let source = request.source.clone();
    match state.orchestrator.try_start(request.source) {
        Ok(handle) => {
            info!(job_id = %handle.job_id, source = ?source, "job accepted");
            (
                StatusCode::ACCEPTED,
                Json(StartJobResponse {
                    job_id: handle.job_id,
                    source,
                }),
            )
                .into_response()
        }
        Err(err @ OrchestratorError::AlreadyRunning) => error_response(StatusCode::CONFLICT, err.to_string()),
        Err(err @ OrchestratorError::UnknownSource(_)) => error_response(StatusCode::NOT_FOUND, err.to_string()),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn stop_job_handler(State(state): State<Arc<AppState>>) -> Response {
    let stopping = state.orchestrator.request_stop();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "stopping": stopping }))).into_response()
}

async fn latest_job_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_latest_job(&state.reports_dir).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no job reports yet".to_string()),
        Err(err) => {
            warn!(error = %err, "reading job reports failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Newest `reports/<job_id>/job.json` by start time; unreadable reports are skipped.
async fn load_latest_job(reports_dir: &Path) -> anyhow::Result<Option<IngestionJob>> {
    let mut entries = match tokio::fs::read_dir(reports_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", reports_dir.display())),
    };

    let mut latest: Option<IngestionJob> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path().join("job.json");
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };
        let job: IngestionJob = match serde_json::from_slice(&bytes) {
            Ok(job) => job,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed job report");
                continue;
            }
        };
        if latest.as_ref().is_none_or(|l| job.started_at > l.started_at) {
            latest = Some(job);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use matchfeed_core::SourceStatus;
    use matchfeed_sync::{write_job_report, WorkerLauncher};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::process::Command;
    use tower::ServiceExt;

    struct SleepyLauncher;

    impl WorkerLauncher for SleepyLauncher {
        fn source_command(&self, _source_id: &str) -> Command {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg("echo 'Found 1 matches.'; sleep 1");
            command
        }

        fn aggregation_command(&self) -> Option<Command> {
            None
        }
    }

    fn state(reports: &Path) -> AppState {
        let orchestrator = JobOrchestrator::new(
            Arc::new(SleepyLauncher),
            StatusBroadcaster::new(),
            vec!["eredivisie".into()],
            OrchestratorConfig {
                pause: Duration::ZERO,
                reports_dir: reports.to_path_buf(),
            },
        )
        .unwrap();
        AppState::new(orchestrator, reports)
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn idle_status_and_health() {
        let dir = tempdir().unwrap();
        let app = app(state(dir.path()));

        let resp = app.clone().oneshot(get("/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = json_body(resp).await;
        assert_eq!(status["is_running"], false);
        assert_eq!(status["message"], "Idle");

        let resp = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/jobs/running")).await.unwrap();
        assert_eq!(json_body(resp).await["running"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_trigger_conflicts_while_a_job_runs() {
        let dir = tempdir().unwrap();
        let state = state(dir.path());
        let orchestrator = state.orchestrator.clone();
        let app = app(state);

        let resp = app.clone().oneshot(post("/jobs", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let accepted = json_body(resp).await;
        assert!(accepted["job_id"].is_string());

        let resp = app.clone().oneshot(post("/jobs", r#"{"source":"eredivisie"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(get("/jobs/running")).await.unwrap();
        assert_eq!(json_body(resp).await["running"], true);

        let resp = app.clone().oneshot(post("/jobs/stop", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await["stopping"], true);

        for _ in 0..100 {
            if !orchestrator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let resp = app.oneshot(get("/jobs/latest")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["job_id"], accepted["job_id"]);
    }

    #[tokio::test]
    async fn unknown_source_and_bad_body_are_rejected() {
        let dir = tempdir().unwrap();
        let app = app(state(dir.path()));

        let resp = app.clone().oneshot(post("/jobs", r#"{"source":"ligue-9"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(post("/jobs", "{not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn latest_job_picks_newest_report() {
        let dir = tempdir().unwrap();
        let app = app(state(dir.path()));

        let resp = app.clone().oneshot(get("/jobs/latest")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let mut older = IngestionJob::new(vec!["eredivisie".to_string()]);
        older.started_at -= chrono::Duration::hours(24);
        let mut newer = IngestionJob::new(vec!["eredivisie".to_string()]);
        newer.record(0, SourceStatus::Failed, Some(2), 4);
        write_job_report(dir.path(), &older).await.unwrap();
        write_job_report(dir.path(), &newer).await.unwrap();

        let resp = app.oneshot(get("/jobs/latest")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = json_body(resp).await;
        assert_eq!(job["job_id"], serde_json::json!(newer.job_id));
        assert_eq!(job["outcomes"][0]["status"], "FAILED");
    }
}
