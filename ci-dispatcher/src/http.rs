// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The webhook sink, log viewer, badges, and job inspection endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxPath, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    error::ApiError,
    forge::ForgeClient,
    queue::Queue,
    record::{RecordStore, Status},
    util::is_sha,
    webhook,
};

const LOG_VIEWER_PAGE: &str = include_str!("../assets/log_viewer.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub records: Arc<RecordStore>,
    pub queue: Arc<Queue>,
    pub forge: Arc<ForgeClient>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/github", axum::routing::post(handle_github))
        .route("/log/:id", get(handle_log_page))
        .route("/logs/:id", get(handle_logs_redirect))
        .route("/logs/raw/:id", get(handle_logs_raw))
        .route("/logs/records/:id", get(handle_logs_records))
        .route("/logs/coverage/:sha/*path", get(handle_logs_coverage))
        .route("/coverage/:repo/:branch", get(handle_coverage_badge))
        .route("/status/:repo/:branch", get(handle_status_badge))
        .route("/jobs", get(handle_jobs))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Logs method, path, status, and duration for every request. Hand-rolled
/// rather than reaching for `tower-http`'s trace layer, since that layer
/// speaks through `tracing` and this service's ambient logging is `log`.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{} {} -> {} ({:?})",
        method,
        path,
        response.status(),
        start.elapsed()
    );

    response
}

async fn handle_github(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let target_id = headers
        .get("x-github-hook-installation-target-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if target_id != state.config.env.github_app_identifier {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let signature = headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-hub-signature"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !webhook::verify_signature(&state.config.env.github_webhook_secret, &body, signature) {
        return Ok((StatusCode::BAD_REQUEST, "bad signature").into_response());
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = webhook::parse_event(event_type, &body)
        .map_err(|err| ApiError::Validation(err.to_string()))?;

    state
        .dispatcher
        .dispatch(event)
        .await
        .map_err(|err| ApiError::Validation(err.to_string()))?;

    Ok((StatusCode::OK, "ok").into_response())
}

async fn handle_log_page() -> impl IntoResponse {
    ([("content-type", "text/html; charset=utf-8")], LOG_VIEWER_PAGE)
}

async fn handle_logs_redirect(AxPath(id): AxPath<String>) -> impl IntoResponse {
    Redirect::permanent(&format!("/log/{id}"))
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn handle_logs_raw(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let sha = resolve_sha(&state, &id).await?;

    let file_name = if query.kind.as_deref() == Some("logger") {
        "test_output.log".to_string()
    } else {
        format!("std_output-{}.log", crate::util::short_id(&sha, 7))
    };

    let path = state
        .config
        .data_path
        .join("reports")
        .join(&sha)
        .join(&file_name);

    let status = job_status(&state, &sha).await?;

    let body = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("log for {sha}")))?;

    let mut response = body.into_response();
    response
        .headers_mut()
        .insert("X-CI-JobStatus", HeaderValue::from_static(status));
    Ok(response)
}

async fn handle_logs_records(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sha = match resolve_sha(&state, &id).await {
        Ok(sha) => sha,
        Err(_) => id.clone(),
    };

    for job in state.queue.jobs_for_sha(&sha).await {
        let data = job.data.lock().await;
        return Ok(Json(json!(*data)));
    }

    let record = state
        .records
        .load_one(&sha)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("record for {sha}")))?;

    Ok(Json(json!(record)))
}

async fn handle_logs_coverage(
    State(state): State<Arc<AppState>>,
    AxPath((sha, path)): AxPath<(String, String)>,
) -> Result<Response, ApiError> {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Err(ApiError::Validation("directory listing is forbidden".into()));
    }

    let full_path = state
        .config
        .data_path
        .join("reports")
        .join(&sha)
        .join(relative);

    let bytes = tokio::fs::read(&full_path)
        .await
        .map_err(|_| ApiError::NotFound(format!("coverage report file {relative}")))?;

    let content_type = if full_path.extension().and_then(|e| e.to_str()) == Some("html") {
        "text/html; charset=utf-8"
    } else {
        "application/octet-stream"
    };

    Ok(([("content-type", content_type)], bytes).into_response())
}

#[derive(Deserialize)]
struct BadgeQuery {
    force: Option<String>,
}

async fn handle_coverage_badge(
    State(state): State<Arc<AppState>>,
    AxPath((repo, branch)): AxPath<(String, String)>,
    Query(query): Query<BadgeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    badge_response(&state, &repo, &branch, query.force.as_deref() == Some("1"), "coverage").await
}

async fn handle_status_badge(
    State(state): State<Arc<AppState>>,
    AxPath((repo, branch)): AxPath<(String, String)>,
    Query(query): Query<BadgeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    badge_response(&state, &repo, &branch, query.force.as_deref() == Some("1"), "build").await
}

async fn handle_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pile = state.queue.snapshot().await;
    Json(json!({ "total": pile.len(), "pile": pile }))
}

async fn resolve_sha(state: &AppState, id: &str) -> Result<String, ApiError> {
    if is_sha(id) {
        if let Some(record) = state.records.load_one(id).await.map_err(ApiError::Internal)? {
            return Ok(record.commit);
        }
    }

    state
        .forge
        .fetch_commit(id, !is_sha(id), None)
        .await
        .map_err(|err| ApiError::Forge(err.to_string()))
}

/// Reports which of the four states the log-viewer page polls for: a job
/// still on the pile is `running` or `queued`; otherwise the commit is
/// `finished` if a record was already written, or `waiting` if it never ran.
async fn job_status(state: &AppState, sha: &str) -> Result<&'static str, ApiError> {
    let jobs = state.queue.jobs_for_sha(sha).await;
    match jobs.first() {
        Some(job) if job.is_running().await => Ok("running"),
        Some(_) => Ok("queued"),
        None => {
            let has_record = state
                .records
                .load_one(sha)
                .await
                .map_err(ApiError::Internal)?
                .is_some();
            Ok(if has_record { "finished" } else { "waiting" })
        }
    }
}

/// Enqueues a job when no record exists yet for the branch's head commit
/// (unless one is already queued), otherwise reports the cached outcome.
async fn badge_response(
    state: &AppState,
    repo: &str,
    branch: &str,
    force: bool,
    kind: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sha = state
        .forge
        .fetch_commit(branch, true, Some(repo))
        .await
        .map_err(|err| ApiError::Forge(err.to_string()))?;

    let record = state.records.load_one(&sha).await.map_err(ApiError::Internal)?;

    let already_queued = !state.queue.jobs_for_sha(&sha).await.is_empty();

    if record.is_none() || force {
        if !already_queued {
            let mut data = crate::queue::JobData::new(state.config.env.repo_owner.clone(), repo.to_string(), sha.clone());
            data.context = format!("{kind}/{}", state.config.env.userdomain);
            state.queue.add(data).await;
        }
        return Ok(Json(badge_json(kind, "pending", "orange")));
    }

    let record = record.expect("checked above");
    if record.status == Status::Error {
        return Ok(Json(badge_json(kind, "unknown", "orange")));
    }

    match kind {
        "coverage" => {
            let coverage = record.coverage.unwrap_or(0.0);
            let color = if coverage > 75.0 { "green" } else { "red" };
            Ok(Json(badge_json(kind, &format!("{coverage:.2}%"), color)))
        }
        _ => {
            let (message, color) = match record.status {
                Status::Success => ("passing", "green"),
                Status::Failure => ("failing", "red"),
                Status::Error => ("unknown", "orange"),
            };
            Ok(Json(badge_json(kind, message, color)))
        }
    }
}

fn badge_json(label: &str, message: &str, color: &str) -> serde_json::Value {
    json!({
        "schemaVersion": 1,
        "label": label,
        "message": message,
        "color": color,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_json_has_fixed_schema_version() {
        let value = badge_json("coverage", "80.00%", "green");
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["label"], "coverage");
    }
}
