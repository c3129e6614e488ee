//! API route handlers.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use bharat_core::error::CrmError;
use serde::Deserialize;
use std::sync::Arc;

use crate::server::AppState;

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn internal(e: CrmError) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!("Health query failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
    )
}

/// Liveness.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "bharat-worker",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.node_id,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Last tick of every job, as recorded by whichever replica ran it.
pub async fn job_health(State(state): State<Arc<AppState>>) -> ApiResult {
    let runs = state.db.list_job_runs().map_err(internal)?;

    let mut jobs: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "name": r.job_name,
                "last_outcome": r.last_outcome,
                "ran": r.last_outcome == "ran",
                "last_tick_at": r.last_tick_at,
                "last_run_at": r.last_run_at,
                "last_error": r.last_error,
                "holder": r.holder,
            })
        })
        .collect();

    for name in &state.job_names {
        if !runs.iter().any(|r| &r.job_name == name) {
            jobs.push(serde_json::json!({
                "name": name,
                "last_outcome": null,
                "ran": false,
                "last_tick_at": null,
                "last_run_at": null,
                "last_error": null,
                "holder": null,
            }));
        }
    }

    let failing = runs
        .iter()
        .filter(|r| matches!(r.last_outcome.as_str(), "failed" | "panicked"))
        .count();

    Ok(Json(serde_json::json!({
        "ok": failing == 0,
        "node_id": state.node_id,
        "jobs": jobs,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DedupQuery {
    pub limit: Option<usize>,
}

/// Recent dedup summaries, newest first. `limit` defaults to 10, max 100.
pub async fn dedup_runs(State(state): State<Arc<AppState>>, Query(q): Query<DedupQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    let runs = state.db.recent_dedup_runs(limit).map_err(internal)?;
    let conflicts = state.db.merge_conflict_count().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "runs": runs,
        "open_conflicts": conflicts,
    })))
}
