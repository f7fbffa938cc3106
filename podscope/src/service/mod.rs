//! HTTP control plane
//!
//! Thin axum surface over the agent: Prometheus scrape, live inventory,
//! probe control, on-demand tasks, and config updates.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::tasks::TaskStatus;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/containers/json", get(containers))
        .route("/tracer", get(tracer_list))
        .route("/tracer/start", post(tracer_start))
        .route("/tracer/stop", post(tracer_stop))
        .route("/tracer/stop_all", post(tracer_stop_all))
        .route("/task/start", post(task_start))
        .route("/task/result", get(task_result))
        .route("/task/stop", post(task_stop))
        .route("/config", post(update_config))
        .with_state(agent)
}

async fn metrics(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    match agent.metric_manager.encode_text().await {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn containers(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    match agent.inventory.get_all().await {
        Ok(all) => {
            let list: Vec<&crate::inventory::Container> =
                all.iter().map(|c| c.as_ref()).collect();
            (StatusCode::OK, Json(json!(list)))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

async fn tracer_list(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    Json(agent.probe_manager.info_dump())
}

#[derive(Deserialize)]
struct TracerReq {
    name: String,
}

async fn tracer_start(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<TracerReq>,
) -> impl IntoResponse {
    match agent.probe_manager.start(&req.name).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

async fn tracer_stop(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<TracerReq>,
) -> impl IntoResponse {
    match agent.probe_manager.stop(&req.name).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

async fn tracer_stop_all(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    match agent.probe_manager.stop_all().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

#[derive(Deserialize)]
struct NewTaskReq {
    tracer_name: String,
    /// Seconds; must stay under an hour.
    timeout: u64,
}

async fn task_start(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<NewTaskReq>,
) -> impl IntoResponse {
    match agent.task_manager.start(&req.tracer_name, Duration::from_secs(req.timeout)) {
        Ok(id) => (StatusCode::OK, Json(json!({ "task_id": id }))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

#[derive(Deserialize)]
struct TaskQuery {
    id: String,
}

async fn task_result(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    let result = agent.task_manager.result(&query.id);
    let status = match result.status {
        TaskStatus::NotExist => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (status, Json(json!(result)))
}

#[derive(Deserialize)]
struct StopTaskReq {
    id: String,
}

async fn task_stop(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<StopTaskReq>,
) -> impl IntoResponse {
    match agent.task_manager.stop(&req.id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

/// Replace the in-memory configuration and persist it. Subsystems pick up
/// the parts they re-read; anything wired at bootstrap needs a restart.
async fn update_config(
    State(agent): State<Arc<Agent>>,
    Json(new_config): Json<AgentConfig>,
) -> impl IntoResponse {
    let path = agent.config_path.clone();
    if let Err(e) = new_config.save(&path) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() })));
    }
    *agent.config.write().unwrap() = new_config;
    info!("configuration updated and persisted to {}", path.display());
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
