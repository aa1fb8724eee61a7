//! Control API Adapter: translates operator intents into Engine
//! operations. The shape here is the contract (§4.H/§6); the concrete
//! transport is a thin `axum` binding below, since the teacher crate has
//! no HTTP surface of its own to align with and the rest of the pack's
//! daemon-shaped examples expose this control surface over HTTP.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::engine::EngineHandle;
use crate::ids::{BusId, ClientId};

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub client_id: String,
}

pub fn router(engine: EngineHandle) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:bus_id/assign", post(assign_device))
        .route("/devices/:bus_id/force_free", post(force_free_device))
        .route("/devices/:bus_id/force_reattach", post(force_reattach_device))
        .route("/assign_all", post(assign_all))
        .route("/clients", get(list_clients))
        .route("/debug", get(debug))
        .with_state(ApiState { engine })
}

async fn assign_device(
    State(state): State<ApiState>,
    Path(bus_id): Path<String>,
    Json(body): Json<AssignBody>,
) -> Json<serde_json::Value> {
    let outcome = state
        .engine
        .assign(BusId::new(bus_id), ClientId::new(body.client_id))
        .await;
    Json(serde_json::json!({ "status": outcome }))
}

async fn force_free_device(State(state): State<ApiState>, Path(bus_id): Path<String>) -> Json<serde_json::Value> {
    let outcome = state.engine.force_free(BusId::new(bus_id)).await;
    Json(serde_json::json!({ "status": outcome }))
}

async fn force_reattach_device(State(state): State<ApiState>, Path(bus_id): Path<String>) -> Json<serde_json::Value> {
    let outcome = state.engine.force_reattach(BusId::new(bus_id)).await;
    Json(serde_json::json!({ "status": outcome }))
}

async fn assign_all(State(state): State<ApiState>, Json(body): Json<AssignBody>) -> Json<serde_json::Value> {
    let client_id = ClientId::new(body.client_id);
    let outcome = state.engine.assign_all(client_id).await;
    match outcome {
        crate::engine::Outcome::AssignedAll(client_id) => {
            Json(serde_json::json!({ "status": "assigned", "client_id": client_id.as_str() }))
        }
        other => Json(serde_json::json!({ "status": other })),
    }
}

async fn list_devices(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let devices = state.engine.list_devices().await;
    Json(serde_json::json!({ "devices": devices }))
}

async fn list_clients(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let clients: Vec<String> = state
        .engine
        .list_clients()
        .await
        .into_iter()
        .map(|c| c.as_str().to_owned())
        .collect();
    Json(serde_json::json!({ "clients": clients }))
}

async fn debug(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.engine.debug().await).expect("debug snapshot is serializable"))
}
