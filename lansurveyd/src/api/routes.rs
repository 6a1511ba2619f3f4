use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use crate::engine::EngineHandle;
use crate::upnp::UpnpDiscovery;
use shared::protocol::API_PREFIX;
use shared::types::{DeviceMap, ServiceRecord};

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub upnp: UpnpDiscovery,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&api_path("/services"), get(get_services))
        .route(&api_path("/services/:instance"), get(get_service))
        .route(&api_path("/devices"), get(get_devices))
        .with_state(state)
}

fn api_path(route: &str) -> String {
    format!("{}{}", API_PREFIX, route)
}

async fn get_services(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServiceRecord>>, StatusCode> {
    state
        .engine
        .list()
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to query services: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_service(
    State(state): State<AppState>,
    Path(instance): Path<String>,
) -> Result<Json<ServiceRecord>, StatusCode> {
    state
        .engine
        .get(instance)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query service: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_devices(State(state): State<AppState>) -> Json<DeviceMap> {
    Json(state.upnp.snapshot())
}
