use axum::{extract::State, Json};
use serde::Serialize;

use crate::hub::DispatcherStatsSnapshot;
use crate::server::AppState;
use crate::transport::TransportStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: TransportStats,
    pub dispatcher: DispatcherStatsSnapshot,
    pub identity_resolver: bool,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.transport.stats(),
        dispatcher: state.hub.dispatcher().stats(),
        identity_resolver: state.hub.registrar().has_identity_resolver(),
    })
}
