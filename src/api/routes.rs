use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};
use crate::triggers::{
    send_to_all, send_to_all_except_token, send_to_identities, send_to_token,
};

use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health, Stats & Metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Producer endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/notifications/identities", post(send_to_identities))
                .route("/notifications/token", post(send_to_token))
                .route("/notifications/all", post(send_to_all))
                .route("/notifications/all-except", post(send_to_all_except_token))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
