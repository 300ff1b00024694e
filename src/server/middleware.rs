use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use super::AppState;
use crate::correlation::{self, CorrelationId, CORRELATION_HEADER};

/// API Key authentication middleware
/// Validates X-API-Key header against configured api.key
pub async fn api_key_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no API key is configured, allow all requests (development mode)
    let Some(expected_key) = &state.settings.api.key else {
        return Ok(next.run(req).await);
    };

    // Check X-API-Key header
    let api_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());

    match api_key {
        Some(key) if key == expected_key => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Missing API key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Run the rest of the request inside a correlation scope.
///
/// Takes the id from `X-Correlation-Id` when it parses, otherwise starts a
/// new one, and echoes it back on the response.
pub async fn correlation_id(req: Request<Body>, next: Next) -> Response {
    let provided = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok());

    let id = match provided.map(|value| (value, CorrelationId::parse(value))) {
        Some((_, Some(id))) => id,
        Some((value, None)) => {
            tracing::debug!(provided = %value, "Unparseable correlation id, starting a new one");
            CorrelationId::new()
        }
        None => CorrelationId::new(),
    };

    let span = tracing::info_span!("request", correlation_id = %id);
    let mut response = correlation::scope(id, next.run(req)).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    response
}
