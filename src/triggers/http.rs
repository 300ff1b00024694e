use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationId;
use crate::error::Result;
use crate::hub::{DispatchMode, DomainEvent, Envelope, UserRsn};
use crate::server::AppState;

/// Event fields shared by every send request
#[derive(Debug, Deserialize)]
pub struct EventContent {
    /// Logical event type (e.g. "OrderPlaced")
    pub event_type: String,
    /// Event body
    #[serde(default)]
    pub data: serde_json::Value,
    /// Producer-assigned event id, generated when absent
    pub event_id: Option<Uuid>,
    /// When the event happened at the producer, defaults to receipt time
    pub occurred_at: Option<DateTime<Utc>>,
    /// Wire framing; defaults to what existing clients of the mode expect
    pub envelope: Option<Envelope>,
}

impl EventContent {
    fn into_parts(self, mode: DispatchMode) -> (DomainEvent, Envelope) {
        let mut builder = DomainEvent::builder(self.event_type).data(self.data);
        if let Some(id) = self.event_id {
            builder = builder.id(id);
        }
        if let Some(at) = self.occurred_at {
            builder = builder.occurred_at(at);
        }
        let envelope = self.envelope.unwrap_or_else(|| mode.legacy_envelope());
        (builder.build(), envelope)
    }
}

/// Request to send an event to specific user identities
#[derive(Debug, Deserialize)]
pub struct SendToIdentitiesRequest {
    /// Target identities; null and missing are treated as empty
    #[serde(default)]
    pub user_rsns: Option<Vec<UserRsn>>,
    #[serde(flatten)]
    pub event: EventContent,
}

/// Request to send an event to one user token
#[derive(Debug, Deserialize)]
pub struct SendToTokenRequest {
    pub user_token: String,
    #[serde(flatten)]
    pub event: EventContent,
}

/// Request to broadcast an event
#[derive(Debug, Deserialize)]
pub struct SendToAllRequest {
    #[serde(flatten)]
    pub event: EventContent,
}

/// Request to broadcast an event to everyone but one user token
#[derive(Debug, Deserialize)]
pub struct SendToAllExceptTokenRequest {
    pub user_token: String,
    #[serde(flatten)]
    pub event: EventContent,
}

/// Response for accepted dispatches.
///
/// Delivery happens after the response is sent; its outcome is only visible
/// in logs and metrics.
#[derive(Debug, Serialize)]
pub struct DispatchAccepted {
    pub event_id: Uuid,
    pub mode: DispatchMode,
    pub envelope: Envelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

impl DispatchAccepted {
    fn new(event: &DomainEvent, mode: DispatchMode, envelope: Envelope) -> (StatusCode, Json<Self>) {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                event_id: event.id,
                mode,
                envelope,
                correlation_id: CorrelationId::current(),
                timestamp: Utc::now(),
            }),
        )
    }
}

/// Send an event to the groups of the given identities
pub async fn send_to_identities(
    State(state): State<AppState>,
    Json(request): Json<SendToIdentitiesRequest>,
) -> Result<(StatusCode, Json<DispatchAccepted>)> {
    let mode = DispatchMode::Identities;
    let (event, envelope) = request.event.into_parts(mode);
    let user_rsns = request.user_rsns.unwrap_or_default();

    state.hub.send_to_identities(&event, &user_rsns, envelope)?;

    Ok(DispatchAccepted::new(&event, mode, envelope))
}

/// Send an event to the group of one user token
pub async fn send_to_token(
    State(state): State<AppState>,
    Json(request): Json<SendToTokenRequest>,
) -> Result<(StatusCode, Json<DispatchAccepted>)> {
    let mode = DispatchMode::Token;
    let (event, envelope) = request.event.into_parts(mode);

    state.hub.send_to_token(&event, &request.user_token, envelope)?;

    Ok(DispatchAccepted::new(&event, mode, envelope))
}

/// Broadcast an event to every connection
pub async fn send_to_all(
    State(state): State<AppState>,
    Json(request): Json<SendToAllRequest>,
) -> Result<(StatusCode, Json<DispatchAccepted>)> {
    let mode = DispatchMode::All;
    let (event, envelope) = request.event.into_parts(mode);

    state.hub.send_to_all(&event, envelope)?;

    Ok(DispatchAccepted::new(&event, mode, envelope))
}

/// Broadcast an event to every connection outside one user token's group
pub async fn send_to_all_except_token(
    State(state): State<AppState>,
    Json(request): Json<SendToAllExceptTokenRequest>,
) -> Result<(StatusCode, Json<DispatchAccepted>)> {
    let mode = DispatchMode::AllExceptToken;
    let (event, envelope) = request.event.into_parts(mode);

    state
        .hub
        .send_to_all_except_token(&event, &request.user_token, envelope)?;

    Ok(DispatchAccepted::new(&event, mode, envelope))
}
