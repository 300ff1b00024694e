use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Domain event handed to the relay by the producing system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Unique identifier of the event
    pub id: Uuid,
    /// Logical type name (e.g. "OrderPlaced")
    pub event_type: String,
    /// When the event occurred
    pub occurred_at: DateTime<Utc>,
    /// Event body
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Create an event with a fresh id, stamped now
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        EventBuilder::new(event_type).data(data).build()
    }

    pub fn builder(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder::new(event_type)
    }
}

/// Builder for [`DomainEvent`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: Option<Uuid>,
    event_type: String,
    occurred_at: Option<DateTime<Utc>>,
    data: serde_json::Value,
}

impl EventBuilder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            occurred_at: None,
            data: serde_json::Value::Null,
        }
    }

    /// Keep the producer's own event id instead of generating one
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> DomainEvent {
        DomainEvent {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            event_type: self.event_type,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            data: self.data,
        }
    }
}

/// How an event is framed on the wire.
///
/// Clients written against the identity channel expect the bare event, while
/// the token and broadcast channels have always carried `{type, data}`.
/// Callers pick one explicitly per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    /// The serialized event as-is
    Raw,
    /// `{ "type": <event type>, "data": <event> }`
    Typed,
}

impl Envelope {
    /// Produce the payload for `event` framed according to this envelope
    pub fn wrap(self, event: &DomainEvent) -> Result<serde_json::Value, serde_json::Error> {
        let data = serde_json::to_value(event)?;
        Ok(match self {
            Envelope::Raw => data,
            Envelope::Typed => json!({
                "type": event.event_type,
                "data": data,
            }),
        })
    }
}

/// Hub messages pushed to connected clients.
///
/// Serialized as `{"method": ..., "payload": ...}` where `method` names the
/// client-side handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum ServerMessage {
    /// Acknowledges that the connection joined a recipient group
    #[serde(rename = "registered")]
    Registered(String),
    /// Carries a domain event
    #[serde(rename = "notifyEvent")]
    NotifyEvent(serde_json::Value),
}

impl ServerMessage {
    pub fn registered(description: impl Into<String>) -> Self {
        Self::Registered(description.into())
    }

    pub fn notify_event(payload: serde_json::Value) -> Self {
        Self::NotifyEvent(payload)
    }

    /// Client-side handler name
    pub fn method(&self) -> &'static str {
        match self {
            ServerMessage::Registered(_) => "registered",
            ServerMessage::NotifyEvent(_) => "notifyEvent",
        }
    }
}
