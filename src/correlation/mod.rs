//! Correlation identifier propagation.
//!
//! A correlation id tags every log line belonging to one logical request.
//! Spawned tasks do not inherit task-local state, so the id is captured
//! explicitly on the calling task and installed again on the detached one
//! with [`scope`].

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP header used to carry the correlation id in and out of the service
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

tokio::task_local! {
    static CURRENT: CorrelationId;
}

/// Identifier shared by all work done on behalf of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse an identifier received from a caller, e.g. from a request header
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

    /// The identifier installed on the current task, if any.
    ///
    /// Returns `None` outside of a [`scope`] and outside of a tokio task.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|id| *id).ok()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run `future` with `id` installed as the current correlation id
pub async fn scope<F>(id: CorrelationId, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(id, future).await
}

/// Run a synchronous closure with `id` installed as the current correlation id
pub fn sync_scope<R>(id: CorrelationId, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(id, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_current_outside_scope() {
        assert_eq!(CorrelationId::current(), None);
    }

    #[test]
    fn test_sync_scope_installs_id() {
        let id = CorrelationId::new();
        let seen = sync_scope(id, CorrelationId::current);
        assert_eq!(seen, Some(id));
        assert_eq!(CorrelationId::current(), None);
    }

    #[tokio::test]
    async fn test_scope_does_not_leak_into_spawned_task() {
        let id = CorrelationId::new();
        scope(id, async move {
            assert_eq!(CorrelationId::current(), Some(id));

            let inherited = tokio::spawn(async { CorrelationId::current() })
                .await
                .unwrap();
            assert_eq!(inherited, None);

            let captured = CorrelationId::current();
            let propagated = tokio::spawn(async move {
                match captured {
                    Some(id) => scope(id, async { CorrelationId::current() }).await,
                    None => None,
                }
            })
            .await
            .unwrap();
            assert_eq!(propagated, Some(id));
        })
        .await;
    }

    #[test]
    fn test_parse() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::parse(&id.to_string()), Some(id));
        assert_eq!(CorrelationId::parse(&format!("  {}  ", id)), Some(id));
        assert_eq!(CorrelationId::parse("not-a-uuid"), None);
    }
}
