use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::correlation::{self, CorrelationId};
use crate::error::RelayError;
use crate::metrics::{DeliveryMetrics, DispatchMetrics};
use crate::transport::{GroupTransport, TransportError};

use super::groups::{normalize_token, user_group, user_rsn_group};
use super::identity::UserRsn;
use super::message::{DomainEvent, Envelope, ServerMessage};

/// Upper bound on a single dispatch, measured from scheduling
pub const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(15);

/// Behaviour of [`FanOutDispatcher::send_to_all_except_token`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptTokenMode {
    /// Log the request and deliver nothing
    #[default]
    Disabled,
    /// Broadcast to every connection outside the token's group
    ExcludeToken,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Deadline shared by every target of one dispatch
    pub deadline: Duration,
    pub except_token_mode: ExceptTokenMode,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DISPATCH_DEADLINE,
            except_token_mode: ExceptTokenMode::default(),
        }
    }
}

/// Addressing mode of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Identities,
    Token,
    All,
    AllExceptToken,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Identities => "identities",
            DispatchMode::Token => "token",
            DispatchMode::All => "all",
            DispatchMode::AllExceptToken => "all_except_token",
        }
    }

    /// Envelope existing clients expect on this mode: the identity channel
    /// carries bare events, every other mode the typed envelope.
    pub fn legacy_envelope(&self) -> Envelope {
        match self {
            DispatchMode::Identities => Envelope::Raw,
            _ => Envelope::Typed,
        }
    }
}

/// One delivery destination within a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Group(String),
    All,
    AllExcept(Vec<String>),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Group(group) => f.write_str(group),
            Target::All => f.write_str("*"),
            Target::AllExcept(groups) => write!(f, "* except [{}]", groups.join(", ")),
        }
    }
}

/// Immutable unit of outbound work, consumed by the detached task
struct DeliveryPlan {
    mode: DispatchMode,
    targets: Vec<Target>,
    message: ServerMessage,
}

/// How a dispatch ended.
///
/// Per-target failures never show up here; they are only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Every target was attempted
    Completed { attempted: usize },
    /// The deadline cancelled the dispatch before all targets were attempted
    DeadlineExceeded { attempted: usize, total: usize },
    /// The dispatch was intentionally not performed
    Skipped,
    /// No async runtime was available to run the dispatch
    NotScheduled,
    /// The delivery task itself was aborted
    Aborted,
}

/// Handle to a scheduled dispatch.
///
/// Dropping it detaches the dispatch; delivery continues in the background.
#[derive(Debug)]
pub struct DispatchHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(DispatchOutcome),
    Running(JoinHandle<DispatchOutcome>),
}

impl DispatchHandle {
    fn ready(outcome: DispatchOutcome) -> Self {
        Self {
            state: HandleState::Ready(outcome),
        }
    }

    fn running(handle: JoinHandle<DispatchOutcome>) -> Self {
        Self {
            state: HandleState::Running(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Running(handle) => handle.is_finished(),
        }
    }

    /// Wait for the dispatch to end
    pub async fn wait(self) -> DispatchOutcome {
        match self.state {
            HandleState::Ready(outcome) => outcome,
            HandleState::Running(handle) => handle.await.unwrap_or(DispatchOutcome::Aborted),
        }
    }
}

/// Statistics for the fan-out dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Dispatches handed to the runtime
    pub dispatches_scheduled: AtomicU64,
    /// Dispatches skipped (empty target set or disabled mode)
    pub dispatches_skipped: AtomicU64,
    /// Dispatches cancelled by the deadline
    pub dispatches_abandoned: AtomicU64,
    /// Dispatches that could not be scheduled
    pub scheduling_failures: AtomicU64,
    /// Per-target successful deliveries
    pub deliveries_succeeded: AtomicU64,
    /// Per-target timeouts
    pub deliveries_timed_out: AtomicU64,
    /// Per-target errors
    pub deliveries_failed: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            dispatches_scheduled: self.dispatches_scheduled.load(Ordering::Relaxed),
            dispatches_skipped: self.dispatches_skipped.load(Ordering::Relaxed),
            dispatches_abandoned: self.dispatches_abandoned.load(Ordering::Relaxed),
            scheduling_failures: self.scheduling_failures.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_timed_out: self.deliveries_timed_out.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub dispatches_scheduled: u64,
    pub dispatches_skipped: u64,
    pub dispatches_abandoned: u64,
    pub scheduling_failures: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_timed_out: u64,
    pub deliveries_failed: u64,
}

/// Fans events out to recipient groups without blocking the caller
pub struct FanOutDispatcher {
    transport: Arc<dyn GroupTransport>,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl FanOutDispatcher {
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self::with_config(transport, DispatcherConfig::default())
    }

    pub fn with_config(transport: Arc<dyn GroupTransport>, config: DispatcherConfig) -> Self {
        Self {
            transport,
            config,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Send an event to the group of every listed identity
    pub fn send_to_identities(
        &self,
        event: &DomainEvent,
        user_rsns: &[UserRsn],
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        let message = build_message(event, envelope)?;

        tracing::debug!(
            user_rsn_count = user_rsns.len(),
            event_type = %event.event_type,
            "Sending a message on the hub for user RSNs [{}]",
            user_rsns
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let targets = user_rsns
            .iter()
            .map(|rsn| Target::Group(user_rsn_group(rsn)))
            .collect();

        Ok(self.schedule(DeliveryPlan {
            mode: DispatchMode::Identities,
            targets,
            message,
        }))
    }

    /// Send an event to the group of one user token
    pub fn send_to_token(
        &self,
        event: &DomainEvent,
        user_token: &str,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        let message = build_message(event, envelope)?;
        let user_token = require_token(user_token)?;

        tracing::debug!(
            user_token = %user_token,
            event_type = %event.event_type,
            "Sending a message on the hub for user [{}]",
            user_token
        );

        Ok(self.schedule(DeliveryPlan {
            mode: DispatchMode::Token,
            targets: vec![Target::Group(user_group(&user_token))],
            message,
        }))
    }

    /// Send an event to every connection
    pub fn send_to_all(
        &self,
        event: &DomainEvent,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        let message = build_message(event, envelope)?;

        tracing::debug!(event_type = %event.event_type, "Sending a message on the hub to all users");

        Ok(self.schedule(DeliveryPlan {
            mode: DispatchMode::All,
            targets: vec![Target::All],
            message,
        }))
    }

    /// Send an event to every connection except those of one user token.
    ///
    /// Only dispatches when configured with [`ExceptTokenMode::ExcludeToken`].
    pub fn send_to_all_except_token(
        &self,
        event: &DomainEvent,
        user_token: &str,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        let message = build_message(event, envelope)?;
        let user_token = require_token(user_token)?;

        tracing::debug!(
            user_token = %user_token,
            event_type = %event.event_type,
            "Sending a message on the hub for all users except user [{}]",
            user_token
        );

        match self.config.except_token_mode {
            ExceptTokenMode::Disabled => {
                self.stats.dispatches_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    user_token = %user_token,
                    "Sending to all users except one is disabled, nothing dispatched"
                );
                Ok(DispatchHandle::ready(DispatchOutcome::Skipped))
            }
            ExceptTokenMode::ExcludeToken => Ok(self.schedule(DeliveryPlan {
                mode: DispatchMode::AllExceptToken,
                targets: vec![Target::AllExcept(vec![user_group(&user_token)])],
                message,
            })),
        }
    }

    /// Hand a plan to the runtime as one detached, deadline-bounded task
    fn schedule(&self, plan: DeliveryPlan) -> DispatchHandle {
        if plan.targets.is_empty() {
            self.stats.dispatches_skipped.fetch_add(1, Ordering::Relaxed);
            return DispatchHandle::ready(DispatchOutcome::Completed { attempted: 0 });
        }

        // Only visible here: the spawned task starts without it
        let correlation_id = CorrelationId::current();

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.stats.scheduling_failures.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_scheduling_failure();
                for target in &plan.targets {
                    tracing::error!(
                        mode = plan.mode.as_str(),
                        target = %target,
                        error = %e,
                        "Queueing a message on the hub resulted in an error"
                    );
                }
                return DispatchHandle::ready(DispatchOutcome::NotScheduled);
            }
        };

        self.stats.dispatches_scheduled.fetch_add(1, Ordering::Relaxed);
        DispatchMetrics::record_scheduled(plan.mode.as_str());

        let deadline = Instant::now() + self.config.deadline;
        let span = tracing::info_span!(
            "relay.dispatch",
            mode = plan.mode.as_str(),
            targets = plan.targets.len(),
            correlation_id = tracing::field::Empty,
        );
        if let Some(id) = correlation_id {
            span.record("correlation_id", tracing::field::display(id));
        }

        let task = run_dispatch(
            plan,
            self.transport.clone(),
            self.stats.clone(),
            correlation_id,
            deadline,
        );

        DispatchHandle::running(runtime.spawn(task.instrument(span)))
    }
}

/// Body of the detached task
async fn run_dispatch(
    plan: DeliveryPlan,
    transport: Arc<dyn GroupTransport>,
    stats: Arc<DispatcherStats>,
    correlation_id: Option<CorrelationId>,
    deadline: Instant,
) -> DispatchOutcome {
    let total = plan.targets.len();
    let mut attempted = 0;

    let result = match correlation_id {
        Some(id) => {
            let work = deliver_all(&plan, transport.as_ref(), &stats, &mut attempted);
            tokio::time::timeout_at(deadline, correlation::scope(id, work)).await
        }
        None => {
            DispatchMetrics::record_correlation_failure();
            for target in &plan.targets {
                tracing::warn!(
                    mode = plan.mode.as_str(),
                    target = %target,
                    "Transferring correlation id to the dispatch task failed, continuing without it"
                );
            }
            let work = deliver_all(&plan, transport.as_ref(), &stats, &mut attempted);
            tokio::time::timeout_at(deadline, work).await
        }
    };

    match result {
        Ok(()) => DispatchOutcome::Completed { attempted },
        Err(_) => {
            stats.dispatches_abandoned.fetch_add(1, Ordering::Relaxed);
            DispatchMetrics::record_abandoned();
            tracing::warn!(
                mode = plan.mode.as_str(),
                attempted,
                total,
                "Dispatch deadline reached, remaining targets abandoned"
            );
            DispatchOutcome::DeadlineExceeded { attempted, total }
        }
    }
}

/// Attempt every target in order; no target's failure stops the loop
async fn deliver_all(
    plan: &DeliveryPlan,
    transport: &dyn GroupTransport,
    stats: &DispatcherStats,
    attempted: &mut usize,
) {
    let mode = plan.mode.as_str();

    for target in &plan.targets {
        *attempted += 1;

        let attempt = match target {
            Target::Group(group) => transport.send_to_group(group, &plan.message),
            Target::All => transport.send_to_all(&plan.message),
            Target::AllExcept(groups) => transport.send_to_all_except(&plan.message, groups),
        };

        let result = AssertUnwindSafe(attempt)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TransportError::Rejected("transport panicked".to_string())));

        match result {
            Ok(()) => {
                stats.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_delivered(mode);
                tracing::debug!(mode, target = %target, "Delivered message on the hub");
            }
            Err(e) if e.is_timeout() => {
                stats.deliveries_timed_out.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_timeout(mode);
                tracing::warn!(
                    mode,
                    target = %target,
                    error = %e,
                    "Sending a message on the hub timed-out"
                );
            }
            Err(e) => {
                stats.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                DeliveryMetrics::record_error(mode);
                tracing::error!(
                    mode,
                    target = %target,
                    error = %e,
                    "Sending a message on the hub resulted in an error"
                );
            }
        }
    }
}

fn build_message(event: &DomainEvent, envelope: Envelope) -> Result<ServerMessage, RelayError> {
    if event.event_type.trim().is_empty() {
        return Err(RelayError::invalid_argument("event type must not be empty"));
    }

    let payload = envelope
        .wrap(event)
        .map_err(|e| RelayError::invalid_argument(format!("event is not serializable: {}", e)))?;

    Ok(ServerMessage::notify_event(payload))
}

fn require_token(user_token: &str) -> Result<String, RelayError> {
    let user_token = normalize_token(user_token);
    if user_token.is_empty() {
        return Err(RelayError::invalid_argument("user token must not be empty"));
    }
    Ok(user_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    /// Records sends and fails or hangs on configured groups
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Mutex<Vec<String>>,
        timeout_groups: Vec<String>,
        error_groups: Vec<String>,
        panic_groups: Vec<String>,
        hang: bool,
    }

    impl ScriptedTransport {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GroupTransport for ScriptedTransport {
        async fn add_to_group(&self, _: &str, _: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_to_group(&self, group: &str, _: &ServerMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(group.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.panic_groups.iter().any(|g| g == group) {
                panic!("transport bug");
            }
            if self.timeout_groups.iter().any(|g| g == group) {
                return Err(TransportError::Timeout(Duration::from_secs(1)));
            }
            if self.error_groups.iter().any(|g| g == group) {
                return Err(TransportError::Closed(group.to_string()));
            }
            Ok(())
        }

        async fn send_to_all(&self, _: &ServerMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push("*".to_string());
            Ok(())
        }

        async fn send_to_all_except(
            &self,
            _: &ServerMessage,
            excluded: &[String],
        ) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push(format!("* except {}", excluded.join(",")));
            Ok(())
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new("OrderPlaced", json!({"order_id": 1}))
    }

    fn rsns(n: usize) -> Vec<UserRsn> {
        (0..n).map(|_| UserRsn::new(Uuid::new_v4())).collect()
    }

    #[tokio::test]
    async fn test_every_target_attempted_despite_failures() {
        let ids = rsns(4);
        let transport = Arc::new(ScriptedTransport {
            timeout_groups: vec![user_rsn_group(&ids[0])],
            error_groups: vec![user_rsn_group(&ids[1])],
            panic_groups: vec![user_rsn_group(&ids[2])],
            ..Default::default()
        });
        let dispatcher = FanOutDispatcher::new(transport.clone());

        let outcome = dispatcher
            .send_to_identities(&event(), &ids, Envelope::Raw)
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcome, DispatchOutcome::Completed { attempted: 4 });
        let expected: Vec<String> = ids.iter().map(user_rsn_group).collect();
        assert_eq!(transport.sent(), expected);

        let stats = dispatcher.stats();
        assert_eq!(stats.deliveries_succeeded, 1);
        assert_eq!(stats.deliveries_timed_out, 1);
        assert_eq!(stats.deliveries_failed, 2);
    }

    #[tokio::test]
    async fn test_empty_identities_send_nothing() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::new(transport.clone());

        let outcome = dispatcher
            .send_to_identities(&event(), &[], Envelope::Raw)
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcome, DispatchOutcome::Completed { attempted: 0 });
        assert!(transport.sent().is_empty());
        assert_eq!(dispatcher.stats().dispatches_scheduled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_hanging_dispatch() {
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let dispatcher = FanOutDispatcher::new(transport.clone());
        let started = Instant::now();

        let outcome = dispatcher
            .send_to_identities(&event(), &rsns(100), Envelope::Raw)
            .unwrap()
            .wait()
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::DeadlineExceeded {
                attempted: 1,
                total: 100
            }
        );
        assert!(started.elapsed() >= DEFAULT_DISPATCH_DEADLINE);
        assert!(started.elapsed() < DEFAULT_DISPATCH_DEADLINE + Duration::from_secs(1));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(dispatcher.stats().dispatches_abandoned, 1);
    }

    #[tokio::test]
    async fn test_token_is_normalized() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::new(transport.clone());

        dispatcher
            .send_to_token(&event(), "ab.cd", Envelope::Typed)
            .unwrap()
            .wait()
            .await;

        assert_eq!(transport.sent(), vec!["User-abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::new(transport.clone());

        let blank = DomainEvent::new("  ", json!({}));
        assert!(dispatcher.send_to_all(&blank, Envelope::Typed).is_err());
        assert!(dispatcher.send_to_token(&event(), "..", Envelope::Typed).is_err());
        assert!(dispatcher
            .send_to_all_except_token(&event(), "", Envelope::Typed)
            .is_err());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_except_token_disabled_by_default() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::new(transport.clone());

        let outcome = dispatcher
            .send_to_all_except_token(&event(), "abcd", Envelope::Typed)
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_except_token_excludes_group_when_enabled() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::with_config(
            transport.clone(),
            DispatcherConfig {
                except_token_mode: ExceptTokenMode::ExcludeToken,
                ..Default::default()
            },
        );

        dispatcher
            .send_to_all_except_token(&event(), "abcd", Envelope::Typed)
            .unwrap()
            .wait()
            .await;

        assert_eq!(transport.sent(), vec!["* except User-abcd".to_string()]);
    }

    #[test]
    fn test_without_runtime_nothing_is_scheduled() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = FanOutDispatcher::new(transport.clone());

        let handle = dispatcher
            .send_to_token(&event(), "abcd", Envelope::Typed)
            .unwrap();

        assert!(handle.is_finished());
        assert!(matches!(
            handle.state,
            HandleState::Ready(DispatchOutcome::NotScheduled)
        ));
        assert_eq!(dispatcher.stats().scheduling_failures, 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_correlation_id_reaches_transport() {
        struct CapturingTransport(Mutex<Option<CorrelationId>>);

        #[async_trait]
        impl GroupTransport for CapturingTransport {
            async fn add_to_group(&self, _: &str, _: &str) -> Result<(), TransportError> {
                Ok(())
            }
            async fn send_to_group(&self, _: &str, _: &ServerMessage) -> Result<(), TransportError> {
                *self.0.lock().unwrap() = CorrelationId::current();
                Ok(())
            }
            async fn send_to_all(&self, _: &ServerMessage) -> Result<(), TransportError> {
                Ok(())
            }
            async fn send_to_all_except(
                &self,
                _: &ServerMessage,
                _: &[String],
            ) -> Result<(), TransportError> {
                Ok(())
            }
        }

        let transport = Arc::new(CapturingTransport(Mutex::new(None)));
        let dispatcher = FanOutDispatcher::new(transport.clone());
        let id = CorrelationId::new();

        let handle = correlation::sync_scope(id, || {
            dispatcher.send_to_token(&event(), "abcd", Envelope::Typed)
        })
        .unwrap();
        handle.wait().await;

        assert_eq!(*transport.0.lock().unwrap(), Some(id));
    }

    #[test]
    fn test_legacy_envelopes() {
        assert_eq!(DispatchMode::Identities.legacy_envelope(), Envelope::Raw);
        assert_eq!(DispatchMode::Token.legacy_envelope(), Envelope::Typed);
        assert_eq!(DispatchMode::All.legacy_envelope(), Envelope::Typed);
        assert_eq!(DispatchMode::AllExceptToken.legacy_envelope(), Envelope::Typed);
    }
}
