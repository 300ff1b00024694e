use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::hub::ServerMessage;

use super::{GroupTransport, TransportError};

/// Handle for a single live connection
pub struct ConnectionHandle {
    pub id: String,
    sender: mpsc::Sender<Arc<str>>,
}

impl ConnectionHandle {
    fn new(id: String, sender: mpsc::Sender<Arc<str>>) -> Self {
        Self { id, sender }
    }

    /// Queue a pre-serialized frame, waiting at most `timeout` for buffer space
    async fn send(&self, frame: Arc<str>, timeout: Duration) -> Result<(), TransportError> {
        match self.sender.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(TransportError::Timeout(timeout)),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(TransportError::Closed(self.id.clone()))
            }
        }
    }
}

/// In-process connection registry with a group index
pub struct InMemoryGroupTransport {
    /// connection_id -> ConnectionHandle
    connections: DashMap<String, Arc<ConnectionHandle>>,
    /// group -> Set<connection_id>
    group_index: DashMap<String, HashSet<String>>,
    send_timeout: Duration,
}

impl InMemoryGroupTransport {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            group_index: DashMap::new(),
            send_timeout,
        }
    }

    /// Attach a connection.
    ///
    /// Reusing the id of a live connection replaces its sender and drops every
    /// group membership of the previous holder. The new holder only gets the
    /// groups its own join registers.
    pub fn connect(
        &self,
        connection_id: String,
        sender: mpsc::Sender<Arc<str>>,
    ) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(connection_id.clone(), sender));
        let replaced = self
            .connections
            .insert(connection_id.clone(), handle.clone())
            .is_some();

        if replaced {
            self.leave_all_groups(&connection_id);
        }

        tracing::info!(connection_id = %connection_id, replaced, "Connection attached");

        handle
    }

    /// Detach a connection and drop it from every group.
    ///
    /// No-op if the id has since been taken over by a newer handle.
    pub fn disconnect(&self, handle: &Arc<ConnectionHandle>) {
        let removed = self
            .connections
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if !removed {
            return;
        }

        self.leave_all_groups(&handle.id);

        tracing::info!(connection_id = %handle.id, "Connection detached");
    }

    fn leave_all_groups(&self, connection_id: &str) {
        for mut entry in self.group_index.iter_mut() {
            entry.value_mut().remove(connection_id);
        }
        self.group_index.retain(|_, members| !members.is_empty());
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Members of a group, sorted
    pub fn group_members(&self, group: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .group_index
            .get(group)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Groups a connection belongs to, sorted
    pub fn groups_of(&self, connection_id: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .group_index
            .iter()
            .filter(|entry| entry.value().contains(connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        groups.sort();
        groups
    }

    /// Aggregate counts. Group names embed user tokens, so only their
    /// prefixes are reported.
    pub fn stats(&self) -> TransportStats {
        let mut groups_by_prefix: HashMap<String, usize> = HashMap::new();
        for entry in self.group_index.iter() {
            *groups_by_prefix
                .entry(group_prefix(entry.key()).to_string())
                .or_default() += 1;
        }

        TransportStats {
            total_connections: self.connections.len(),
            total_groups: self.group_index.len(),
            groups_by_prefix,
        }
    }

    /// Send one message to a set of connections concurrently.
    ///
    /// Every connection is attempted; the first failure is reported after all
    /// attempts finished.
    async fn deliver(
        &self,
        connection_ids: Vec<String>,
        message: &ServerMessage,
    ) -> Result<(), TransportError> {
        if connection_ids.is_empty() {
            return Ok(());
        }

        // Serialize once and share across all connections
        let frame: Arc<str> = serde_json::to_string(message)
            .map_err(|e| TransportError::Rejected(e.to_string()))?
            .into();

        let handles: Vec<Arc<ConnectionHandle>> = connection_ids
            .iter()
            .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
            .collect();

        let results = join_all(
            handles
                .iter()
                .map(|handle| handle.send(frame.clone(), self.send_timeout)),
        )
        .await;

        let mut failed = 0;
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => {
                tracing::debug!(
                    method = message.method(),
                    total = handles.len(),
                    failed,
                    "Delivery failed for some connections"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl GroupTransport for InMemoryGroupTransport {
    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), TransportError> {
        if !self.connections.contains_key(connection_id) {
            return Err(TransportError::Rejected(format!(
                "unknown connection {}",
                connection_id
            )));
        }

        self.group_index
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());

        tracing::debug!(connection_id = %connection_id, group = %group, "Added connection to group");
        Ok(())
    }

    async fn send_to_group(
        &self,
        group: &str,
        message: &ServerMessage,
    ) -> Result<(), TransportError> {
        let members = self.group_members(group);
        self.deliver(members, message).await
    }

    async fn send_to_all(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let all: Vec<String> = self.connections.iter().map(|r| r.key().clone()).collect();
        self.deliver(all, message).await
    }

    async fn send_to_all_except(
        &self,
        message: &ServerMessage,
        excluded_groups: &[String],
    ) -> Result<(), TransportError> {
        let excluded: HashSet<String> = excluded_groups
            .iter()
            .flat_map(|group| self.group_members(group))
            .collect();

        let recipients: Vec<String> = self
            .connections
            .iter()
            .map(|r| r.key().clone())
            .filter(|id| !excluded.contains(id))
            .collect();

        self.deliver(recipients, message).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub total_connections: usize,
    pub total_groups: usize,
    /// Group count keyed by name prefix, e.g. `User-`
    pub groups_by_prefix: HashMap<String, usize>,
}

/// `"User-abcd"` -> `"User-"`; names without a `-` are reported as `other`
fn group_prefix(group: &str) -> &str {
    match group.find('-') {
        Some(end) => &group[..=end],
        None => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> InMemoryGroupTransport {
        InMemoryGroupTransport::new(Duration::from_millis(50))
    }

    fn frame_json(frame: Arc<str>) -> serde_json::Value {
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_add_to_group_is_idempotent() {
        let transport = transport();
        let (tx, _rx) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx);

        transport.add_to_group("c1", "User-abcd").await.unwrap();
        transport.add_to_group("c1", "User-abcd").await.unwrap();

        assert_eq!(transport.group_members("User-abcd"), vec!["c1".to_string()]);
        assert_eq!(transport.groups_of("c1"), vec!["User-abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_add_unknown_connection_rejected() {
        let transport = transport();
        let result = transport.add_to_group("ghost", "User-abcd").await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_send_to_group_reaches_members_only() {
        let transport = transport();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx1);
        transport.connect("c2".to_string(), tx2);
        transport.add_to_group("c1", "User-a").await.unwrap();
        transport.add_to_group("c2", "User-b").await.unwrap();

        transport
            .send_to_group("User-a", &ServerMessage::registered("User: a"))
            .await
            .unwrap();

        let frame = frame_json(rx1.recv().await.unwrap());
        assert_eq!(frame["method"], "registered");
        assert_eq!(frame["payload"], "User: a");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_empty_group_is_noop() {
        let transport = transport();
        let result = transport
            .send_to_group("User-nobody", &ServerMessage::registered("x"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_all_except_skips_excluded_group() {
        let transport = transport();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx1);
        transport.connect("c2".to_string(), tx2);
        transport.add_to_group("c1", "User-a").await.unwrap();

        transport
            .send_to_all_except(
                &ServerMessage::notify_event(serde_json::json!({"n": 1})),
                &["User-a".to_string()],
            )
            .await
            .unwrap();

        assert!(rx1.try_recv().is_err());
        assert_eq!(frame_json(rx2.recv().await.unwrap())["payload"]["n"], 1);
    }

    #[tokio::test]
    async fn test_full_buffer_times_out_but_others_receive() {
        let transport = transport();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        transport.connect("slow".to_string(), slow_tx);
        transport.connect("fast".to_string(), fast_tx);

        let message = ServerMessage::registered("hello");
        transport.send_to_all(&message).await.unwrap();
        let result = transport.send_to_all(&message).await;

        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(fast_rx.recv().await.is_some());
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_connection_reported() {
        let transport = transport();
        let (tx, rx) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx);
        drop(rx);

        let result = transport.send_to_all(&ServerMessage::registered("x")).await;
        assert_eq!(result, Err(TransportError::Closed("c1".to_string())));
    }

    #[tokio::test]
    async fn test_disconnect_removes_memberships() {
        let transport = transport();
        let (tx, _rx) = mpsc::channel(8);
        let handle = transport.connect("c1".to_string(), tx);
        transport.add_to_group("c1", "User-a").await.unwrap();

        transport.disconnect(&handle);

        assert!(!transport.contains("c1"));
        assert!(transport.group_members("User-a").is_empty());
        assert_eq!(transport.stats().total_groups, 0);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_replacement() {
        let transport = transport();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let old = transport.connect("c1".to_string(), tx1);
        transport.add_to_group("c1", "User-a").await.unwrap();
        let _new = transport.connect("c1".to_string(), tx2);
        transport.add_to_group("c1", "User-a").await.unwrap();

        transport.disconnect(&old);

        assert!(transport.contains("c1"));
        assert_eq!(transport.groups_of("c1"), vec!["User-a".to_string()]);
    }

    #[tokio::test]
    async fn test_replacing_connection_drops_previous_memberships() {
        let transport = transport();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx1);
        transport.add_to_group("c1", "User-alice").await.unwrap();

        transport.connect("c1".to_string(), tx2);
        transport.add_to_group("c1", "User-bob").await.unwrap();

        assert_eq!(transport.groups_of("c1"), vec!["User-bob".to_string()]);
        let message = ServerMessage::notify_event(serde_json::json!({"for": "alice"}));
        transport.send_to_group("User-alice", &message).await.unwrap();
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_report_prefixes_not_names() {
        let transport = transport();
        let (tx, _rx) = mpsc::channel(8);
        transport.connect("c1".to_string(), tx);
        transport.add_to_group("c1", "User-secret").await.unwrap();
        transport.add_to_group("c1", "UserRsn-42").await.unwrap();
        transport.add_to_group("c1", "lobby").await.unwrap();

        let stats = transport.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.total_groups, 3);
        assert_eq!(stats.groups_by_prefix.get("User-"), Some(&1));
        assert_eq!(stats.groups_by_prefix.get("UserRsn-"), Some(&1));
        assert_eq!(stats.groups_by_prefix.get("other"), Some(&1));

        let body = serde_json::to_string(&stats).unwrap();
        assert!(!body.contains("secret"));
    }
}
