//! Notification hub: connection registration and event fan-out.
//!
//! # Components
//!
//! - `MembershipRegistrar`: puts a connection into its `User-<token>` group and,
//!   when an identity resolver is installed, its `UserRsn-<identity>` group
//! - `FanOutDispatcher`: delivers events to groups from a detached task bounded
//!   by a shared deadline
//! - `NotificationHub`: facade wiring both to one transport, the entry point for
//!   connection lifecycle events and producers
//!
//! Every operation returns to the caller without waiting on the transport.

mod dispatcher;
mod groups;
mod identity;
mod message;
mod registrar;

use std::sync::Arc;

use crate::error::RelayError;
use crate::metrics::MembershipMetrics;
use crate::transport::GroupTransport;

pub use dispatcher::{
    DispatchHandle, DispatchMode, DispatchOutcome, DispatcherConfig, DispatcherStats,
    DispatcherStatsSnapshot, ExceptTokenMode, FanOutDispatcher, DEFAULT_DISPATCH_DEADLINE,
};
pub use groups::{
    normalize_token, user_group, user_rsn_group, USER_GROUP_PREFIX, USER_RSN_GROUP_PREFIX,
};
pub use identity::{IdentityError, IdentityResolver, StaticIdentityResolver, UserRsn};
pub use message::{DomainEvent, Envelope, EventBuilder, ServerMessage};
pub use registrar::{JoinOutcome, MembershipRegistrar};

/// Entry point for connection lifecycle events and event producers
pub struct NotificationHub {
    registrar: MembershipRegistrar,
    dispatcher: FanOutDispatcher,
}

impl NotificationHub {
    pub fn new(transport: Arc<dyn GroupTransport>, config: DispatcherConfig) -> Self {
        Self {
            registrar: MembershipRegistrar::new(transport.clone()),
            dispatcher: FanOutDispatcher::with_config(transport, config),
        }
    }

    /// Install an identity resolver, enabling `UserRsn-` group registration
    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.registrar.set_identity_resolver(resolver);
        self
    }

    pub fn set_identity_resolver(&mut self, resolver: Arc<dyn IdentityResolver>) {
        self.registrar.set_identity_resolver(resolver);
    }

    pub fn registrar(&self) -> &MembershipRegistrar {
        &self.registrar
    }

    pub fn dispatcher(&self) -> &FanOutDispatcher {
        &self.dispatcher
    }

    /// A new connection was established
    pub async fn on_connected(
        &self,
        connection_id: &str,
        credential: &str,
    ) -> Result<JoinOutcome, RelayError> {
        MembershipMetrics::record_connected();
        self.registrar.join(connection_id, credential).await
    }

    /// An existing connection came back; registration is repeated as-is
    pub async fn on_reconnected(
        &self,
        connection_id: &str,
        credential: &str,
    ) -> Result<JoinOutcome, RelayError> {
        MembershipMetrics::record_reconnected();
        self.registrar.join(connection_id, credential).await
    }

    pub fn send_to_identities(
        &self,
        event: &DomainEvent,
        user_rsns: &[UserRsn],
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        self.dispatcher.send_to_identities(event, user_rsns, envelope)
    }

    pub fn send_to_token(
        &self,
        event: &DomainEvent,
        user_token: &str,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        self.dispatcher.send_to_token(event, user_token, envelope)
    }

    pub fn send_to_all(
        &self,
        event: &DomainEvent,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        self.dispatcher.send_to_all(event, envelope)
    }

    pub fn send_to_all_except_token(
        &self,
        event: &DomainEvent,
        user_token: &str,
        envelope: Envelope,
    ) -> Result<DispatchHandle, RelayError> {
        self.dispatcher
            .send_to_all_except_token(event, user_token, envelope)
    }
}
