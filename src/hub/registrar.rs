use std::sync::Arc;

use serde::Serialize;

use crate::error::RelayError;
use crate::metrics::MembershipMetrics;
use crate::transport::GroupTransport;

use super::groups::{normalize_token, user_group, user_rsn_group};
use super::identity::{IdentityError, IdentityResolver, UserRsn};
use super::message::ServerMessage;

/// Groups a connection ended up in after a join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    /// Normalized user token
    pub user_token: String,
    /// Groups the connection was successfully added to, in registration order
    pub groups: Vec<String>,
    /// Identity resolved from the token, if a resolver is installed and succeeded
    pub user_rsn: Option<UserRsn>,
}

/// Registers live connections into recipient groups
pub struct MembershipRegistrar {
    transport: Arc<dyn GroupTransport>,
    identity_resolver: Option<Arc<dyn IdentityResolver>>,
}

impl MembershipRegistrar {
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            transport,
            identity_resolver: None,
        }
    }

    pub fn with_identity_resolver(
        transport: Arc<dyn GroupTransport>,
        identity_resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            transport,
            identity_resolver: Some(identity_resolver),
        }
    }

    /// Set the identity resolver (for deferred initialization)
    pub fn set_identity_resolver(&mut self, identity_resolver: Arc<dyn IdentityResolver>) {
        self.identity_resolver = Some(identity_resolver);
    }

    pub fn has_identity_resolver(&self) -> bool {
        self.identity_resolver.is_some()
    }

    /// Register `connection_id` under the groups derived from `credential`.
    ///
    /// Safe to call again on reconnect. Transport and resolver failures are
    /// logged and never returned; only an unusable credential is an error.
    #[tracing::instrument(
        name = "registrar.join",
        skip(self, credential),
        fields(connection_id = %connection_id)
    )]
    pub async fn join(&self, connection_id: &str, credential: &str) -> Result<JoinOutcome, RelayError> {
        if connection_id.is_empty() {
            return Err(RelayError::invalid_argument("connection id must not be empty"));
        }

        let user_token = normalize_token(credential);
        if user_token.is_empty() {
            return Err(RelayError::invalid_argument(
                "credential is empty after normalization",
            ));
        }

        let mut outcome = JoinOutcome {
            user_token: user_token.clone(),
            ..Default::default()
        };

        let group = user_group(&user_token);
        let ack = ServerMessage::registered(format!("User: {}", user_token));
        if self.register(connection_id, &group, &ack).await {
            outcome.groups.push(group);
        }

        let Some(resolver) = &self.identity_resolver else {
            return Ok(outcome);
        };

        match resolve_identity(resolver.clone(), user_token.clone()).await {
            Ok(user_rsn) => {
                let group = user_rsn_group(&user_rsn);
                let ack = ServerMessage::registered(format!("UserRsn: {}", user_rsn));
                if self.register(connection_id, &group, &ack).await {
                    outcome.groups.push(group);
                    outcome.user_rsn = Some(user_rsn);
                }
            }
            Err(e) => {
                MembershipMetrics::record_identity_failure();
                tracing::warn!(
                    user_token = %user_token,
                    error = %e,
                    "Registering user token to a user RSN and into its group failed"
                );
            }
        }

        Ok(outcome)
    }

    /// Add the connection to `group` and acknowledge it to the group.
    ///
    /// Returns whether the connection is now a member.
    async fn register(&self, connection_id: &str, group: &str, ack: &ServerMessage) -> bool {
        if let Err(e) = self.transport.add_to_group(connection_id, group).await {
            MembershipMetrics::record_registration_failure();
            tracing::error!(
                connection_id = %connection_id,
                group = %group,
                error = %e,
                "Adding connection to group failed"
            );
            return false;
        }

        if let Err(e) = self.transport.send_to_group(group, ack).await {
            tracing::warn!(
                group = %group,
                error = %e,
                "Sending registration acknowledgement failed"
            );
        }

        tracing::debug!(connection_id = %connection_id, group = %group, "Connection registered in group");
        true
    }
}

/// Run a resolver on the blocking pool.
///
/// Resolvers may block or panic; both end up as a lookup failure.
async fn resolve_identity(
    resolver: Arc<dyn IdentityResolver>,
    user_token: String,
) -> Result<UserRsn, IdentityError> {
    tokio::task::spawn_blocking(move || resolver.resolve(&user_token))
        .await
        .unwrap_or_else(|e| Err(IdentityError::Lookup(format!("resolver aborted: {}", e))))
}
