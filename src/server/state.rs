use std::sync::Arc;

use crate::config::Settings;
use crate::hub::{NotificationHub, StaticIdentityResolver};
use crate::transport::InMemoryGroupTransport;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub transport: Arc<InMemoryGroupTransport>,
    pub hub: Arc<NotificationHub>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let transport = Arc::new(InMemoryGroupTransport::new(settings.send_timeout()));
        let mut hub = NotificationHub::new(transport.clone(), settings.dispatcher_config());

        if !settings.identity.mappings.is_empty() {
            let resolver = StaticIdentityResolver::from_mappings(&settings.identity.mappings);
            tracing::info!(mappings = resolver.len(), "Static identity resolver installed");
            hub.set_identity_resolver(Arc::new(resolver));
        }

        Self {
            settings: Arc::new(settings),
            transport,
            hub: Arc::new(hub),
        }
    }
}
