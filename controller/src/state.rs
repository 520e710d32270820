//! Application state
//!
//! One `AppState` is assembled at startup: store, bus, keypair, and the
//! reconcilers wired over them. Handler and listener registration happens
//! here, before the server accepts its first connection, so the bus
//! registries are effectively immutable once traffic flows.

use std::sync::Arc;

use crate::authproxy::AuthProxyReconciler;
use crate::bus::{AgentBus, HEALTHCHECK_STATUS};
use crate::config::Config;
use crate::dns::DnsReconciler;
use crate::health::HealthIngestor;
use crate::keys::JwtKeys;
use crate::store::Store;
use crate::sync::SyncService;

/// Shared state handed to every handler and the agent connection layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<AgentBus>,
    pub keys: Arc<JwtKeys>,
    pub dns: Arc<DnsReconciler>,
    pub auth_proxy: Arc<AuthProxyReconciler>,
}

impl AppState {
    /// Assemble the state and register the inbound handlers and connect
    /// listeners on the bus.
    pub async fn new(config: Config, store: Arc<dyn Store>, keys: JwtKeys) -> Self {
        let config = Arc::new(config);
        let keys = Arc::new(keys);
        let bus = Arc::new(AgentBus::new(config.bus.queue_capacity));

        let dns = Arc::new(DnsReconciler::new(store.clone(), bus.clone()));
        let auth_proxy = Arc::new(AuthProxyReconciler::new(
            store.clone(),
            bus.clone(),
            keys.clone(),
            config.clone(),
        ));

        let ingestor = Arc::new(HealthIngestor::new(store.clone(), dns.clone()));
        bus.register_handler(HEALTHCHECK_STATUS, ingestor).await;

        let sync = Arc::new(SyncService::new(
            store.clone(),
            bus.clone(),
            dns.clone(),
            auth_proxy.clone(),
            config.gerbil.clients_start_port,
        ));
        bus.register_connect_listener(sync).await;

        Self {
            config,
            store,
            bus,
            keys,
            dns,
            auth_proxy,
        }
    }
}
