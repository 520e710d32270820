//! Agent sync / bootstrap
//!
//! When an agent (re)connects, the controller rebuilds the agent's view from
//! persistent state and pushes it: a connecting Olm gets an `olm/sync`
//! snapshot per client followed by the zones its sites serve; a connecting
//! Newt gets the auth-proxy config for its site. Push failures are logged and
//! swallowed, the agent resyncs on its next reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::authproxy::AuthProxyReconciler;
use crate::bus::{AgentBus, AgentKind, AgentMessage, ConnectListener, OLM_SYNC};
use crate::dns::DnsReconciler;
use crate::error::Result;
use crate::model::{ExitNode, Site};
use crate::store::Store;

/// `olm/sync` payload: the sites a client peers with and the exit nodes
/// relaying them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OlmSyncPayload {
    pub sites: Vec<OlmSiteConfig>,
    pub exit_nodes: Vec<ExitNodeConfig>,
}

/// Site summary carried in `olm/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OlmSiteConfig {
    pub site_id: i64,
    pub name: String,
    pub nice_id: String,
    pub public_ip: Option<String>,
    pub server_public_ip: Option<String>,
    pub exit_node_id: Option<i64>,
}

/// Exit-node summary carried in `olm/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitNodeConfig {
    pub public_key: String,
    pub relay_port: u16,
    pub endpoint: String,
    pub site_ids: Vec<i64>,
}

/// Assemble the sync payload for one client's site set.
pub fn build_olm_sync_payload(
    sites: &[Site],
    exit_nodes: &[ExitNode],
    relay_port: u16,
) -> OlmSyncPayload {
    let site_configs = sites
        .iter()
        .map(|site| OlmSiteConfig {
            site_id: site.site_id,
            name: site.name.clone(),
            nice_id: site.nice_id.clone(),
            public_ip: site.public_ip.clone(),
            server_public_ip: site.server_public_ip.clone(),
            exit_node_id: site.exit_node_id,
        })
        .collect();

    let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for site in sites {
        if let Some(exit_node_id) = site.exit_node_id {
            grouped.entry(exit_node_id).or_default().push(site.site_id);
        }
    }
    let exit_node_configs = exit_nodes
        .iter()
        .filter_map(|node| {
            let site_ids = grouped.get(&node.exit_node_id)?.clone();
            Some(ExitNodeConfig {
                public_key: node.public_key.clone(),
                relay_port,
                endpoint: node.endpoint.clone(),
                site_ids,
            })
        })
        .collect();

    OlmSyncPayload {
        sites: site_configs,
        exit_nodes: exit_node_configs,
    }
}

/// Connect listener rebuilding agent views at (re)connect time.
pub struct SyncService {
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
    dns: Arc<DnsReconciler>,
    auth_proxy: Arc<AuthProxyReconciler>,
    clients_start_port: u16,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<AgentBus>,
        dns: Arc<DnsReconciler>,
        auth_proxy: Arc<AuthProxyReconciler>,
        clients_start_port: u16,
    ) -> Self {
        Self {
            store,
            bus,
            dns,
            auth_proxy,
            clients_start_port,
        }
    }

    async fn bootstrap_newt(&self, newt_id: &str) -> Result<()> {
        let Some(newt) = self.store.newt(newt_id).await? else {
            tracing::warn!(newt_id, "connected newt is not registered");
            return Ok(());
        };
        let Some(site_id) = newt.site_id else {
            tracing::debug!(newt_id, "connected newt has no site yet");
            return Ok(());
        };
        self.auth_proxy.update_auth_proxy_for_site(site_id).await
    }

    async fn bootstrap_olm(&self, olm_id: &str) -> Result<()> {
        let clients = self.store.clients_for_olm(olm_id).await?;
        if clients.is_empty() {
            tracing::debug!(olm_id, "connected olm has no clients");
            return Ok(());
        }

        for client in clients {
            let sites = self.store.sites_for_client(client.client_id).await?;

            let mut exit_node_ids: Vec<i64> =
                sites.iter().filter_map(|s| s.exit_node_id).collect();
            exit_node_ids.sort_unstable();
            exit_node_ids.dedup();
            let mut exit_nodes = Vec::with_capacity(exit_node_ids.len());
            for exit_node_id in exit_node_ids {
                if let Some(node) = self.store.exit_node(exit_node_id).await? {
                    exit_nodes.push(node);
                }
            }

            let payload = build_olm_sync_payload(&sites, &exit_nodes, self.clients_start_port);
            let message = AgentMessage::new(OLM_SYNC, &payload)?;
            self.bus.send(olm_id, message).await;

            self.dns
                .send_dns_authority_zones_to_olm(olm_id, client.client_id)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectListener for SyncService {
    async fn agent_connected(&self, kind: AgentKind, agent_id: &str) {
        let result = match kind {
            AgentKind::Newt => self.bootstrap_newt(agent_id).await,
            AgentKind::Olm => self.bootstrap_olm(agent_id).await,
        };
        if let Err(e) = result {
            tracing::warn!(agent_id, kind = %kind, error = %e, "agent bootstrap failed");
        }
    }
}
