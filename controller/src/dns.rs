//! DNS-authority reconciler
//!
//! Rebuilds the zone configuration of a resource from a relational snapshot
//! and pushes it to every agent that answers for the zone: the Newts on the
//! resource's DNS-authority sites and the Olms whose clients peer with those
//! sites. Every push is a full snapshot, so a lost message is recovered by
//! the next reconciliation or the agent's reconnect-time resync.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::{AgentBus, AgentMessage, NEWT_DNS_AUTHORITY_CONFIG, OLM_DNS_AUTHORITY_CONFIG};
use crate::error::Result;
use crate::model::{Resource, RoutingPolicy, DEFAULT_TARGET_PRIORITY, DEFAULT_ZONE_TTL};
use crate::store::{ResourceTargetView, Store};

/// Verb carried by a zone-config message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsAction {
    Update,
    Remove,
    Start,
    Stop,
}

/// One answer candidate inside a zone. The `ip` is always the site's public
/// address, never the target's internal one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneTarget {
    pub ip: String,
    pub priority: i32,
    pub healthy: bool,
    pub site_id: i64,
    pub site_name: String,
}

/// The state an agent needs to answer DNS for one resource's domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub enabled: bool,
    pub domain: String,
    pub ttl: i64,
    pub routing_policy: RoutingPolicy,
    pub targets: Vec<ZoneTarget>,
}

/// `{action: "update", zones: [...]}` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneUpdatePayload {
    pub action: DnsAction,
    pub zones: Vec<ZoneConfig>,
}

/// `{action: "remove", zones: [{domain}]}` payload. Only the domain is
/// meaningful on remove; agents ignore anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRemovePayload {
    pub action: DnsAction,
    pub zones: Vec<ZoneRemoval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRemoval {
    pub domain: String,
}

/// Build the zone config for a resource from its target rows.
///
/// Returns `None` when the resource no longer has an answerable zone: DNS
/// authority disabled, no domain, or no retained target. `None` means
/// *remove* to the dispatch path.
///
/// A target is retained iff it is enabled, its site has DNS authority
/// enabled, and the site has a public IP. Health only clears the `healthy`
/// flag; it never removes a target from the zone.
pub fn build_zone_config(resource: &Resource, rows: &[ResourceTargetView]) -> Option<ZoneConfig> {
    if !resource.dns_authority_enabled {
        return None;
    }
    let domain = resource.full_domain.as_deref()?;

    let mut rows: Vec<&ResourceTargetView> = rows.iter().collect();
    rows.sort_by_key(|r| {
        (
            r.target.priority.unwrap_or(DEFAULT_TARGET_PRIORITY),
            r.target.target_id,
        )
    });

    let mut targets = Vec::new();
    for row in rows {
        if !row.target.enabled || !row.site.dns_authority_enabled {
            continue;
        }
        let Some(ip) = row.site.public_ip.clone() else {
            continue;
        };
        targets.push(ZoneTarget {
            ip,
            priority: row.target.priority.unwrap_or(DEFAULT_TARGET_PRIORITY),
            healthy: if row.health.hc_enabled {
                row.health.hc_health == crate::model::HcHealth::Healthy
            } else {
                true
            },
            site_id: row.site.site_id,
            site_name: row.site.name.clone(),
        });
    }

    if targets.is_empty() {
        return None;
    }

    Some(ZoneConfig {
        enabled: true,
        domain: domain.to_string(),
        ttl: resource.dns_authority_ttl.unwrap_or(DEFAULT_ZONE_TTL),
        routing_policy: resource.dns_authority_routing_policy.unwrap_or_default(),
        targets,
    })
}

/// Reconciles zone configuration for resources and dispatches it to the
/// affected agents.
pub struct DnsReconciler {
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
}

impl DnsReconciler {
    pub fn new(store: Arc<dyn Store>, bus: Arc<AgentBus>) -> Self {
        Self { store, bus }
    }

    /// Rebuild the resource's zone and push it (or its removal) to the
    /// current recipient set. Idempotent: with unchanged state, back-to-back
    /// calls emit identical messages.
    pub async fn update_dns_authority_for_resource(&self, resource_id: i64) -> Result<()> {
        let Some(resource) = self.store.resource(resource_id).await? else {
            tracing::debug!(resource_id, "resource gone, skipping zone update");
            return Ok(());
        };
        let rows = self.store.resource_targets(resource_id).await?;

        match build_zone_config(&resource, &rows) {
            Some(zone) => {
                let site_ids = retained_site_ids(&rows, true);
                self.dispatch_update(&resource, zone, &site_ids).await
            }
            None => {
                let Some(domain) = resource.full_domain.clone() else {
                    // Nothing to address a removal to.
                    return Ok(());
                };
                // Last-known recipients: the site-level filter applied to
                // every target row, enabled or not, so agents told about the
                // zone before its targets were disabled still hear the
                // removal. Fully detached resources degrade to best-effort.
                let site_ids = retained_site_ids(&rows, false);
                self.dispatch_remove(&resource, domain, &site_ids).await
            }
        }
    }

    /// Collapse a batch of health-changed targets to the distinct
    /// DNS-authority resources they serve and rebuild each once.
    pub async fn on_health_check_update(&self, target_ids: &[i64]) -> Result<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let resource_ids = self.store.dns_resources_for_targets(target_ids).await?;
        for resource_id in resource_ids {
            self.update_dns_authority_for_resource(resource_id).await?;
        }
        Ok(())
    }

    /// Push every zone the Olm's client should serve in one update message.
    /// Used at Olm (re)connect.
    pub async fn send_dns_authority_zones_to_olm(
        &self,
        olm_id: &str,
        client_id: i64,
    ) -> Result<()> {
        let sites = self.store.sites_for_client(client_id).await?;
        let site_ids: Vec<i64> = sites
            .iter()
            .filter(|s| s.dns_authority_enabled && s.public_ip.is_some())
            .map(|s| s.site_id)
            .collect();
        if site_ids.is_empty() {
            return Ok(());
        }

        let resource_ids = self.store.dns_resources_on_sites(&site_ids).await?;
        let mut zones = Vec::new();
        for resource_id in resource_ids {
            let Some(resource) = self.store.resource(resource_id).await? else {
                continue;
            };
            let rows = self.store.resource_targets(resource_id).await?;
            if let Some(zone) = build_zone_config(&resource, &rows) {
                zones.push(zone);
            }
        }
        if zones.is_empty() {
            return Ok(());
        }

        let zone_count = zones.len();
        let payload = ZoneUpdatePayload {
            action: DnsAction::Update,
            zones,
        };
        let message = AgentMessage::new(OLM_DNS_AUTHORITY_CONFIG, &payload)?;
        self.bus.send(olm_id, message).await;
        tracing::debug!(olm_id, zones = zone_count, "pushed zone bootstrap to olm");
        Ok(())
    }

    async fn dispatch_update(
        &self,
        resource: &Resource,
        zone: ZoneConfig,
        site_ids: &[i64],
    ) -> Result<()> {
        let payload = ZoneUpdatePayload {
            action: DnsAction::Update,
            zones: vec![zone],
        };
        self.fan_out(resource, &payload, site_ids).await
    }

    async fn dispatch_remove(
        &self,
        resource: &Resource,
        domain: String,
        site_ids: &[i64],
    ) -> Result<()> {
        let payload = ZoneRemovePayload {
            action: DnsAction::Remove,
            zones: vec![ZoneRemoval { domain }],
        };
        self.fan_out(resource, &payload, site_ids).await
    }

    /// Send one payload to the Newt and Olm recipient sets derived from
    /// `site_ids`.
    async fn fan_out<T: Serialize>(
        &self,
        resource: &Resource,
        payload: &T,
        site_ids: &[i64],
    ) -> Result<()> {
        let newt_message = AgentMessage::new(NEWT_DNS_AUTHORITY_CONFIG, payload)?;
        let mut newts = 0usize;
        for site_id in site_ids {
            let Some(newt) = self.store.newt_for_site(*site_id).await? else {
                continue;
            };
            self.bus.send(&newt.newt_id, newt_message.clone()).await;
            newts += 1;
        }

        let olm_message = AgentMessage::new(OLM_DNS_AUTHORITY_CONFIG, payload)?;
        let olm_recipients = self.store.olms_for_sites(site_ids).await?;
        let mut olm_ids: Vec<&str> = olm_recipients.iter().map(|o| o.olm_id.as_str()).collect();
        olm_ids.dedup();
        let olms = olm_ids.len();
        for olm_id in olm_ids {
            self.bus.send(olm_id, olm_message.clone()).await;
        }

        tracing::debug!(
            resource_id = resource.resource_id,
            sites = site_ids.len(),
            newts,
            olms,
            "dispatched zone config"
        );
        Ok(())
    }
}

/// Distinct ids of sites eligible to answer for the resource, ascending.
/// With `enabled_only`, only sites reached through an enabled target count.
fn retained_site_ids(rows: &[ResourceTargetView], enabled_only: bool) -> Vec<i64> {
    let site_ids: BTreeSet<i64> = rows
        .iter()
        .filter(|r| !enabled_only || r.target.enabled)
        .filter(|r| r.site.dns_authority_enabled && r.site.public_ip.is_some())
        .map(|r| r.site.site_id)
        .collect();
    site_ids.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AgentKind;
    use crate::model::{Client, HcHealth, Newt, Olm, Resource, Site, Target};
    use crate::store::MemStore;

    fn site(site_id: i64, public_ip: Option<&str>, dns_authority: bool) -> Site {
        Site {
            site_id,
            org_id: "org1".into(),
            nice_id: format!("site-{site_id}"),
            name: format!("Site {site_id}"),
            site_type: "newt".into(),
            public_ip: public_ip.map(String::from),
            server_public_ip: None,
            docker_socket_enabled: false,
            dns_authority_enabled: dns_authority,
            exit_node_id: None,
        }
    }

    fn resource(resource_id: i64, domain: Option<&str>, dns_authority: bool) -> Resource {
        Resource {
            resource_id,
            org_id: "org1".into(),
            name: format!("res-{resource_id}"),
            full_domain: domain.map(String::from),
            ssl: true,
            http: true,
            sso: false,
            block_access: false,
            email_whitelist_enabled: false,
            dns_authority_enabled: dns_authority,
            dns_authority_ttl: None,
            dns_authority_routing_policy: None,
        }
    }

    fn target(target_id: i64, resource_id: i64, site_id: i64) -> Target {
        Target {
            target_id,
            resource_id,
            site_id,
            ip: "10.0.0.5".into(),
            port: 8080,
            method: "http".into(),
            enabled: true,
            priority: Some(100),
            ssl: false,
        }
    }

    fn single_site_store() -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        store.add_site(site(1, Some("203.0.113.10"), true));
        store.add_resource(resource(1, Some("svc.example.com"), true));
        store.add_target(target(1, 1, 1));
        store.add_newt(Newt {
            newt_id: "n1".into(),
            site_id: Some(1),
        });
        store
    }

    fn view(resource_id: i64, store: &MemStore) -> (Resource, Vec<ResourceTargetView>) {
        let store = store as &dyn Store;
        futures::executor::block_on(async {
            let resource = store.resource(resource_id).await.unwrap().unwrap();
            let rows = store.resource_targets(resource_id).await.unwrap();
            (resource, rows)
        })
    }

    #[test]
    fn zone_answers_with_site_public_ip() {
        let store = single_site_store();
        let (resource, rows) = view(1, &store);

        let zone = build_zone_config(&resource, &rows).expect("zone");
        assert_eq!(zone.domain, "svc.example.com");
        assert_eq!(zone.ttl, 60);
        assert_eq!(zone.routing_policy, RoutingPolicy::Failover);
        assert_eq!(zone.targets.len(), 1);
        // The answer IP is the site's address, not the target's internal one.
        assert_eq!(zone.targets[0].ip, "203.0.113.10");
        assert_eq!(zone.targets[0].priority, 100);
        assert!(zone.targets[0].healthy);
        assert_eq!(zone.targets[0].site_id, 1);
    }

    #[test]
    fn health_check_disabled_targets_count_as_healthy() {
        let store = single_site_store();
        store.set_target_hc(1, false, HcHealth::Unhealthy);
        let (resource, rows) = view(1, &store);

        let zone = build_zone_config(&resource, &rows).unwrap();
        assert!(zone.targets[0].healthy);
    }

    #[test]
    fn unhealthy_target_stays_in_zone_without_healthy_flag() {
        let store = single_site_store();
        store.set_target_hc(1, true, HcHealth::Unhealthy);
        let (resource, rows) = view(1, &store);

        let zone = build_zone_config(&resource, &rows).unwrap();
        assert_eq!(zone.targets.len(), 1);
        assert!(!zone.targets[0].healthy);
    }

    #[test]
    fn sites_without_authority_or_ip_are_excluded() {
        let store = single_site_store();
        store.add_site(site(2, None, true));
        store.add_site(site(3, Some("198.51.100.9"), false));
        store.add_target(target(2, 1, 2));
        store.add_target(target(3, 1, 3));
        let (resource, rows) = view(1, &store);

        let zone = build_zone_config(&resource, &rows).unwrap();
        let ips: Vec<&str> = zone.targets.iter().map(|t| t.ip.as_str()).collect();
        assert_eq!(ips, vec!["203.0.113.10"]);
    }

    #[test]
    fn zone_is_none_without_domain_or_authority_or_targets() {
        let store = single_site_store();

        let (mut resource, rows) = view(1, &store);
        resource.dns_authority_enabled = false;
        assert!(build_zone_config(&resource, &rows).is_none());

        let (mut resource, rows) = view(1, &store);
        resource.full_domain = None;
        assert!(build_zone_config(&resource, &rows).is_none());

        let (resource, _) = view(1, &store);
        assert!(build_zone_config(&resource, &[]).is_none());
    }

    #[test]
    fn targets_are_ordered_by_priority_then_id() {
        let store = single_site_store();
        store.add_site(site(2, Some("198.51.100.9"), true));
        let mut t = target(2, 1, 2);
        t.priority = Some(10);
        store.add_target(t);
        let (resource, rows) = view(1, &store);

        let zone = build_zone_config(&resource, &rows).unwrap();
        assert_eq!(zone.targets[0].priority, 10);
        assert_eq!(zone.targets[1].priority, 100);
    }

    // S1: the Newt on the hosting site receives the full zone snapshot.
    #[tokio::test]
    async fn update_pushes_zone_to_hosting_newt() {
        let store = single_site_store();
        let bus = Arc::new(AgentBus::new(8));
        let mut newt_rx = bus.attach(AgentKind::Newt, "n1").await;

        let dns = DnsReconciler::new(store.clone(), bus.clone());
        dns.update_dns_authority_for_resource(1).await.unwrap();

        let msg = newt_rx.recv().await.unwrap();
        assert_eq!(msg.message_type, NEWT_DNS_AUTHORITY_CONFIG);
        let payload: ZoneUpdatePayload = serde_json::from_value(msg.data).unwrap();
        assert_eq!(payload.action, DnsAction::Update);
        assert_eq!(payload.zones.len(), 1);
        let zone = &payload.zones[0];
        assert!(zone.enabled);
        assert_eq!(zone.domain, "svc.example.com");
        assert_eq!(zone.ttl, 60);
        assert_eq!(zone.routing_policy, RoutingPolicy::Failover);
        assert_eq!(zone.targets[0].ip, "203.0.113.10");
        assert_eq!(zone.targets[0].site_name, "Site 1");
    }

    #[tokio::test]
    async fn update_reaches_olms_associated_with_hosting_sites() {
        let store = single_site_store();
        store.add_olm(Olm { olm_id: "o1".into() });
        store.add_client(Client {
            client_id: 10,
            olm_id: "o1".into(),
            pub_key: None,
        });
        store.link_client_site(10, 1);
        // An olm peered with an unrelated site hears nothing.
        store.add_site(site(9, Some("192.0.2.1"), true));
        store.add_olm(Olm { olm_id: "o2".into() });
        store.add_client(Client {
            client_id: 11,
            olm_id: "o2".into(),
            pub_key: None,
        });
        store.link_client_site(11, 9);

        let bus = Arc::new(AgentBus::new(8));
        let mut o1_rx = bus.attach(AgentKind::Olm, "o1").await;
        let mut o2_rx = bus.attach(AgentKind::Olm, "o2").await;

        let dns = DnsReconciler::new(store.clone(), bus.clone());
        dns.update_dns_authority_for_resource(1).await.unwrap();

        let msg = o1_rx.recv().await.unwrap();
        assert_eq!(msg.message_type, OLM_DNS_AUTHORITY_CONFIG);
        assert!(o2_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn back_to_back_updates_emit_identical_messages() {
        let store = single_site_store();
        let bus = Arc::new(AgentBus::new(8));
        let mut newt_rx = bus.attach(AgentKind::Newt, "n1").await;

        let dns = DnsReconciler::new(store.clone(), bus.clone());
        dns.update_dns_authority_for_resource(1).await.unwrap();
        dns.update_dns_authority_for_resource(1).await.unwrap();

        let first = newt_rx.recv().await.unwrap();
        let second = newt_rx.recv().await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn disabling_authority_sends_remove_to_same_recipients() {
        let store = single_site_store();
        let bus = Arc::new(AgentBus::new(8));
        let mut newt_rx = bus.attach(AgentKind::Newt, "n1").await;
        let dns = DnsReconciler::new(store.clone(), bus.clone());

        dns.update_dns_authority_for_resource(1).await.unwrap();
        store.add_resource(resource(1, Some("svc.example.com"), false));
        dns.update_dns_authority_for_resource(1).await.unwrap();
        store.add_resource(resource(1, Some("svc.example.com"), true));
        dns.update_dns_authority_for_resource(1).await.unwrap();

        let update = newt_rx.recv().await.unwrap();
        let remove = newt_rx.recv().await.unwrap();
        let update_again = newt_rx.recv().await.unwrap();

        let removal: ZoneRemovePayload = serde_json::from_value(remove.data).unwrap();
        assert_eq!(removal.action, DnsAction::Remove);
        assert_eq!(removal.zones, vec![ZoneRemoval { domain: "svc.example.com".into() }]);
        assert_eq!(
            serde_json::to_vec(&update).unwrap(),
            serde_json::to_vec(&update_again).unwrap()
        );
    }

    #[tokio::test]
    async fn disabling_last_target_sends_remove() {
        let store = single_site_store();
        let bus = Arc::new(AgentBus::new(8));
        let mut newt_rx = bus.attach(AgentKind::Newt, "n1").await;
        let dns = DnsReconciler::new(store.clone(), bus.clone());

        let mut t = target(1, 1, 1);
        t.enabled = false;
        store.add_target(t);
        dns.update_dns_authority_for_resource(1).await.unwrap();

        let msg = newt_rx.recv().await.unwrap();
        let removal: ZoneRemovePayload = serde_json::from_value(msg.data).unwrap();
        assert_eq!(removal.action, DnsAction::Remove);
    }

    #[tokio::test]
    async fn health_batch_collapses_to_distinct_resources() {
        let store = single_site_store();
        // Second target of the same resource plus a non-authority resource.
        store.add_target(target(2, 1, 1));
        store.add_resource(resource(2, Some("other.example.com"), false));
        store.add_target(target(3, 2, 1));

        let bus = Arc::new(AgentBus::new(8));
        let mut newt_rx = bus.attach(AgentKind::Newt, "n1").await;
        let dns = DnsReconciler::new(store.clone(), bus.clone());

        dns.on_health_check_update(&[1, 2, 3]).await.unwrap();

        // One rebuild for resource 1, nothing for the non-authority resource.
        let msg = newt_rx.recv().await.unwrap();
        assert_eq!(msg.message_type, NEWT_DNS_AUTHORITY_CONFIG);
        assert!(newt_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn olm_bootstrap_collects_every_zone_for_its_sites() {
        let store = single_site_store();
        store.add_resource(resource(2, Some("two.example.com"), true));
        store.add_target(target(2, 2, 1));
        store.add_olm(Olm { olm_id: "o1".into() });
        store.add_client(Client {
            client_id: 10,
            olm_id: "o1".into(),
            pub_key: None,
        });
        store.link_client_site(10, 1);

        let bus = Arc::new(AgentBus::new(8));
        let mut olm_rx = bus.attach(AgentKind::Olm, "o1").await;
        let dns = DnsReconciler::new(store.clone(), bus.clone());

        dns.send_dns_authority_zones_to_olm("o1", 10).await.unwrap();

        let msg = olm_rx.recv().await.unwrap();
        let payload: ZoneUpdatePayload = serde_json::from_value(msg.data).unwrap();
        let domains: Vec<&str> = payload.zones.iter().map(|z| z.domain.as_str()).collect();
        assert_eq!(domains, vec!["svc.example.com", "two.example.com"]);
    }

    #[tokio::test]
    async fn olm_bootstrap_is_silent_without_authority_sites() {
        let store = Arc::new(MemStore::new());
        store.add_site(site(1, None, false));
        store.add_olm(Olm { olm_id: "o1".into() });
        store.add_client(Client {
            client_id: 10,
            olm_id: "o1".into(),
            pub_key: None,
        });
        store.link_client_site(10, 1);

        let bus = Arc::new(AgentBus::new(8));
        let mut olm_rx = bus.attach(AgentKind::Olm, "o1").await;
        let dns = DnsReconciler::new(store.clone(), bus.clone());

        dns.send_dns_authority_zones_to_olm("o1", 10).await.unwrap();
        assert!(olm_rx.try_recv().is_err());
    }
}
