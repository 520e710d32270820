//! In-memory store
//!
//! Deterministic, lock-guarded twin of the Postgres store. Reconciler unit
//! tests run against it as fixtures, and it backs local development without a
//! database. `BTreeMap`s keep every listing in the same order the SQL
//! implementation produces.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::model::{
    Client, ExitNode, HcHealth, Newt, Olm, Org, Resource, Session, Site, Target, TargetHealth,
    User, DEFAULT_TARGET_PRIORITY,
};

use super::{OlmRecipient, ResourceTargetView, SiteAuthTarget, Store};

#[derive(Default)]
struct Inner {
    orgs: HashMap<String, Org>,
    sites: BTreeMap<i64, Site>,
    resources: BTreeMap<i64, Resource>,
    targets: BTreeMap<i64, Target>,
    health: HashMap<i64, TargetHealth>,
    whitelist: BTreeMap<i64, BTreeSet<String>>,
    newts: BTreeMap<String, Newt>,
    olms: BTreeMap<String, Olm>,
    clients: BTreeMap<i64, Client>,
    client_sites: BTreeSet<(i64, i64)>,
    exit_nodes: BTreeMap<i64, ExitNode>,
    sessions: HashMap<String, Session>,
    users: HashMap<String, User>,
}

/// Thread-safe in-memory [`Store`].
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_org(&self, org: Org) {
        self.inner.write().unwrap().orgs.insert(org.org_id.clone(), org);
    }

    pub fn add_site(&self, site: Site) {
        self.inner.write().unwrap().sites.insert(site.site_id, site);
    }

    pub fn add_resource(&self, resource: Resource) {
        self.inner
            .write()
            .unwrap()
            .resources
            .insert(resource.resource_id, resource);
    }

    /// Insert a target together with its fresh health row.
    pub fn add_target(&self, target: Target) {
        let mut inner = self.inner.write().unwrap();
        inner
            .health
            .insert(target.target_id, TargetHealth::new_for_target(target.target_id));
        inner.targets.insert(target.target_id, target);
    }

    /// Flip the health-check knobs on an existing target's health row.
    pub fn set_target_hc(&self, target_id: i64, enabled: bool, health: HcHealth) {
        let mut inner = self.inner.write().unwrap();
        if let Some(row) = inner.health.get_mut(&target_id) {
            row.hc_enabled = enabled;
            row.hc_health = health;
        }
    }

    pub fn add_newt(&self, newt: Newt) {
        self.inner.write().unwrap().newts.insert(newt.newt_id.clone(), newt);
    }

    pub fn add_olm(&self, olm: Olm) {
        self.inner.write().unwrap().olms.insert(olm.olm_id.clone(), olm);
    }

    pub fn add_client(&self, client: Client) {
        self.inner
            .write()
            .unwrap()
            .clients
            .insert(client.client_id, client);
    }

    pub fn link_client_site(&self, client_id: i64, site_id: i64) {
        self.inner
            .write()
            .unwrap()
            .client_sites
            .insert((client_id, site_id));
    }

    pub fn add_exit_node(&self, node: ExitNode) {
        self.inner
            .write()
            .unwrap()
            .exit_nodes
            .insert(node.exit_node_id, node);
    }

    pub fn add_whitelisted_email(&self, resource_id: i64, email: impl Into<String>) {
        self.inner
            .write()
            .unwrap()
            .whitelist
            .entry(resource_id)
            .or_default()
            .insert(email.into());
    }

    pub fn add_session(&self, session: Session) {
        self.inner
            .write()
            .unwrap()
            .sessions
            .insert(session.session_token.clone(), session);
    }

    pub fn add_user(&self, user: User) {
        self.inner.write().unwrap().users.insert(user.user_id.clone(), user);
    }

    /// Read back a target's health row (test observability).
    pub fn target_health(&self, target_id: i64) -> Option<TargetHealth> {
        self.inner.read().unwrap().health.get(&target_id).cloned()
    }
}

fn target_sort_key(target: &Target) -> (i32, i64) {
    (
        target.priority.unwrap_or(DEFAULT_TARGET_PRIORITY),
        target.target_id,
    )
}

#[async_trait]
impl Store for MemStore {
    async fn org(&self, org_id: &str) -> Result<Option<Org>> {
        Ok(self.inner.read().unwrap().orgs.get(org_id).cloned())
    }

    async fn site(&self, site_id: i64) -> Result<Option<Site>> {
        Ok(self.inner.read().unwrap().sites.get(&site_id).cloned())
    }

    async fn resource(&self, resource_id: i64) -> Result<Option<Resource>> {
        Ok(self.inner.read().unwrap().resources.get(&resource_id).cloned())
    }

    async fn resource_targets(&self, resource_id: i64) -> Result<Vec<ResourceTargetView>> {
        let inner = self.inner.read().unwrap();
        let mut targets: Vec<&Target> = inner
            .targets
            .values()
            .filter(|t| t.resource_id == resource_id)
            .collect();
        targets.sort_by_key(|t| target_sort_key(t));

        let mut views = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(site) = inner.sites.get(&target.site_id) else {
                continue;
            };
            let health = inner
                .health
                .get(&target.target_id)
                .cloned()
                .unwrap_or_else(|| TargetHealth::new_for_target(target.target_id));
            views.push(ResourceTargetView {
                target: target.clone(),
                site: site.clone(),
                health,
            });
        }
        Ok(views)
    }

    async fn sites_hosting_resource(&self, resource_id: i64) -> Result<Vec<i64>> {
        let inner = self.inner.read().unwrap();
        let site_ids: BTreeSet<i64> = inner
            .targets
            .values()
            .filter(|t| t.resource_id == resource_id && t.enabled)
            .map(|t| t.site_id)
            .collect();
        Ok(site_ids.into_iter().collect())
    }

    async fn site_auth_targets(&self, site_id: i64) -> Result<Vec<SiteAuthTarget>> {
        let inner = self.inner.read().unwrap();
        let mut targets: Vec<&Target> = inner
            .targets
            .values()
            .filter(|t| t.site_id == site_id && t.enabled)
            .collect();
        targets.sort_by_key(|t| target_sort_key(t));

        let mut rows = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(resource) = inner.resources.get(&target.resource_id) else {
                continue;
            };
            rows.push(SiteAuthTarget {
                target: target.clone(),
                resource: resource.clone(),
            });
        }
        Ok(rows)
    }

    async fn whitelisted_emails(&self, resource_id: i64) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .whitelist
            .get(&resource_id)
            .map(|emails| emails.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn newt(&self, newt_id: &str) -> Result<Option<Newt>> {
        Ok(self.inner.read().unwrap().newts.get(newt_id).cloned())
    }

    async fn newt_for_site(&self, site_id: i64) -> Result<Option<Newt>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .newts
            .values()
            .find(|n| n.site_id == Some(site_id))
            .cloned())
    }

    async fn olms_for_sites(&self, site_ids: &[i64]) -> Result<Vec<OlmRecipient>> {
        let inner = self.inner.read().unwrap();
        let wanted: BTreeSet<i64> = site_ids.iter().copied().collect();
        let mut recipients: BTreeSet<(String, i64)> = BTreeSet::new();
        for (client_id, site_id) in &inner.client_sites {
            if !wanted.contains(site_id) {
                continue;
            }
            if let Some(client) = inner.clients.get(client_id) {
                recipients.insert((client.olm_id.clone(), client.client_id));
            }
        }
        Ok(recipients
            .into_iter()
            .map(|(olm_id, client_id)| OlmRecipient { olm_id, client_id })
            .collect())
    }

    async fn clients_for_olm(&self, olm_id: &str) -> Result<Vec<Client>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .clients
            .values()
            .filter(|c| c.olm_id == olm_id)
            .cloned()
            .collect())
    }

    async fn sites_for_client(&self, client_id: i64) -> Result<Vec<Site>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .client_sites
            .iter()
            .filter(|(c, _)| *c == client_id)
            .filter_map(|(_, s)| inner.sites.get(s).cloned())
            .collect())
    }

    async fn exit_node(&self, exit_node_id: i64) -> Result<Option<ExitNode>> {
        Ok(self.inner.read().unwrap().exit_nodes.get(&exit_node_id).cloned())
    }

    async fn dns_resources_for_targets(&self, target_ids: &[i64]) -> Result<Vec<i64>> {
        let inner = self.inner.read().unwrap();
        let mut resource_ids = BTreeSet::new();
        for target_id in target_ids {
            let Some(target) = inner.targets.get(target_id) else {
                continue;
            };
            if let Some(resource) = inner.resources.get(&target.resource_id) {
                if resource.dns_authority_enabled {
                    resource_ids.insert(resource.resource_id);
                }
            }
        }
        Ok(resource_ids.into_iter().collect())
    }

    async fn dns_resources_on_sites(&self, site_ids: &[i64]) -> Result<Vec<i64>> {
        let inner = self.inner.read().unwrap();
        let wanted: BTreeSet<i64> = site_ids.iter().copied().collect();
        let mut resource_ids = BTreeSet::new();
        for target in inner.targets.values() {
            if !target.enabled || !wanted.contains(&target.site_id) {
                continue;
            }
            if let Some(resource) = inner.resources.get(&target.resource_id) {
                if resource.dns_authority_enabled {
                    resource_ids.insert(resource.resource_id);
                }
            }
        }
        Ok(resource_ids.into_iter().collect())
    }

    async fn target_site(&self, target_id: i64) -> Result<Option<i64>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.targets.get(&target_id).map(|t| t.site_id))
    }

    async fn set_target_health(&self, target_id: i64, health: HcHealth) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.health.get_mut(&target_id) {
            Some(row) => {
                row.hc_health = health;
                Ok(())
            }
            None => Err(crate::error::Error::NotFound(format!(
                "target {target_id} has no health row"
            ))),
        }
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<Session>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .sessions
            .get(token)
            .filter(|s| s.expires_at > Utc::now())
            .cloned())
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.inner.read().unwrap().users.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn site(site_id: i64) -> Site {
        Site {
            site_id,
            org_id: "org1".into(),
            nice_id: format!("site-{site_id}"),
            name: format!("Site {site_id}"),
            site_type: "newt".into(),
            public_ip: Some("203.0.113.10".into()),
            server_public_ip: None,
            docker_socket_enabled: false,
            dns_authority_enabled: true,
            exit_node_id: None,
        }
    }

    fn resource(resource_id: i64) -> Resource {
        Resource {
            resource_id,
            org_id: "org1".into(),
            name: format!("res-{resource_id}"),
            full_domain: Some("svc.example.com".into()),
            ssl: true,
            http: true,
            sso: false,
            block_access: false,
            email_whitelist_enabled: false,
            dns_authority_enabled: true,
            dns_authority_ttl: None,
            dns_authority_routing_policy: None,
        }
    }

    fn target(target_id: i64, resource_id: i64, site_id: i64, priority: Option<i32>) -> Target {
        Target {
            target_id,
            resource_id,
            site_id,
            ip: "10.0.0.5".into(),
            port: 8080,
            method: "http".into(),
            enabled: true,
            priority,
            ssl: false,
        }
    }

    #[tokio::test]
    async fn resource_targets_are_ordered_by_priority_then_id() {
        let store = MemStore::new();
        store.add_site(site(1));
        store.add_resource(resource(1));
        store.add_target(target(3, 1, 1, None));
        store.add_target(target(1, 1, 1, Some(50)));
        store.add_target(target(2, 1, 1, Some(50)));

        let views = store.resource_targets(1).await.unwrap();
        let ids: Vec<i64> = views.iter().map(|v| v.target.target_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn olms_for_sites_deduplicates_by_association() {
        let store = MemStore::new();
        store.add_site(site(1));
        store.add_site(site(2));
        store.add_olm(Olm { olm_id: "o1".into() });
        store.add_client(Client {
            client_id: 10,
            olm_id: "o1".into(),
            pub_key: None,
        });
        store.link_client_site(10, 1);
        store.link_client_site(10, 2);

        let recipients = store.olms_for_sites(&[1, 2]).await.unwrap();
        assert_eq!(
            recipients,
            vec![OlmRecipient {
                olm_id: "o1".into(),
                client_id: 10
            }]
        );
    }

    #[tokio::test]
    async fn expired_sessions_are_invisible() {
        let store = MemStore::new();
        store.add_user(User {
            user_id: "u1".into(),
            email: "a@x".into(),
        });
        store.add_session(Session {
            session_id: "s1".into(),
            session_token: "dead".into(),
            user_id: "u1".into(),
            expires_at: Utc::now() - Duration::hours(1),
        });
        store.add_session(Session {
            session_id: "s2".into(),
            session_token: "live".into(),
            user_id: "u1".into(),
            expires_at: Utc::now() + Duration::hours(1),
        });

        assert!(store.session_by_token("dead").await.unwrap().is_none());
        assert!(store.session_by_token("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_target_health_requires_an_existing_row() {
        let store = MemStore::new();
        assert!(store.set_target_health(99, HcHealth::Healthy).await.is_err());

        store.add_site(site(1));
        store.add_resource(resource(1));
        store.add_target(target(1, 1, 1, None));
        store.set_target_health(1, HcHealth::Unhealthy).await.unwrap();
        assert_eq!(
            store.target_health(1).unwrap().hc_health,
            HcHealth::Unhealthy
        );
    }
}
