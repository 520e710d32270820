//! Auth-proxy reconciler
//!
//! Builds the complete auth-proxy configuration for a site — global
//! authentication parameters plus per-resource policy — and pushes it to the
//! Newt managing the site, so the agent can gate inbound requests without a
//! controller round-trip on the hot path.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::bus::{AgentBus, AgentMessage, NEWT_AUTH_PROXY_CONFIG};
use crate::config::Config;
use crate::error::Result;
use crate::keys::JwtKeys;
use crate::store::{SiteAuthTarget, Store};

/// Cookie carrying the dashboard session token.
pub const SESSION_COOKIE_NAME: &str = "p_session";

/// Path of the out-of-band session-validation endpoint.
pub const SESSION_VALIDATION_PATH: &str = "/api/v1/auth/session/validate";

/// Global authentication parameters shared by every gated resource on a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub enabled: bool,
    pub pangolin_url: String,
    pub jwt_public_key: String,
    pub cookie_name: String,
    pub cookie_domain: String,
    pub session_validation_url: String,
}

/// Per-resource gating policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAuthConfig {
    pub resource_id: i64,
    pub domain: String,
    pub sso: bool,
    pub block_access: bool,
    pub email_whitelist_enabled: bool,
    pub allowed_emails: Vec<String>,
    pub target_url: String,
    pub ssl: bool,
}

/// `{action: "update", auth, resources}` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProxyPayload {
    pub action: AuthProxyAction,
    pub auth: AuthConfig,
    pub resources: Vec<ResourceAuthConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProxyAction {
    Update,
}

/// Cookie domain for a dashboard host: the last two labels with a leading
/// dot, or the bare host when it has a single label.
pub fn cookie_domain_for_host(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 1 {
        host.to_string()
    } else {
        format!(".{}.{}", labels[labels.len() - 2], labels[labels.len() - 1])
    }
}

/// Scheme + address the agent proxies gated requests to.
fn target_url(row: &SiteAuthTarget) -> String {
    let scheme = if row.target.ssl { "https" } else { "http" };
    format!("{}://{}:{}", scheme, row.target.ip, row.target.port)
}

/// A target row is retained iff its resource runs in the Newt-served DNS
/// response path and has something to gate.
fn gates_requests(row: &SiteAuthTarget) -> bool {
    row.resource.dns_authority_enabled
        && (row.resource.sso
            || row.resource.block_access
            || row.resource.email_whitelist_enabled)
}

/// Reconciles auth-proxy configuration for sites and dispatches it to the
/// owning Newt.
pub struct AuthProxyReconciler {
    store: Arc<dyn Store>,
    bus: Arc<AgentBus>,
    keys: Arc<JwtKeys>,
    config: Arc<Config>,
}

impl AuthProxyReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<AgentBus>,
        keys: Arc<JwtKeys>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            keys,
            config,
        }
    }

    /// Secret for auxiliary signed parameters. Kept wired for agents that
    /// negotiate signed cookies; the emitted payload does not carry it.
    pub fn signing_secret(&self) -> Option<&str> {
        self.config.server.secret.as_deref()
    }

    /// Rebuild the site's auth-proxy config and push it to the site's Newt.
    /// A site with nothing to gate produces no message.
    pub async fn update_auth_proxy_for_site(&self, site_id: i64) -> Result<()> {
        let Some(site) = self.store.site(site_id).await? else {
            return Ok(());
        };
        if self.store.org(&site.org_id).await?.is_none() {
            return Ok(());
        }

        let rows = self.store.site_auth_targets(site_id).await?;
        let retained: Vec<&SiteAuthTarget> = rows.iter().filter(|r| gates_requests(r)).collect();
        if retained.is_empty() {
            return Ok(());
        }

        let Some(newt) = self.store.newt_for_site(site_id).await? else {
            tracing::debug!(site_id, "no newt bound to site, skipping auth-proxy push");
            return Ok(());
        };

        let Some(auth) = self.build_auth_config() else {
            tracing::warn!(
                site_id,
                "dashboard_url not configured, skipping auth-proxy push"
            );
            return Ok(());
        };

        // Rows arrive ordered by (priority, target id); the first target of
        // each resource supplies the proxied address.
        let mut seen: HashSet<i64> = HashSet::new();
        let mut resources = Vec::new();
        for row in retained {
            if !seen.insert(row.resource.resource_id) {
                continue;
            }
            let Some(domain) = row.resource.full_domain.clone() else {
                tracing::debug!(
                    resource_id = row.resource.resource_id,
                    "resource has no domain to gate, skipping"
                );
                continue;
            };
            let allowed_emails = if row.resource.email_whitelist_enabled {
                self.store.whitelisted_emails(row.resource.resource_id).await?
            } else {
                Vec::new()
            };
            resources.push(ResourceAuthConfig {
                resource_id: row.resource.resource_id,
                domain,
                sso: row.resource.sso,
                block_access: row.resource.block_access,
                email_whitelist_enabled: row.resource.email_whitelist_enabled,
                allowed_emails,
                target_url: target_url(row),
                ssl: row.resource.ssl,
            });
        }
        if resources.is_empty() {
            return Ok(());
        }

        let resource_count = resources.len();
        let payload = AuthProxyPayload {
            action: AuthProxyAction::Update,
            auth,
            resources,
        };
        let message = AgentMessage::new(NEWT_AUTH_PROXY_CONFIG, &payload)?;
        self.bus.send(&newt.newt_id, message).await;
        tracing::debug!(
            site_id,
            newt_id = %newt.newt_id,
            resources = resource_count,
            "dispatched auth-proxy config"
        );
        Ok(())
    }

    /// Rebuild the auth-proxy config of every site hosting an enabled target
    /// of the resource.
    pub async fn update_auth_proxy_for_resource(&self, resource_id: i64) -> Result<()> {
        let site_ids = self.store.sites_hosting_resource(resource_id).await?;
        for site_id in site_ids {
            self.update_auth_proxy_for_site(site_id).await?;
        }
        Ok(())
    }

    fn build_auth_config(&self) -> Option<AuthConfig> {
        let dashboard_url = self.config.app.dashboard_url.as_deref()?;
        let parsed = Url::parse(dashboard_url).ok()?;
        let host = parsed.host_str()?;

        let base = dashboard_url.trim_end_matches('/');
        Some(AuthConfig {
            enabled: true,
            pangolin_url: base.to_string(),
            jwt_public_key: self.keys.public_key_pem().to_string(),
            cookie_name: SESSION_COOKIE_NAME.to_string(),
            cookie_domain: cookie_domain_for_host(host),
            session_validation_url: format!("{base}{SESSION_VALIDATION_PATH}"),
        })
    }
}
