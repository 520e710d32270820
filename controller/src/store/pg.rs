//! PostgreSQL store
//!
//! Runtime-checked sqlx queries over the schema in `migrations/`. Composite
//! views are stitched from per-table set queries (`= ANY($1)`) rather than
//! wide joins, keeping each row mapping trivial.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::model::{
    Client, ExitNode, HcHealth, Newt, Org, Resource, Session, Site, Target, TargetHealth, User,
};

use super::{OlmRecipient, ResourceTargetView, SiteAuthTarget, Store};

/// Create the connection pool with bounded retry and exponential backoff.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt: u32 = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await;

        match result {
            Ok(pool) => {
                tracing::info!(
                    max = config.max_connections,
                    min = config.min_connections,
                    "database connection pool created"
                );
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::error!(
                        "failed to connect to database after {} attempts: {}",
                        attempt,
                        e
                    );
                    return Err(e.into());
                }
                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "database connection attempt {} failed: {}. Retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// [`Store`] backed by PostgreSQL.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(FromRow)]
struct OrgRow {
    org_id: String,
    name: String,
}

impl From<OrgRow> for Org {
    fn from(row: OrgRow) -> Self {
        Org {
            org_id: row.org_id,
            name: row.name,
        }
    }
}

#[derive(FromRow)]
struct SiteRow {
    site_id: i64,
    org_id: String,
    nice_id: String,
    name: String,
    site_type: String,
    public_ip: Option<String>,
    server_public_ip: Option<String>,
    docker_socket_enabled: bool,
    dns_authority_enabled: bool,
    exit_node_id: Option<i64>,
}

impl From<SiteRow> for Site {
    fn from(row: SiteRow) -> Self {
        Site {
            site_id: row.site_id,
            org_id: row.org_id,
            nice_id: row.nice_id,
            name: row.name,
            site_type: row.site_type,
            public_ip: row.public_ip,
            server_public_ip: row.server_public_ip,
            docker_socket_enabled: row.docker_socket_enabled,
            dns_authority_enabled: row.dns_authority_enabled,
            exit_node_id: row.exit_node_id,
        }
    }
}

#[derive(FromRow)]
struct ResourceRow {
    resource_id: i64,
    org_id: String,
    name: String,
    full_domain: Option<String>,
    ssl: bool,
    http: bool,
    sso: bool,
    block_access: bool,
    email_whitelist_enabled: bool,
    dns_authority_enabled: bool,
    dns_authority_ttl: Option<i64>,
    dns_authority_routing_policy: Option<String>,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            resource_id: row.resource_id,
            org_id: row.org_id,
            name: row.name,
            full_domain: row.full_domain,
            ssl: row.ssl,
            http: row.http,
            sso: row.sso,
            block_access: row.block_access,
            email_whitelist_enabled: row.email_whitelist_enabled,
            dns_authority_enabled: row.dns_authority_enabled,
            dns_authority_ttl: row.dns_authority_ttl,
            dns_authority_routing_policy: row
                .dns_authority_routing_policy
                .and_then(|s| s.parse().ok()),
        }
    }
}

#[derive(FromRow)]
struct TargetRow {
    target_id: i64,
    resource_id: i64,
    site_id: i64,
    ip: String,
    port: i32,
    method: String,
    enabled: bool,
    priority: Option<i32>,
    ssl: bool,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            target_id: row.target_id,
            resource_id: row.resource_id,
            site_id: row.site_id,
            ip: row.ip,
            port: row.port as u16,
            method: row.method,
            enabled: row.enabled,
            priority: row.priority,
            ssl: row.ssl,
        }
    }
}

#[derive(FromRow)]
struct TargetHealthRow {
    target_id: i64,
    hc_enabled: bool,
    hc_health: String,
    hc_path: Option<String>,
    hc_scheme: Option<String>,
    hc_mode: Option<String>,
    hc_port: Option<i32>,
    hc_interval: Option<i32>,
    hc_timeout: Option<i32>,
    hc_headers: Option<serde_json::Value>,
    hc_method: Option<String>,
}

impl From<TargetHealthRow> for TargetHealth {
    fn from(row: TargetHealthRow) -> Self {
        TargetHealth {
            target_id: row.target_id,
            hc_enabled: row.hc_enabled,
            hc_health: row.hc_health.parse().unwrap_or(HcHealth::Unknown),
            hc_path: row.hc_path,
            hc_scheme: row.hc_scheme,
            hc_mode: row.hc_mode,
            hc_port: row.hc_port,
            hc_interval: row.hc_interval,
            hc_timeout: row.hc_timeout,
            hc_headers: row.hc_headers,
            hc_method: row.hc_method,
        }
    }
}

#[derive(FromRow)]
struct NewtRow {
    newt_id: String,
    site_id: Option<i64>,
}

impl From<NewtRow> for Newt {
    fn from(row: NewtRow) -> Self {
        Newt {
            newt_id: row.newt_id,
            site_id: row.site_id,
        }
    }
}

#[derive(FromRow)]
struct ClientRow {
    client_id: i64,
    olm_id: String,
    pub_key: Option<String>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            client_id: row.client_id,
            olm_id: row.olm_id,
            pub_key: row.pub_key,
        }
    }
}

#[derive(FromRow)]
struct ExitNodeRow {
    exit_node_id: i64,
    public_key: String,
    endpoint: String,
}

impl From<ExitNodeRow> for ExitNode {
    fn from(row: ExitNodeRow) -> Self {
        ExitNode {
            exit_node_id: row.exit_node_id,
            public_key: row.public_key,
            endpoint: row.endpoint,
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    session_id: String,
    session_token: String,
    user_id: String,
    expires_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            session_id: row.session_id,
            session_token: row.session_token,
            user_id: row.user_id,
            expires_at: row.expires_at,
        }
    }
}

const SITE_COLUMNS: &str = "site_id, org_id, nice_id, name, site_type, public_ip, \
     server_public_ip, docker_socket_enabled, dns_authority_enabled, exit_node_id";

const RESOURCE_COLUMNS: &str = "resource_id, org_id, name, full_domain, ssl, http, sso, \
     block_access, email_whitelist_enabled, dns_authority_enabled, dns_authority_ttl, \
     dns_authority_routing_policy";

const TARGET_COLUMNS: &str =
    "target_id, resource_id, site_id, ip, port, method, enabled, priority, ssl";

const HEALTH_COLUMNS: &str = "target_id, hc_enabled, hc_health, hc_path, hc_scheme, hc_mode, \
     hc_port, hc_interval, hc_timeout, hc_headers, hc_method";

impl PgStore {
    async fn sites_by_ids(&self, site_ids: &[i64]) -> Result<Vec<Site>> {
        let rows: Vec<SiteRow> =
            sqlx::query_as(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE site_id = ANY($1)"))
                .bind(site_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Site::from).collect())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn org(&self, org_id: &str) -> Result<Option<Org>> {
        let row: Option<OrgRow> =
            sqlx::query_as("SELECT org_id, name FROM orgs WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Org::from))
    }

    async fn site(&self, site_id: i64) -> Result<Option<Site>> {
        let row: Option<SiteRow> =
            sqlx::query_as(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE site_id = $1"))
                .bind(site_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Site::from))
    }

    async fn resource(&self, resource_id: i64) -> Result<Option<Resource>> {
        let row: Option<ResourceRow> = sqlx::query_as(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE resource_id = $1"
        ))
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Resource::from))
    }

    async fn resource_targets(&self, resource_id: i64) -> Result<Vec<ResourceTargetView>> {
        let target_rows: Vec<TargetRow> = sqlx::query_as(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE resource_id = $1 \
             ORDER BY COALESCE(priority, 100), target_id"
        ))
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        let targets: Vec<Target> = target_rows.into_iter().map(Target::from).collect();

        let mut site_ids: Vec<i64> = targets.iter().map(|t| t.site_id).collect();
        site_ids.sort_unstable();
        site_ids.dedup();
        let sites = self.sites_by_ids(&site_ids).await?;

        let target_ids: Vec<i64> = targets.iter().map(|t| t.target_id).collect();
        let health_rows: Vec<TargetHealthRow> = sqlx::query_as(&format!(
            "SELECT {HEALTH_COLUMNS} FROM target_health WHERE target_id = ANY($1)"
        ))
        .bind(&target_ids)
        .fetch_all(&self.pool)
        .await?;

        let sites: std::collections::HashMap<i64, Site> =
            sites.into_iter().map(|s| (s.site_id, s)).collect();
        let mut health: std::collections::HashMap<i64, TargetHealth> = health_rows
            .into_iter()
            .map(TargetHealth::from)
            .map(|h| (h.target_id, h))
            .collect();

        let mut views = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(site) = sites.get(&target.site_id).cloned() else {
                continue;
            };
            let health = health
                .remove(&target.target_id)
                .unwrap_or_else(|| TargetHealth::new_for_target(target.target_id));
            views.push(ResourceTargetView {
                target,
                site,
                health,
            });
        }
        Ok(views)
    }

    async fn sites_hosting_resource(&self, resource_id: i64) -> Result<Vec<i64>> {
        let site_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT site_id FROM targets \
             WHERE resource_id = $1 AND enabled ORDER BY site_id",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(site_ids)
    }

    async fn site_auth_targets(&self, site_id: i64) -> Result<Vec<SiteAuthTarget>> {
        let target_rows: Vec<TargetRow> = sqlx::query_as(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE site_id = $1 AND enabled \
             ORDER BY COALESCE(priority, 100), target_id"
        ))
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        let targets: Vec<Target> = target_rows.into_iter().map(Target::from).collect();

        let mut resource_ids: Vec<i64> = targets.iter().map(|t| t.resource_id).collect();
        resource_ids.sort_unstable();
        resource_ids.dedup();
        let resource_rows: Vec<ResourceRow> = sqlx::query_as(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE resource_id = ANY($1)"
        ))
        .bind(&resource_ids)
        .fetch_all(&self.pool)
        .await?;
        let resources: std::collections::HashMap<i64, Resource> = resource_rows
            .into_iter()
            .map(Resource::from)
            .map(|r| (r.resource_id, r))
            .collect();

        let mut rows = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(resource) = resources.get(&target.resource_id).cloned() else {
                continue;
            };
            rows.push(SiteAuthTarget { target, resource });
        }
        Ok(rows)
    }

    async fn whitelisted_emails(&self, resource_id: i64) -> Result<Vec<String>> {
        let emails: Vec<String> = sqlx::query_scalar(
            "SELECT email FROM resource_whitelist WHERE resource_id = $1 ORDER BY email",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }

    async fn newt(&self, newt_id: &str) -> Result<Option<Newt>> {
        let row: Option<NewtRow> =
            sqlx::query_as("SELECT newt_id, site_id FROM newts WHERE newt_id = $1")
                .bind(newt_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Newt::from))
    }

    async fn newt_for_site(&self, site_id: i64) -> Result<Option<Newt>> {
        let row: Option<NewtRow> =
            sqlx::query_as("SELECT newt_id, site_id FROM newts WHERE site_id = $1")
                .bind(site_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Newt::from))
    }

    async fn olms_for_sites(&self, site_ids: &[i64]) -> Result<Vec<OlmRecipient>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT DISTINCT c.olm_id, c.client_id FROM clients c \
             JOIN client_site_associations a ON a.client_id = c.client_id \
             WHERE a.site_id = ANY($1) ORDER BY c.olm_id, c.client_id",
        )
        .bind(site_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(olm_id, client_id)| OlmRecipient { olm_id, client_id })
            .collect())
    }

    async fn clients_for_olm(&self, olm_id: &str) -> Result<Vec<Client>> {
        let rows: Vec<ClientRow> = sqlx::query_as(
            "SELECT client_id, olm_id, pub_key FROM clients \
             WHERE olm_id = $1 ORDER BY client_id",
        )
        .bind(olm_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Client::from).collect())
    }

    async fn sites_for_client(&self, client_id: i64) -> Result<Vec<Site>> {
        let rows: Vec<SiteRow> = sqlx::query_as(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE site_id IN \
             (SELECT site_id FROM client_site_associations WHERE client_id = $1) \
             ORDER BY site_id"
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Site::from).collect())
    }

    async fn exit_node(&self, exit_node_id: i64) -> Result<Option<ExitNode>> {
        let row: Option<ExitNodeRow> = sqlx::query_as(
            "SELECT exit_node_id, public_key, endpoint FROM exit_nodes WHERE exit_node_id = $1",
        )
        .bind(exit_node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ExitNode::from))
    }

    async fn dns_resources_for_targets(&self, target_ids: &[i64]) -> Result<Vec<i64>> {
        let resource_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT r.resource_id FROM resources r \
             JOIN targets t ON t.resource_id = r.resource_id \
             WHERE t.target_id = ANY($1) AND r.dns_authority_enabled \
             ORDER BY r.resource_id",
        )
        .bind(target_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(resource_ids)
    }

    async fn dns_resources_on_sites(&self, site_ids: &[i64]) -> Result<Vec<i64>> {
        let resource_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT r.resource_id FROM resources r \
             JOIN targets t ON t.resource_id = r.resource_id \
             WHERE t.site_id = ANY($1) AND t.enabled AND r.dns_authority_enabled \
             ORDER BY r.resource_id",
        )
        .bind(site_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(resource_ids)
    }

    async fn target_site(&self, target_id: i64) -> Result<Option<i64>> {
        let site_id: Option<i64> =
            sqlx::query_scalar("SELECT site_id FROM targets WHERE target_id = $1")
                .bind(target_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(site_id)
    }

    async fn set_target_health(&self, target_id: i64, health: HcHealth) -> Result<()> {
        let result = sqlx::query("UPDATE target_health SET hc_health = $2 WHERE target_id = $1")
            .bind(target_id)
            .bind(health.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(crate::error::Error::NotFound(format!(
                "target {target_id} has no health row"
            )));
        }
        Ok(())
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_id, session_token, user_id, expires_at FROM sessions \
             WHERE session_token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, email FROM users WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id, email)| User { user_id, email }))
    }
}
