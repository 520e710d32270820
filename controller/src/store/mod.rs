//! State store: the single source of truth the reconcilers read
//!
//! The [`Store`] trait names every query the control plane needs. Reads that
//! back a reconciliation view may see snapshot skew; the resulting messages
//! are advisory full snapshots, so skew is tolerated rather than prevented.

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Client, ExitNode, HcHealth, Newt, Org, Resource, Session, Site, Target, TargetHealth, User,
};

/// One target of a resource joined with its site and health row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTargetView {
    pub target: Target,
    pub site: Site,
    pub health: TargetHealth,
}

/// One enabled target on a site joined with the resource it serves.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteAuthTarget {
    pub target: Target,
    pub resource: Resource,
}

/// An Olm that must receive zone updates, with the client that links it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlmRecipient {
    pub olm_id: String,
    pub client_id: i64,
}

/// Queries the reconcilers, ingestor, and session validator run against the
/// relational state.
///
/// Ordering contracts matter: back-to-back reconciliations must emit
/// byte-identical messages, so every listing below is deterministically
/// ordered.
#[async_trait]
pub trait Store: Send + Sync {
    async fn org(&self, org_id: &str) -> Result<Option<Org>>;

    async fn site(&self, site_id: i64) -> Result<Option<Site>>;

    async fn resource(&self, resource_id: i64) -> Result<Option<Resource>>;

    /// All targets of the resource (enabled or not) joined with site and
    /// health, ordered by (priority, target id) with missing priority last.
    async fn resource_targets(&self, resource_id: i64) -> Result<Vec<ResourceTargetView>>;

    /// Distinct ids of sites hosting an enabled target of the resource,
    /// ascending.
    async fn sites_hosting_resource(&self, resource_id: i64) -> Result<Vec<i64>>;

    /// Enabled targets on the site joined with their resources, ordered by
    /// (priority, target id) with missing priority last.
    async fn site_auth_targets(&self, site_id: i64) -> Result<Vec<SiteAuthTarget>>;

    /// Allow-listed emails for the resource, ascending.
    async fn whitelisted_emails(&self, resource_id: i64) -> Result<Vec<String>>;

    async fn newt(&self, newt_id: &str) -> Result<Option<Newt>>;

    async fn newt_for_site(&self, site_id: i64) -> Result<Option<Newt>>;

    /// Distinct Olm recipients whose clients associate with any of the given
    /// sites, ordered by (olm id, client id). Every association counts; no
    /// liveness filter is applied.
    async fn olms_for_sites(&self, site_ids: &[i64]) -> Result<Vec<OlmRecipient>>;

    /// Clients owned by the Olm, ascending by client id.
    async fn clients_for_olm(&self, olm_id: &str) -> Result<Vec<Client>>;

    /// Sites the client associates with, ascending by site id.
    async fn sites_for_client(&self, client_id: i64) -> Result<Vec<Site>>;

    async fn exit_node(&self, exit_node_id: i64) -> Result<Option<ExitNode>>;

    /// Distinct ids of dns-authority-enabled resources reachable via the
    /// given targets, ascending.
    async fn dns_resources_for_targets(&self, target_ids: &[i64]) -> Result<Vec<i64>>;

    /// Distinct ids of dns-authority-enabled resources with an enabled target
    /// on any of the given sites, ascending.
    async fn dns_resources_on_sites(&self, site_ids: &[i64]) -> Result<Vec<i64>>;

    /// Site the target belongs to, if the target exists.
    async fn target_site(&self, target_id: i64) -> Result<Option<i64>>;

    /// Record the health reported for a target. The row is created with the
    /// target, so a missing row means a missing target.
    async fn set_target_health(&self, target_id: i64, health: HcHealth) -> Result<()>;

    /// Unexpired session carrying the token, if any.
    async fn session_by_token(&self, token: &str) -> Result<Option<Session>>;

    async fn user(&self, user_id: &str) -> Result<Option<User>>;
}
