//! Persistent entities and the enums shared across reconcilers.
//!
//! These are plain data rows; the store owns their lifecycle and all mutation
//! goes through it. Wire payloads live next to the component that emits them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default answer TTL when a resource does not set one.
pub const DEFAULT_ZONE_TTL: i64 = 60;

/// Default target priority when a target does not set one (lower wins).
pub const DEFAULT_TARGET_PRIORITY: i32 = 100;

/// Tenant root; owns sites and resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Org {
    pub org_id: String,
    pub name: String,
}

/// A deployment location hosting at most one tunnel agent (Newt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub site_id: i64,
    pub org_id: String,
    /// URL-friendly id, unique within the org.
    pub nice_id: String,
    pub name: String,
    pub site_type: String,
    /// Address published in DNS answers. Required while `dns_authority_enabled`.
    pub public_ip: Option<String>,
    /// Auto-detected address of the machine the agent runs on.
    pub server_public_ip: Option<String>,
    pub docker_socket_enabled: bool,
    pub dns_authority_enabled: bool,
    pub exit_node_id: Option<i64>,
}

/// A routable service exposed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub resource_id: i64,
    pub org_id: String,
    pub name: String,
    pub full_domain: Option<String>,
    pub ssl: bool,
    pub http: bool,
    pub sso: bool,
    pub block_access: bool,
    pub email_whitelist_enabled: bool,
    pub dns_authority_enabled: bool,
    /// Answer TTL in seconds (10..=86400).
    pub dns_authority_ttl: Option<i64>,
    pub dns_authority_routing_policy: Option<RoutingPolicy>,
}

/// An upstream (site, ip, port) serving a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub target_id: i64,
    pub resource_id: i64,
    pub site_id: i64,
    pub ip: String,
    pub port: u16,
    pub method: String,
    pub enabled: bool,
    /// Lower value = higher preference.
    pub priority: Option<i32>,
    pub ssl: bool,
}

/// Health-check state and knobs, one row per target.
///
/// Created with the target, mutated only by the health ingestor, destroyed
/// with the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealth {
    pub target_id: i64,
    pub hc_enabled: bool,
    pub hc_health: HcHealth,
    pub hc_path: Option<String>,
    pub hc_scheme: Option<String>,
    pub hc_mode: Option<String>,
    pub hc_port: Option<i32>,
    pub hc_interval: Option<i32>,
    pub hc_timeout: Option<i32>,
    pub hc_headers: Option<serde_json::Value>,
    pub hc_method: Option<String>,
}

impl TargetHealth {
    /// Fresh row for a newly created target: checks disabled, state unknown.
    pub fn new_for_target(target_id: i64) -> Self {
        Self {
            target_id,
            hc_enabled: false,
            hc_health: HcHealth::Unknown,
            hc_path: None,
            hc_scheme: None,
            hc_mode: None,
            hc_port: None,
            hc_interval: None,
            hc_timeout: None,
            hc_headers: None,
            hc_method: None,
        }
    }
}

/// Observed health of a target as reported by its Newt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HcHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HcHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HcHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HcHealth {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How agents pick answers from a zone's target list. The controller only
/// transports the policy; selection happens agent-side per query.
///
/// - `Failover`: single lowest-priority healthy target, ties broken by
///   ascending site id; if none is healthy, the lowest-priority target
///   regardless of health.
/// - `Roundrobin`: uniform rotation across healthy targets; unhealthy ones
///   excluded; all returned when none is healthy.
/// - `Priority`: all healthy targets at the lowest priority tier; ascend to
///   the next tier when a tier is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPolicy {
    #[default]
    Failover,
    Roundrobin,
    Priority,
}

impl RoutingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failover => "failover",
            Self::Roundrobin => "roundrobin",
            Self::Priority => "priority",
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failover" => Ok(Self::Failover),
            "roundrobin" => Ok(Self::Roundrobin),
            "priority" => Ok(Self::Priority),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Error for string-to-enum conversions from stored or reported values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Site-side tunnel agent. At most one per site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Newt {
    pub newt_id: String,
    pub site_id: Option<i64>,
}

/// Local-resolver agent. Reaches sites through its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Olm {
    pub olm_id: String,
}

/// A logical client owned by an Olm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub client_id: i64,
    pub olm_id: String,
    pub pub_key: Option<String>,
}

/// Relay endpoint attached to sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNode {
    pub exit_node_id: i64,
    pub public_key: String,
    pub endpoint: String,
}

/// Browser session row, created by the auth flow and consumed read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub session_token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hc_health_round_trips_through_strings() {
        for h in [HcHealth::Healthy, HcHealth::Unhealthy, HcHealth::Unknown] {
            assert_eq!(h.as_str().parse::<HcHealth>().unwrap(), h);
        }
        assert!("flaky".parse::<HcHealth>().is_err());
    }

    #[test]
    fn routing_policy_defaults_to_failover() {
        assert_eq!(RoutingPolicy::default(), RoutingPolicy::Failover);
        assert_eq!(
            serde_json::to_string(&RoutingPolicy::Roundrobin).unwrap(),
            "\"roundrobin\""
        );
    }

    #[test]
    fn new_target_health_starts_unknown_and_disabled() {
        let h = TargetHealth::new_for_target(7);
        assert_eq!(h.target_id, 7);
        assert!(!h.hc_enabled);
        assert_eq!(h.hc_health, HcHealth::Unknown);
    }
}
