//! Health-status ingestor
//!
//! Newts report per-target health periodically. Each row is checked against
//! the reporter's bound site before it can touch the store, so a compromised
//! agent cannot poison another site's health. Rows are processed
//! independently; failures are counted, logged, and never surfaced to the
//! agent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bus::{AgentKind, MessageHandler};
use crate::dns::DnsReconciler;
use crate::model::HcHealth;
use crate::store::Store;

/// Inbound `healthcheck/status` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatusReport {
    #[serde(default)]
    pub targets: HashMap<String, TargetStatusReport>,
}

/// One target's report. Only `status` feeds the store; the rest is agent
/// telemetry echoed for debugging.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatusReport {
    pub status: String,
    #[serde(default)]
    pub last_check: Option<String>,
    #[serde(default)]
    pub check_count: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Handler for `healthcheck/status` messages.
pub struct HealthIngestor {
    store: Arc<dyn Store>,
    dns: Arc<DnsReconciler>,
}

impl HealthIngestor {
    pub fn new(store: Arc<dyn Store>, dns: Arc<DnsReconciler>) -> Self {
        Self { store, dns }
    }

    async fn ingest(&self, newt_id: &str, report: HealthStatusReport) {
        let bound_site = match self.store.newt(newt_id).await {
            Ok(Some(newt)) => newt.site_id,
            Ok(None) => {
                tracing::warn!(newt_id, "health report from unregistered newt");
                return;
            }
            Err(e) => {
                tracing::warn!(newt_id, error = %e, "failed to resolve reporting newt");
                return;
            }
        };
        let Some(bound_site) = bound_site else {
            tracing::warn!(newt_id, "health report from newt without a site");
            return;
        };

        // Sorted iteration keeps batches and the resulting fan-out
        // deterministic.
        let mut entries: Vec<(&String, &TargetStatusReport)> = report.targets.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut updated: Vec<i64> = Vec::new();
        let mut errors = 0usize;

        for (raw_id, target_report) in entries {
            let Ok(target_id) = raw_id.parse::<i64>() else {
                tracing::warn!(newt_id, raw_id = %raw_id, "unparseable target id in health report");
                errors += 1;
                continue;
            };
            let Ok(status) = target_report.status.parse::<HcHealth>() else {
                tracing::warn!(
                    newt_id,
                    target_id,
                    status = %target_report.status,
                    "unknown health status in report"
                );
                errors += 1;
                continue;
            };

            match self.store.target_site(target_id).await {
                Ok(Some(site_id)) if site_id == bound_site => {}
                Ok(_) => {
                    // Missing target or a target on a foreign site: rejected.
                    tracing::warn!(
                        newt_id,
                        target_id,
                        "rejecting health report for target outside reporter's site"
                    );
                    errors += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(newt_id, target_id, error = %e, "tenancy lookup failed");
                    errors += 1;
                    continue;
                }
            }

            if let Err(e) = self.store.set_target_health(target_id, status).await {
                tracing::warn!(newt_id, target_id, error = %e, "failed to persist health status");
                errors += 1;
                continue;
            }
            updated.push(target_id);
        }

        tracing::debug!(
            newt_id,
            updated = updated.len(),
            errors,
            "health report processed"
        );

        if let Err(e) = self.dns.on_health_check_update(&updated).await {
            tracing::warn!(newt_id, error = %e, "zone rebuild after health update failed");
        }
    }
}

#[async_trait]
impl MessageHandler for HealthIngestor {
    async fn handle(&self, agent_id: &str, kind: AgentKind, data: serde_json::Value) {
        if kind != AgentKind::Newt {
            tracing::warn!(agent_id, kind = %kind, "ignoring health report from non-newt agent");
            return;
        }
        let report: HealthStatusReport = match serde_json::from_value(data) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "dropping malformed health report");
                return;
            }
        };
        self.ingest(agent_id, report).await;
    }
}
