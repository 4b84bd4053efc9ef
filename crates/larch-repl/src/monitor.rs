//! Topology monitoring: periodic status reports over every component.
//!
//! The monitor aggregates the point-in-time status of the relay and each
//! domain into one serializable report, suitable for logging or scraping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::conflict::ConflictAlert;
use crate::domain::{DomainStatus, ReplicationDomain};
use crate::relay::{Relay, RelayStatus};

/// One aggregated status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    /// Report time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Relay status, when a relay is registered.
    pub relay: Option<RelayStatus>,
    /// Status of every registered domain.
    pub domains: Vec<DomainStatus>,
    /// Unresolved-conflict alerts across all domains.
    pub alerts: Vec<ConflictAlert>,
}

impl MonitorReport {
    /// True when every domain reports the same state vector (the topology
    /// has converged) and nothing is queued.
    pub fn converged(&self) -> bool {
        let mut states = self.domains.iter().map(|d| &d.state);
        let Some(first) = states.next() else {
            return true;
        };
        states.all(|s| s == first) && self.domains.iter().all(|d| d.pending == 0)
    }
}

/// Collects status from the components of one in-process topology.
#[derive(Default)]
pub struct Monitor {
    relay: Option<Arc<Relay>>,
    domains: Vec<Arc<ReplicationDomain>>,
}

impl Monitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the relay.
    pub fn set_relay(&mut self, relay: Arc<Relay>) {
        self.relay = Some(relay);
    }

    /// Register a domain.
    pub fn add_domain(&mut self, domain: Arc<ReplicationDomain>) {
        self.domains.push(domain);
    }

    /// Collect a report.
    pub fn report(&self) -> MonitorReport {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut alerts = Vec::new();
        let domains: Vec<DomainStatus> = self
            .domains
            .iter()
            .map(|d| {
                alerts.extend(d.conflict_alerts());
                d.status_report()
            })
            .collect();
        MonitorReport {
            timestamp_ms,
            relay: self.relay.as_ref().map(|r| r.status_report()),
            domains,
            alerts,
        }
    }

    /// Collect a report and emit it as a structured log event.
    pub fn log_report(&self) {
        let report = self.report();
        let rendered = serde_json::to_string(&report).unwrap_or_default();
        info!(
            domains = report.domains.len(),
            converged = report.converged(),
            alerts = report.alerts.len(),
            report = %rendered,
            "replication status"
        );
    }
}
