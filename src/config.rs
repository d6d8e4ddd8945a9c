//! Command-line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::leader_election::LeaseConfig;

/// Name of the coordination Lease used for leader election
pub const LEADER_ELECTION_LEASE: &str = "liberator-leader-election";

/// Clears PersistentVolume claimRefs before releasing PVC finalizers
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the health and readiness probes bind to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Address the Prometheus metrics endpoint binds to
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Enable leader election so only one replica reconciles at a time
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Namespace holding the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub leader_election_namespace: String,

    /// Identity recorded as the Lease holder
    #[arg(long, env = "HOSTNAME", default_value = "liberator")]
    pub leader_election_id: String,

    /// Leader lease duration in seconds
    #[arg(long, env = "LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Seconds a leader keeps trying to renew before giving up leadership
    #[arg(long, env = "RENEW_DEADLINE_SECS", default_value_t = 10)]
    pub renew_deadline_secs: u64,

    /// Seconds between attempts to acquire the lease
    #[arg(long, env = "RETRY_PERIOD_SECS", default_value_t = 2)]
    pub retry_period_secs: u64,

    /// Maximum number of claims reconciled concurrently
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 3)]
    pub max_concurrent_reconciles: u16,

    /// Deadline for a single reconciliation, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info,kube=warn,hyper=warn")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_json: bool,
}

impl Config {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::config("--max-concurrent-reconciles must be at least 1"));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::config("--reconcile-timeout-secs must be at least 1"));
        }
        if self.leader_elect {
            if self.retry_period_secs == 0 {
                return Err(Error::config("--retry-period-secs must be at least 1"));
            }
            if self.renew_deadline_secs == 0 || self.renew_deadline_secs >= self.lease_duration_secs {
                return Err(Error::config(format!(
                    "--renew-deadline-secs ({}) must be between 1 and --lease-duration-secs ({})",
                    self.renew_deadline_secs, self.lease_duration_secs
                )));
            }
        }
        Ok(())
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Leader election settings
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_name: LEADER_ELECTION_LEASE.to_string(),
            namespace: self.leader_election_namespace.clone(),
            identity: self.leader_election_id.clone(),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}
