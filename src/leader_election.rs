//! Lease-based leader election
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! controller. Lease writes go through `replace` with the read
//! resourceVersion, so two candidates racing for an expired lease cannot both
//! win.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{api::PostParams, Api, Client};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Leader election settings
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// What to do with the lease as currently observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We hold the lease
    Renew,
    /// The lease is unheld or expired
    TakeOver,
    /// Someone else holds a live lease
    Wait { holder: String },
}

/// Decide how to act on `lease` at time `now`
pub fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let Some(spec) = lease.spec.as_ref() else {
        return LeaseDecision::TakeOver;
    };

    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseDecision::TakeOver;
    }
    if holder == identity {
        return LeaseDecision::Renew;
    }

    let last_renewed = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    match last_renewed {
        Some(renewed) if renewed + duration > now => LeaseDecision::Wait {
            holder: holder.to_string(),
        },
        _ => LeaseDecision::TakeOver,
    }
}

/// Competes for and holds the leader lease
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self { api, config }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// One acquire-or-renew attempt. Returns whether we hold the lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let name = self.config.lease_name.as_str();
        let existing = self.api.get_opt(name).await?;

        let written = match decide(existing.as_ref(), &self.config.identity, now) {
            LeaseDecision::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.held_spec(now, 0)),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            LeaseDecision::Renew => {
                let mut lease = existing.unwrap_or_default();
                let spec = lease.spec.get_or_insert_with(Default::default);
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                self.api.replace(name, &PostParams::default(), &lease).await
            }
            LeaseDecision::TakeOver => {
                let mut lease = existing.unwrap_or_default();
                let transitions = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0)
                    .saturating_add(1);
                lease.spec = Some(self.held_spec(now, transitions));
                self.api.replace(name, &PostParams::default(), &lease).await
            }
            LeaseDecision::Wait { holder } => {
                debug!(holder = %holder, "Leader lease held by another replica");
                return Ok(false);
            }
        };

        match written {
            Ok(_) => Ok(true),
            // Another candidate wrote first
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until we hold the lease. Returns `false` if shutdown came first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<bool> {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "Attempting to acquire leader lease"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    metrics::LEADER.set(1.0);
                    info!(identity = %self.config.identity, "Acquired leader lease");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to acquire leader lease"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing the lease until shutdown.
    ///
    /// If renewal has not succeeded within the renew deadline, leadership is
    /// lost: `shutdown` is cancelled and an error returned.
    pub async fn hold(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config.clone();
        renew_until_lost(&config, shutdown, || self.try_acquire_or_renew()).await
    }
}

/// Drive `renew` every half renew deadline until shutdown or until the lease
/// has gone unrenewed for the whole renew deadline.
///
/// Each attempt is bounded by the time left before the deadline, so a hung
/// API server cannot keep a replica leading past its lease.
pub async fn renew_until_lost<F, Fut>(
    config: &LeaseConfig,
    shutdown: CancellationToken,
    mut renew: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let interval = config.renew_deadline / 2;
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep(interval) => {}
        }

        let remaining = config.renew_deadline.saturating_sub(last_renewed.elapsed());
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            attempt = timeout(remaining, renew()) => match attempt {
                Ok(Ok(true)) => last_renewed = Instant::now(),
                Ok(Ok(false)) => warn!("Leader lease renewal was rejected"),
                Ok(Err(e)) => warn!(error = %e, "Failed to renew leader lease"),
                Err(_) => warn!(after = ?remaining, "Leader lease renewal timed out"),
            }
        }

        if last_renewed.elapsed() >= config.renew_deadline {
            metrics::LEADER.set(0.0);
            error!(identity = %config.identity, "Leader lease lost");
            shutdown.cancel();
            return Err(Error::LeadershipLost(format!(
                "lease {} not renewed within {:?}",
                config.lease_name, config.renew_deadline
            )));
        }
    }
}
