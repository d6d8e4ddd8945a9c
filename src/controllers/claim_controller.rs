//! PersistentVolumeClaim controller
//!
//! Watches claims in all namespaces, filters notifications and hands admitted
//! claims to the kube runtime, which queues them by identity and calls the
//! reconciler.

use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        reflector, watcher,
        watcher::Config as WatcherConfig,
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::adapters::ClaimKey;
use crate::controllers::backoff::FailureTracker;
use crate::controllers::Context;
use crate::error::{Error, Result};
use crate::filter::{self, Notification, NotificationTracker};
use crate::metrics;
use crate::reconcilers::Outcome;

/// Run the PersistentVolumeClaim controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PersistentVolumeClaim> = Api::all(client.clone());

    // Verify we are allowed to list claims before starting the watch
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Cannot list PersistentVolumeClaims: {}", e);
        return;
    }

    info!(
        max_concurrent_reconciles = context.max_concurrent_reconciles,
        "Starting PersistentVolumeClaim controller"
    );

    let (reader, writer) = reflector::store();
    let mut tracker = NotificationTracker::new();
    let filter_context = context.clone();
    let trigger = watcher(api, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .map_ok(move |event| {
            if matches!(event, watcher::Event::InitDone) {
                metrics::set_ready(true);
            }
            let notifications = tracker.observe(event);
            stream::iter(
                admitted(notifications, &filter_context.failures).map(Ok::<_, watcher::Error>),
            )
        })
        .try_flatten();

    Controller::for_stream(trigger, reader)
        .with_config(ControllerConfig::default().concurrency(context.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or(""),
                        "Reconciled PersistentVolumeClaim"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
}

/// Apply the event filter, keeping the claims worth reconciling.
///
/// Deleted claims never reach the reconciler again, so their failure counts
/// are forgotten here.
fn admitted(
    notifications: Vec<Notification<PersistentVolumeClaim>>,
    failures: &FailureTracker,
) -> impl Iterator<Item = PersistentVolumeClaim> {
    let mut claims = Vec::new();
    for notification in notifications {
        if matches!(notification, Notification::Delete { .. }) {
            failures.reset(&ClaimKey::from_claim(notification.object()));
        }

        let admit = filter::admits(&notification);
        let decision = if admit { "admitted" } else { "dropped" };
        metrics::FILTER_DECISIONS
            .with_label_values(&[notification.kind(), decision])
            .inc();
        if !admit {
            continue;
        }

        let claim = notification.object();
        debug!(
            name = %claim.name_any(),
            namespace = claim.namespace().as_deref().unwrap_or(""),
            kind = notification.kind(),
            "Admitted PVC notification"
        );
        claims.push(notification.into_object());
    }
    claims.into_iter()
}

/// Main reconciliation function
async fn reconcile(claim: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION.start_timer();

    // The cached object only supplies the identity; the reconciler re-reads
    let key = ClaimKey::from_claim(&claim);
    let outcome = ctx
        .reconciler
        .reconcile(&key, ctx.shutdown.child_token())
        .await;
    metrics::RECONCILIATIONS
        .with_label_values(&[outcome.label()])
        .inc();

    action_for(outcome, &ctx.failures, &key)
}

/// Translate a reconcile outcome into what the runtime does with the claim
fn action_for(outcome: Outcome, failures: &FailureTracker, key: &ClaimKey) -> Result<Action> {
    match outcome {
        Outcome::Success(completion) => {
            failures.reset(key);
            debug!(claim = %key, ?completion, "PVC reconciliation complete");
            Ok(Action::await_change())
        }
        // Handed to error_policy, which requeues with backoff
        Outcome::RetryableFailure(e) => Err(e),
        Outcome::FatalFailure(e) => {
            failures.reset(key);
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[e.class()])
                .inc();
            error!(claim = %key, error = %e, "Dropping PVC request after unrecoverable error");
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the controller
fn error_policy(claim: Arc<PersistentVolumeClaim>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_for(error, &ctx.failures, &ClaimKey::from_claim(&claim))
}

fn requeue_for(error: &Error, failures: &FailureTracker, key: &ClaimKey) -> Action {
    let delay = failures.next_delay(key);
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[error.class()])
        .inc();
    warn!(
        claim = %key,
        error = %error,
        class = error.class(),
        retry_in = ?delay,
        "Reconciliation failed, scheduling retry"
    );

    Action::requeue(delay)
}
