//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Whether `/readyz` reports ready
static READY: AtomicBool = AtomicBool::new(false);

lazy_static::lazy_static! {
    /// Total number of reconciliations by outcome
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "liberator_reconciliations_total",
        "Total number of reconciliations by outcome",
        &["outcome"]
    ).unwrap();

    /// Total number of reconciliation errors by error class
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "liberator_reconciliation_errors_total",
        "Total number of reconciliation errors by class",
        &["class"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "liberator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// PersistentVolume claimRefs cleared
    pub static ref CLAIM_REFS_CLEARED: Counter = register_counter!(
        "liberator_claim_refs_cleared_total",
        "Total number of PersistentVolume claimRefs cleared"
    ).unwrap();

    /// PVC finalizers released
    pub static ref FINALIZERS_RELEASED: Counter = register_counter!(
        "liberator_finalizers_released_total",
        "Total number of PVC finalizers removed"
    ).unwrap();

    /// Event filter decisions by notification kind
    pub static ref FILTER_DECISIONS: CounterVec = register_counter_vec!(
        "liberator_filter_decisions_total",
        "Claim notifications admitted or dropped by the event filter",
        &["kind", "decision"]
    ).unwrap();

    /// Leader election status (1 = leading, 0 = standby)
    pub static ref LEADER: Gauge = register_gauge!(
        "liberator_leader",
        "Whether this replica currently holds the leader lease"
    ).unwrap();
}

/// Mark the controller ready (or not) for `/readyz`
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::Relaxed);
}

/// Initial readiness before the controller starts.
///
/// A replica that competes for the leader lease is ready as soon as it serves
/// probes, so standbys do not block rollouts. A lone replica becomes ready
/// once the claim watch completes its initial list.
pub fn init_readiness(leader_elect: bool) {
    set_ready(leader_elect);
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Relaxed)
}

/// Start an HTTP server for metrics and probes on `addr`
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" if is_ready() => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse::<hyper::header::HeaderValue>() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
