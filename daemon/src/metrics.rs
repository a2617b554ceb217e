//! Prometheus metrics export (SPEC_FULL.md §2.11, §6).
//!
//! The engine crate only bumps its own atomic counters (`sentry_core::
//! metrics::Counters`) and never links against `prometheus` itself; this
//! module is the daemon-side translation layer plus the `/metrics` and
//! `/health` HTTP endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use prometheus::{register_int_counter, IntCounter};
use sentry_core::metrics::Counters;

lazy_static::lazy_static! {
    static ref GARBAGE_FRAMES: IntCounter = register_int_counter!(
        "sentryd_garbage_frames_total",
        "Packets rejected by the length/family guard before reaching the pipeline"
    ).unwrap();

    static ref UNKNOWN_FAMILY: IntCounter = register_int_counter!(
        "sentryd_unknown_family_total",
        "Packets with an unrecognized L3 version nibble"
    ).unwrap();

    static ref MISSING_CTID: IntCounter = register_int_counter!(
        "sentryd_missing_ctid_total",
        "Packets accepted because no conntrack id could be extracted"
    ).unwrap();

    static ref CONNTRACK_GARBAGE: IntCounter = register_int_counter!(
        "sentryd_conntrack_garbage_total",
        "Conntrack messages with no usable attribute id"
    ).unwrap();

    static ref CONNTRACK_ERRORS: IntCounter = register_int_counter!(
        "sentryd_conntrack_errors_total",
        "Conntrack socket receive faults"
    ).unwrap();

    static ref CONNTRACK_DUMPS: IntCounter = register_int_counter!(
        "sentryd_conntrack_dumps_total",
        "Full conntrack table dumps triggered by the session sweeper"
    ).unwrap();

    static ref PLUGIN_PANICS: IntCounter = register_int_counter!(
        "sentryd_plugin_panics_total",
        "Pipeline subscriber invocations that panicked"
    ).unwrap();

    static ref PLUGIN_TIMEOUTS: IntCounter = register_int_counter!(
        "sentryd_plugin_timeouts_total",
        "Pipeline subscriber invocations that exceeded the handler deadline"
    ).unwrap();

    static ref SESSIONS_CREATED: IntCounter = register_int_counter!(
        "sentryd_sessions_created_total",
        "Sessions created in the session table"
    ).unwrap();

    static ref SESSIONS_EVICTED: IntCounter = register_int_counter!(
        "sentryd_sessions_evicted_total",
        "Sessions evicted from the session table"
    ).unwrap();

    static ref CERT_CACHE_HITS: IntCounter = register_int_counter!(
        "sentryd_cert_cache_hits_total",
        "Certificate cache lookups that found an existing holder"
    ).unwrap();

    static ref CERT_CACHE_MISSES: IntCounter = register_int_counter!(
        "sentryd_cert_cache_misses_total",
        "Certificate cache lookups that inserted a new pending holder"
    ).unwrap();

    static ref CERT_CACHE_INFLIGHT_JOINS: IntCounter = register_int_counter!(
        "sentryd_cert_cache_inflight_joins_total",
        "Concurrent requesters that joined an in-flight certificate fetch"
    ).unwrap();

    static ref CLASSIFY_CACHE_HITS: IntCounter = register_int_counter!(
        "sentryd_classify_cache_hits_total",
        "Classification lookups served from cache"
    ).unwrap();

    static ref CLASSIFY_CACHE_MISSES: IntCounter = register_int_counter!(
        "sentryd_classify_cache_misses_total",
        "Classification lookups that enqueued an upstream request"
    ).unwrap();

    static ref CLASSIFY_RETRIES: IntCounter = register_int_counter!(
        "sentryd_classify_retries_total",
        "Classification requests re-enqueued after a transport fault"
    ).unwrap();

    static ref CLASSIFY_UNKNOWN_REPLIES: IntCounter = register_int_counter!(
        "sentryd_classify_unknown_replies_total",
        "Classification requests that exhausted their retry budget"
    ).unwrap();

    static ref VERDICTS_SUBMITTED: IntCounter = register_int_counter!(
        "sentryd_verdicts_submitted_total",
        "Verdicts submitted back to the kernel packet queue"
    ).unwrap();
}

/// Pulls the engine's atomic snapshot forward into the process-wide
/// Prometheus registry. Counters only move forward, so each tick adds
/// the delta since the last observed value.
struct LastSeen {
    garbage_frames: u64,
    unknown_family: u64,
    missing_ctid: u64,
    conntrack_garbage: u64,
    conntrack_errors: u64,
    conntrack_dumps: u64,
    plugin_panics: u64,
    plugin_timeouts: u64,
    sessions_created: u64,
    sessions_evicted: u64,
    cert_cache_hits: u64,
    cert_cache_misses: u64,
    cert_cache_inflight_joins: u64,
    classify_cache_hits: u64,
    classify_cache_misses: u64,
    classify_retries: u64,
    classify_unknown_replies: u64,
    verdicts_submitted: u64,
}

impl Default for LastSeen {
    fn default() -> Self {
        LastSeen {
            garbage_frames: 0,
            unknown_family: 0,
            missing_ctid: 0,
            conntrack_garbage: 0,
            conntrack_errors: 0,
            conntrack_dumps: 0,
            plugin_panics: 0,
            plugin_timeouts: 0,
            sessions_created: 0,
            sessions_evicted: 0,
            cert_cache_hits: 0,
            cert_cache_misses: 0,
            cert_cache_inflight_joins: 0,
            classify_cache_hits: 0,
            classify_cache_misses: 0,
            classify_retries: 0,
            classify_unknown_replies: 0,
            verdicts_submitted: 0,
        }
    }
}

macro_rules! advance {
    ($last:expr, $snap:expr, $field:ident, $metric:expr) => {{
        let delta = $snap.$field.saturating_sub($last.$field);
        if delta > 0 {
            $metric.inc_by(delta);
        }
        $last.$field = $snap.$field;
    }};
}

fn export_snapshot(last: &mut LastSeen, counters: &Counters) {
    let snap = counters.snapshot();
    advance!(last, snap, garbage_frames, GARBAGE_FRAMES);
    advance!(last, snap, unknown_family, UNKNOWN_FAMILY);
    advance!(last, snap, missing_ctid, MISSING_CTID);
    advance!(last, snap, conntrack_garbage, CONNTRACK_GARBAGE);
    advance!(last, snap, conntrack_errors, CONNTRACK_ERRORS);
    advance!(last, snap, conntrack_dumps, CONNTRACK_DUMPS);
    advance!(last, snap, plugin_panics, PLUGIN_PANICS);
    advance!(last, snap, plugin_timeouts, PLUGIN_TIMEOUTS);
    advance!(last, snap, sessions_created, SESSIONS_CREATED);
    advance!(last, snap, sessions_evicted, SESSIONS_EVICTED);
    advance!(last, snap, cert_cache_hits, CERT_CACHE_HITS);
    advance!(last, snap, cert_cache_misses, CERT_CACHE_MISSES);
    advance!(last, snap, cert_cache_inflight_joins, CERT_CACHE_INFLIGHT_JOINS);
    advance!(last, snap, classify_cache_hits, CLASSIFY_CACHE_HITS);
    advance!(last, snap, classify_cache_misses, CLASSIFY_CACHE_MISSES);
    advance!(last, snap, classify_retries, CLASSIFY_RETRIES);
    advance!(last, snap, classify_unknown_replies, CLASSIFY_UNKNOWN_REPLIES);
    advance!(last, snap, verdicts_submitted, VERDICTS_SUBMITTED);
}

/// Spawns the periodic exporter and the `/metrics` + `/health` HTTP
/// server. `ready` flips true once the orchestrator has finished
/// startup, so `/health` reflects real liveness (SPEC_FULL.md §6).
pub fn spawn(addr: SocketAddr, counters: Arc<Counters>, ready: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut last = LastSeen::default();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            export_snapshot(&mut last, &counters);
        }
    });

    tokio::spawn(async move {
        if let Err(err) = run_http_server(addr, ready).await {
            log::error!("metrics server error: {err}");
        }
    });
}

async fn run_http_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.clone();
                async move {
                    match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap();
                            Ok::<_, Infallible>(Response::new(Body::from(buffer)))
                        }
                        "/health" => {
                            if ready.load(Ordering::Acquire) {
                                Ok(Response::new(Body::from("OK")))
                            } else {
                                Ok(Response::builder()
                                    .status(503)
                                    .body(Body::from("starting"))
                                    .unwrap())
                            }
                        }
                        _ => Ok(Response::builder()
                            .status(404)
                            .body(Body::from("Not Found"))
                            .unwrap()),
                    }
                }
            }))
        }
    });

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_snapshot_only_advances_forward() {
        let counters = Counters::new();
        Counters::bump(&counters.garbage_frames);
        Counters::bump(&counters.garbage_frames);
        let mut last = LastSeen::default();
        export_snapshot(&mut last, &counters);
        assert_eq!(last.garbage_frames, 2);
        export_snapshot(&mut last, &counters);
        assert_eq!(last.garbage_frames, 2);
    }
}
