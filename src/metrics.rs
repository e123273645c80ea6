// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- WS session health --------
pub static WS_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_frames_total", "frames received per WS session"),
        &["session"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "WS session reconnects"),
        &["session"],
    )
    .unwrap()
});

pub static WS_SUB_ACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_subscription_acks_total", "subscription acks per WS session"),
        &["session"],
    )
    .unwrap()
});

// -------- Market mirrors --------
pub static CHECKSUM_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "book_checksum_failures_total",
            "depth checksum mismatches per instrument",
        ),
        &["inst_id"],
    )
    .unwrap()
});

// -------- Orders --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "orders_total",
            "order lifecycle events (label: event = created|create_rejected|finished|snapshot_dropped)",
        ),
        &["event"],
    )
    .unwrap()
});

pub static DEALS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deals_total", "fill deltas derived from order snapshots").unwrap());

// -------- REST --------
pub static REST_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rest_calls_total", "REST requests issued"), &["kind"]).unwrap()
});

pub static REST_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rest_errors_total", "REST failures (label: kind = transport|venue)"),
        &["kind"],
    )
    .unwrap()
});

// -------- Ledger readiness --------
pub static LEDGER_NOT_READY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "ledger_not_ready",
            "1 while a ledger record is latched stale (label: record)",
        ),
        &["record"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(WS_FRAMES.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_SUB_ACKS.clone())),
        REGISTRY.register(Box::new(CHECKSUM_FAILURES.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(DEALS.clone())),
        REGISTRY.register(Box::new(REST_CALLS.clone())),
        REGISTRY.register(Box::new(REST_ERRORS.clone())),
        REGISTRY.register(Box::new(LEDGER_NOT_READY.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("metrics bind {addr} failed: {e}");
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {e}"),
            }
        }
    });
}
