//! Drop counters and their Prometheus text exposition (spec §10.6,
//! supplemented feature "per-source/per-stage drop counters" per §11).
//!
//! Grounded in the teacher's `threads/prometheus.rs` (a bare `TcpListener`
//! serving a canned response) generalized into a real text-format exporter,
//! keyed the same way `collision.rs` keys its `DashMap` state: a small
//! `Copy` struct as the key, counts as plain atomics behind the map so
//! increments never need a write lock on the whole table.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DropKey {
    stage: String,
    reason: String,
}

/// Process-wide registry of dropped-message counters, one per `(stage,
/// reason)` pair (spec §11 "per-source/per-stage drop counters"). Cheap to
/// share: every pipeline worker holds an `Arc<DropCounters>` and calls
/// `record_drop` on its own hot path without contending with any other
/// stage's counters.
pub struct DropCounters {
    counts: DashMap<DropKey, AtomicU64>,
}

impl DropCounters {
    pub fn new() -> Self {
        DropCounters { counts: DashMap::new() }
    }

    pub fn record_drop(&self, stage: &str, reason: &str) {
        let key = DropKey {
            stage: stage.to_string(),
            reason: reason.to_string(),
        };
        self.counts.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stage: &str, reason: &str) -> u64 {
        let key = DropKey {
            stage: stage.to_string(),
            reason: reason.to_string(),
        };
        self.counts.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Renders every counter in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP collector_dropped_messages_total Messages dropped by stage and reason.\n");
        out.push_str("# TYPE collector_dropped_messages_total counter\n");
        let mut rows: Vec<_> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        rows.sort_by(|a, b| (a.0.stage.as_str(), a.0.reason.as_str()).cmp(&(b.0.stage.as_str(), b.0.reason.as_str())));
        for (key, count) in rows {
            out.push_str(&format!(
                "collector_dropped_messages_total{{stage=\"{}\",reason=\"{}\"}} {}\n",
                key.stage, key.reason, count
            ));
        }
        out
    }
}

impl Default for DropCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `/metrics` over plain HTTP/1.1 on `addr`, blocking the calling
/// thread; callers run this in its own named thread (spec §10.6).
pub fn serve(addr: SocketAddr, counters: std::sync::Arc<DropCounters>) {
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            error!("metrics listener failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("serving metrics on {}", addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => handle_connection(stream, &counters),
            Err(e) => error!("metrics connection failed: {}", e),
        }
    }
}

fn handle_connection(mut stream: TcpStream, counters: &DropCounters) {
    let body = counters.render_prometheus();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
        error!("failed writing metrics response: {}", e);
    }
    let _ = stream.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_stage_and_reason() {
        let counters = DropCounters::new();
        counters.record_drop("preprocessor", "decode_error");
        counters.record_drop("preprocessor", "decode_error");
        counters.record_drop("anonymization", "unsupported_field");

        assert_eq!(counters.get("preprocessor", "decode_error"), 2);
        assert_eq!(counters.get("anonymization", "unsupported_field"), 1);
        assert_eq!(counters.get("storage", "missing_template"), 0);
    }

    #[test]
    fn render_contains_every_counter() {
        let counters = DropCounters::new();
        counters.record_drop("preprocessor", "decode_error");

        let text = counters.render_prometheus();
        assert!(text.contains("collector_dropped_messages_total{stage=\"preprocessor\",reason=\"decode_error\"} 1"));
    }
}
