//! Router counters in Prometheus text exposition format.
//!
//! Counters are plain atomics so they can be read from a signal handler or
//! another thread while the event loop runs.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one router instance
#[derive(Debug)]
pub struct Metrics {
    /// Sessions currently in the registry (gauge)
    pub active_sessions: AtomicU64,
    /// Sessions created by admission or dial (counter)
    pub sessions_admitted_total: AtomicU64,
    /// Version negotiation packets sent (counter)
    pub version_negotiations_total: AtomicU64,
    /// Stateless retry packets sent (counter)
    pub retries_total: AtomicU64,
    /// Retry tokens that validated (counter)
    pub retry_tokens_validated: AtomicU64,
    /// Retry tokens rejected (counter)
    pub retry_token_failures: AtomicU64,
    /// Datagrams read from the socket (counter)
    pub datagrams_received_total: AtomicU64,
    /// Datagrams fully written to the socket (counter)
    pub datagrams_sent_total: AtomicU64,
    /// Short or failed datagram writes (counter)
    pub send_failures_total: AtomicU64,
    /// Sessions torn down (counter)
    pub sessions_closed_total: AtomicU64,
    pub start_time: Instant,
}

enum Kind {
    Counter,
    Gauge,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: Kind, value: u64) {
    // Writing to a String cannot fail
    let _ = writeln!(out, "# HELP quic_router_{} {}", name, help);
    let _ = writeln!(out, "# TYPE quic_router_{} {}", name, kind.as_str());
    let _ = writeln!(out, "quic_router_{} {}", name, value);
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_admitted_total: AtomicU64::new(0),
            version_negotiations_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            retry_tokens_validated: AtomicU64::new(0),
            retry_token_failures: AtomicU64::new(0),
            datagrams_received_total: AtomicU64::new(0),
            datagrams_sent_total: AtomicU64::new(0),
            send_failures_total: AtomicU64::new(0),
            sessions_closed_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a newly registered session
    pub fn session_opened(&self) {
        Self::incr(&self.sessions_admitted_total);
        Self::incr(&self.active_sessions);
    }

    /// Record a torn down session
    pub fn session_closed(&self) {
        Self::incr(&self.sessions_closed_total);
        // Saturate rather than wrap if counts ever disagree
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Render all counters
    pub fn render(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut out = String::new();

        write_metric(
            &mut out,
            "active_sessions",
            "Current number of live QUIC sessions",
            Kind::Gauge,
            load(&self.active_sessions),
        );
        write_metric(
            &mut out,
            "sessions_admitted_total",
            "Total sessions created",
            Kind::Counter,
            load(&self.sessions_admitted_total),
        );
        write_metric(
            &mut out,
            "version_negotiations_total",
            "Total version negotiation packets sent",
            Kind::Counter,
            load(&self.version_negotiations_total),
        );
        write_metric(
            &mut out,
            "retries_total",
            "Total stateless retry packets sent",
            Kind::Counter,
            load(&self.retries_total),
        );
        write_metric(
            &mut out,
            "retry_tokens_validated",
            "Total retry tokens successfully validated",
            Kind::Counter,
            load(&self.retry_tokens_validated),
        );
        write_metric(
            &mut out,
            "retry_token_failures",
            "Total retry token validation failures",
            Kind::Counter,
            load(&self.retry_token_failures),
        );
        write_metric(
            &mut out,
            "datagrams_received_total",
            "Total UDP datagrams received",
            Kind::Counter,
            load(&self.datagrams_received_total),
        );
        write_metric(
            &mut out,
            "datagrams_sent_total",
            "Total UDP datagrams sent",
            Kind::Counter,
            load(&self.datagrams_sent_total),
        );
        write_metric(
            &mut out,
            "send_failures_total",
            "Total short or failed datagram writes",
            Kind::Counter,
            load(&self.send_failures_total),
        );
        write_metric(
            &mut out,
            "sessions_closed_total",
            "Total sessions torn down",
            Kind::Counter,
            load(&self.sessions_closed_total),
        );
        write_metric(
            &mut out,
            "uptime_seconds",
            "Router uptime in seconds",
            Kind::Gauge,
            self.start_time.elapsed().as_secs(),
        );

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
