#![forbid(unsafe_code)]

// Server counters - lock-free atomics rendered in Prometheus text format

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    auth_failures_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    resumes_total: AtomicU64,
    grace_expiries_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    connections_active: AtomicU64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                auth_failures_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                resumes_total: AtomicU64::new(0),
                grace_expiries_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
            }),
        }
    }

    pub fn inc_connections(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.inner.auth_failures_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_resumes(&self) {
        self.inner.resumes_total.fetch_add(1, Relaxed);
    }

    pub fn inc_grace_expiries(&self) {
        self.inner.grace_expiries_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    /// RAII gauge for the active-connection count.
    pub fn active_connection_guard(&self) -> ActiveConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ActiveConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn render_prometheus(&self, rooms: usize, sessions: usize) -> String {
        let mut out = String::with_capacity(1024);
        let counters: [(&str, &str, u64); 11] = [
            (
                "voxroom_connections_total",
                "WebSocket connections accepted",
                self.inner.connections_total.load(Relaxed),
            ),
            (
                "voxroom_auth_failures_total",
                "Connections rejected by the token gate",
                self.inner.auth_failures_total.load(Relaxed),
            ),
            (
                "voxroom_messages_received_total",
                "Requests received",
                self.inner.messages_received_total.load(Relaxed),
            ),
            (
                "voxroom_messages_sent_total",
                "Responses and events sent",
                self.inner.messages_sent_total.load(Relaxed),
            ),
            (
                "voxroom_errors_total",
                "Requests answered ok=false",
                self.inner.errors_total.load(Relaxed),
            ),
            (
                "voxroom_rooms_created_total",
                "Rooms created",
                self.inner.rooms_created_total.load(Relaxed),
            ),
            (
                "voxroom_joins_total",
                "Successful join requests",
                self.inner.joins_total.load(Relaxed),
            ),
            (
                "voxroom_resumes_total",
                "Successful resumeSession requests",
                self.inner.resumes_total.load(Relaxed),
            ),
            (
                "voxroom_grace_expiries_total",
                "Peers destroyed after the grace window",
                self.inner.grace_expiries_total.load(Relaxed),
            ),
            (
                "voxroom_producers_created_total",
                "Producers created",
                self.inner.producers_created_total.load(Relaxed),
            ),
            (
                "voxroom_consumers_created_total",
                "Consumers created",
                self.inner.consumers_created_total.load(Relaxed),
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let gauges: [(&str, &str, u64); 3] = [
            (
                "voxroom_connections_active",
                "Currently open WebSocket connections",
                self.inner.connections_active.load(Relaxed),
            ),
            ("voxroom_rooms", "Live rooms", rooms as u64),
            (
                "voxroom_sessions",
                "Sessions in active or grace state",
                sessions as u64,
            ),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

pub struct ActiveConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition_format() {
        let metrics = ServerMetrics::new();
        metrics.inc_connections();
        metrics.inc_joins();
        metrics.inc_joins();

        let body = metrics.render_prometheus(1, 2);
        assert!(body.contains("voxroom_connections_total 1"));
        assert!(body.contains("voxroom_joins_total 2"));
        assert!(body.contains("voxroom_rooms 1"));
        assert!(body.contains("voxroom_sessions 2"));
        assert!(body.contains("# TYPE voxroom_rooms gauge"));
    }

    #[test]
    fn active_connection_gauge_tracks_guards() {
        let metrics = ServerMetrics::new();
        let a = metrics.active_connection_guard();
        let b = metrics.active_connection_guard();
        assert!(metrics
            .render_prometheus(0, 0)
            .contains("voxroom_connections_active 2"));
        drop(a);
        drop(b);
        assert!(metrics
            .render_prometheus(0, 0)
            .contains("voxroom_connections_active 0"));
    }
}
