// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one endpoint or client. Everything is relaxed
/// atomics; readers get a point-in-time snapshot, not a consistent cut.
#[derive(Default)]
pub struct ServiceMetrics {
    pub active_connections: AtomicU64,
    pub requests_received: AtomicU64,
    pub responses_sent: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_conn(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_conn(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_req(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_resp(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track() {
        let m = ServiceMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.inc_req();
        m.add_bytes_written(128);

        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.requests_received, 1);
        assert_eq!(snap.bytes_written, 128);
    }
}
