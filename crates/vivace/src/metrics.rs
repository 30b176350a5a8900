use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters, written from the worker's event loop and read by the
/// server's reporter thread. Relaxed ordering: these are statistics, not
/// synchronization.
pub struct WorkerMetrics {
    pub active_conns: AtomicU64,
    pub req_count: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicU64::new(0),
            req_count: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_conn(&self) {
        let prev = self.active_conns.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "active connection count underflow");
    }

    #[inline]
    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = WorkerMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.inc_req();
        m.add_bytes(128);

        assert_eq!(m.active_conns.load(Ordering::Relaxed), 1);
        assert_eq!(m.req_count.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_sent.load(Ordering::Relaxed), 128);
    }
}
