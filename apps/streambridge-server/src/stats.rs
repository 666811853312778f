use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use streambridge_protocol::StatsSnapshot;

/// Process-wide transfer counters, shared by the HTTP front, the acceptor
/// and the splice path. Everything is atomic; `bytes_transferred` is only
/// ever added to, so readers observe a monotone value.
pub struct ServerStats {
    started: Instant,
    files_registered: AtomicU64,
    files_transferred: AtomicU64,
    bytes_transferred: AtomicU64,
    active_connections: AtomicU64,
    peak_connections: AtomicU64,
    completed_downloads: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            files_registered: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            peak_connections: AtomicU64::new(0),
            completed_downloads: AtomicU64::new(0),
        }
    }
}

impl ServerStats {
    pub fn record_registration(&self) {
        self.files_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Called when a provider TCP connection is accepted. Returns the new
    /// active count for logging.
    pub fn connection_opened(&self) -> u64 {
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_connections.fetch_max(active, Ordering::AcqRel);
        active
    }

    pub fn connection_closed(&self) {
        // Saturating: a spurious double-close must not wrap the gauge.
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub fn add_bytes(&self, n: u64) {
        if n > 0 {
            self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_transfer(&self) {
        self.files_transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, registered_files: u64, active_streams: u64) -> StatsSnapshot {
        StatsSnapshot {
            status: "running".into(),
            uptime: self.started.elapsed().as_secs_f64(),
            files_registered: self.files_registered.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Acquire),
            peak_connections: self.peak_connections.load(Ordering::Acquire),
            registered_files,
            active_streams,
            completed_downloads: self.completed_downloads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_watermark() {
        let stats = ServerStats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_opened();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.active_connections, 2);
        assert_eq!(snap.peak_connections, 2);
        assert!(snap.peak_connections >= snap.active_connections);
    }

    #[test]
    fn close_without_open_does_not_wrap() {
        let stats = ServerStats::default();
        stats.connection_closed();
        assert_eq!(stats.snapshot(0, 0).active_connections, 0);
    }

    #[test]
    fn bytes_are_monotone() {
        let stats = ServerStats::default();
        stats.add_bytes(10);
        let before = stats.bytes_transferred();
        stats.add_bytes(0);
        stats.add_bytes(5);
        assert!(stats.bytes_transferred() >= before);
        assert_eq!(stats.bytes_transferred(), 15);
    }
}
