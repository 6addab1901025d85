use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters threaded through the storage engine. One handle per
/// storage; shared by reference, never global.
#[derive(Debug, Default)]
pub struct Stats {
    pub file_reads: AtomicU64,
    pub provided_bytes: AtomicU64,
    pub downloads: AtomicU64,
    pub downloaded_bytes: AtomicU64,
    pub disk_loads: AtomicU64,
    pub lat_ops: AtomicU64,
    pub lat_ns: AtomicU64,
}

/// Point-in-time copy of the counters, for periodic display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub file_reads: u64,
    pub provided_bytes: u64,
    pub downloads: u64,
    pub downloaded_bytes: u64,
    pub disk_loads: u64,
    pub lat_ops: u64,
    pub lat_ns: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64) {
        self.file_reads.fetch_add(1, Ordering::Relaxed);
        self.provided_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_disk_load(&self) {
        self.disk_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.lat_ops.fetch_add(1, Ordering::Relaxed);
        self.lat_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            file_reads: self.file_reads.load(Ordering::Relaxed),
            provided_bytes: self.provided_bytes.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            disk_loads: self.disk_loads.load(Ordering::Relaxed),
            lat_ops: self.lat_ops.load(Ordering::Relaxed),
            lat_ns: self.lat_ns.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Mean `read_part` latency, if any reads happened.
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.lat_ops == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.lat_ns / self.lat_ops))
    }
}

/// Formats a byte count with a binary-scaled suffix.
pub fn readable_size(size: u64) -> String {
    const SUFFIXES: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let mut value = size as f64;
    let mut index = 0;
    while value >= 1024.0 && index < SUFFIXES.len() - 1 {
        value /= 1024.0;
        index += 1;
    }
    if index == 0 {
        format!("{} {}", size, SUFFIXES[0])
    } else {
        format!("{:.2} {}", value, SUFFIXES[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.record_read(512);
        stats.record_read(512);
        stats.record_download(1024);
        stats.record_latency(Duration::from_micros(10));
        let snap = stats.snapshot();
        assert_eq!(snap.file_reads, 2);
        assert_eq!(snap.provided_bytes, 1024);
        assert_eq!(snap.downloads, 1);
        assert_eq!(snap.downloaded_bytes, 1024);
        assert_eq!(snap.mean_latency(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn readable_sizes() {
        assert_eq!(readable_size(0), "0 B");
        assert_eq!(readable_size(512), "512 B");
        assert_eq!(readable_size(2048), "2.00 KB");
        assert_eq!(readable_size(5 * 1024 * 1024), "5.00 MB");
    }
}
