//! Per-queue statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::ring::Partition;

/// Live counters, updated by the workers without locks.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_bytes: AtomicU64,
    pub rx_pkts: AtomicU64,
    pub rx_ring_empty: AtomicU64,
    pub rx_err_no_buf: AtomicU64,
    pub rx_err_oflow: AtomicU64,
    pub rx_err_ver: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_pkts: AtomicU64,
    pub tx_ring_full: AtomicU64,
    pub tx_err_oversize: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Zero the packet counts, as a fresh link does.
    pub fn reset_packets(&self) {
        self.rx_pkts.store(0, Ordering::Relaxed);
        self.tx_pkts.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: usize,
    pub rx_bytes: u64,
    pub rx_pkts: u64,
    pub rx_ring_empty: u64,
    pub rx_err_no_buf: u64,
    pub rx_err_oflow: u64,
    /// Version mismatches and malformed headers.
    pub rx_err_ver: u64,
    /// RX ring within the local window.
    pub rx_partition: Partition,
    pub rx_offset: usize,
    pub tx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_ring_full: u64,
    /// Queued payloads dropped because a repartition made them too large.
    pub tx_err_oversize: u64,
    /// TX ring within the peer's window.
    pub tx_partition: Partition,
    pub tx_offset: usize,
    pub link_up: bool,
    pub rx_ring_timeout: Duration,
    pub tx_ring_timeout: Duration,
}

impl QueueStats {
    pub(crate) fn snapshot(counters: &Counters) -> Self {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Self {
            queue: 0,
            rx_bytes: load(&counters.rx_bytes),
            rx_pkts: load(&counters.rx_pkts),
            rx_ring_empty: load(&counters.rx_ring_empty),
            rx_err_no_buf: load(&counters.rx_err_no_buf),
            rx_err_oflow: load(&counters.rx_err_oflow),
            rx_err_ver: load(&counters.rx_err_ver),
            rx_partition: Partition::default(),
            rx_offset: 0,
            tx_bytes: load(&counters.tx_bytes),
            tx_pkts: load(&counters.tx_pkts),
            tx_ring_full: load(&counters.tx_ring_full),
            tx_err_oversize: load(&counters.tx_err_oversize),
            tx_partition: Partition::default(),
            tx_offset: 0,
            link_up: false,
            rx_ring_timeout: Duration::ZERO,
            tx_ring_timeout: Duration::ZERO,
        }
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NTB QP {} Stats:", self.queue)?;
        writeln!(f)?;
        writeln!(f, "rx_bytes - {}", self.rx_bytes)?;
        writeln!(f, "rx_pkts - {}", self.rx_pkts)?;
        writeln!(f, "rx_ring_empty - {}", self.rx_ring_empty)?;
        writeln!(f, "rx_err_no_buf - {}", self.rx_err_no_buf)?;
        writeln!(f, "rx_err_oflow - {}", self.rx_err_oflow)?;
        writeln!(f, "rx_err_ver - {}", self.rx_err_ver)?;
        writeln!(f, "rx_buff_begin - {:#x}", self.rx_partition.begin)?;
        writeln!(f, "rx_offset - {:#x}", self.rx_offset)?;
        writeln!(f, "rx_buff_end - {:#x}", self.rx_partition.end())?;
        writeln!(f)?;
        writeln!(f, "tx_bytes - {}", self.tx_bytes)?;
        writeln!(f, "tx_pkts - {}", self.tx_pkts)?;
        writeln!(f, "tx_ring_full - {}", self.tx_ring_full)?;
        writeln!(f, "tx_err_oversize - {}", self.tx_err_oversize)?;
        writeln!(f, "tx_mw_begin - {:#x}", self.tx_partition.begin)?;
        writeln!(f, "tx_offset - {:#x}", self.tx_offset)?;
        writeln!(f, "tx_mw_end - {:#x}", self.tx_partition.end())?;
        writeln!(f)?;
        writeln!(f, "rx_ring_timeout_ms - {}", self.rx_ring_timeout.as_millis())?;
        writeln!(f, "tx_ring_timeout_ms - {}", self.tx_ring_timeout.as_millis())?;
        writeln!(f)?;
        writeln!(f, "QP Link {}", if self.link_up { "Up" } else { "Down" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let counters = Counters::default();
        Counters::inc(&counters.rx_pkts);
        Counters::add(&counters.rx_bytes, 100);
        Counters::inc(&counters.tx_pkts);
        Counters::inc(&counters.tx_ring_full);

        let stats = QueueStats::snapshot(&counters);
        assert_eq!(stats.rx_pkts, 1);
        assert_eq!(stats.rx_bytes, 100);
        assert_eq!(stats.tx_ring_full, 1);

        counters.reset_packets();
        let stats = QueueStats::snapshot(&counters);
        assert_eq!(stats.rx_pkts, 0);
        assert_eq!(stats.tx_pkts, 0);
        assert_eq!(stats.rx_bytes, 100);
    }

    #[test]
    fn test_display() {
        let mut stats = QueueStats::snapshot(&Counters::default());
        stats.queue = 3;
        stats.rx_partition = Partition::new(0x800, 0x800);
        stats.link_up = true;
        stats.rx_ring_timeout = Duration::from_millis(100);

        let text = stats.to_string();
        assert!(text.starts_with("NTB QP 3 Stats:"));
        assert!(text.contains("rx_buff_begin - 0x800\n"));
        assert!(text.contains("rx_buff_end - 0x1000\n"));
        assert!(text.contains("rx_ring_timeout_ms - 100\n"));
        assert!(text.contains("tx_err_oversize - 0\n"));
        assert!(text.ends_with("QP Link Up\n"));
    }
}
