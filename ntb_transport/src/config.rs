//! Configuration types for the NTB transport.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of pre-allocated entries per queue direction.
pub const DEFAULT_NUM_ENTRIES: usize = 1000;

/// Default payload cap (the classic NTB transport MTU).
pub const DEFAULT_MAX_PAYLOAD: usize = 0x401E;

/// Default memory window allocation granularity.
pub const DEFAULT_WINDOW_ALIGN: usize = 4096;

/// Transport configuration.
///
/// Controls entry pool sizes, ring retry timing and link negotiation timing.
/// Shared by every queue created on a transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pre-allocated entries per direction per queue.
    /// Default: 1000
    pub num_entries: usize,
    /// Upper bound for `max_payload_size()`, on top of the ring bound.
    /// Default: 0x401E
    pub max_payload: usize,
    /// Memory window sizes are rounded up to this alignment.
    /// Default: 4096
    pub window_align: usize,
    /// Sleep before the RX worker retries after a failed pass.
    /// Default: 100ms
    pub rx_ring_timeout: Duration,
    /// Sleep before the TX worker retries a full ring.
    /// Default: 100ms
    pub tx_ring_timeout: Duration,
    /// Period of the doorbell re-announcement while the bridge link is up.
    /// Default: 1s
    pub link_announce_interval: Duration,
    /// Delay between a link trigger and the link event work.
    /// Default: 10ms
    pub link_settle_delay: Duration,
    /// How long `free_queue` waits for the link-down sentinel to go out.
    /// Default: 1s
    pub link_down_timeout: Duration,
    /// Optional cap on the number of queues below the hardware limit.
    /// Default: None
    pub max_queues: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            num_entries: DEFAULT_NUM_ENTRIES,
            max_payload: DEFAULT_MAX_PAYLOAD,
            window_align: DEFAULT_WINDOW_ALIGN,
            rx_ring_timeout: Duration::from_millis(100),
            tx_ring_timeout: Duration::from_millis(100),
            link_announce_interval: Duration::from_secs(1),
            link_settle_delay: Duration::from_millis(10),
            link_down_timeout: Duration::from_secs(1),
            max_queues: None,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of entries per direction.
    pub fn with_num_entries(mut self, num_entries: usize) -> Self {
        self.num_entries = num_entries;
        self
    }

    /// Set the payload cap.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set the memory window alignment.
    pub fn with_window_align(mut self, window_align: usize) -> Self {
        self.window_align = window_align;
        self
    }

    /// Set the RX retry timeout.
    pub fn with_rx_ring_timeout(mut self, timeout: Duration) -> Self {
        self.rx_ring_timeout = timeout;
        self
    }

    /// Set the TX retry timeout.
    pub fn with_tx_ring_timeout(mut self, timeout: Duration) -> Self {
        self.tx_ring_timeout = timeout;
        self
    }

    /// Set the link re-announcement period.
    pub fn with_link_announce_interval(mut self, interval: Duration) -> Self {
        self.link_announce_interval = interval;
        self
    }

    /// Set the link settle delay.
    pub fn with_link_settle_delay(mut self, delay: Duration) -> Self {
        self.link_settle_delay = delay;
        self
    }

    /// Set the link-down sentinel timeout.
    pub fn with_link_down_timeout(mut self, timeout: Duration) -> Self {
        self.link_down_timeout = timeout;
        self
    }

    /// Cap the number of queues.
    pub fn with_max_queues(mut self, max_queues: usize) -> Self {
        self.max_queues = Some(max_queues);
        self
    }

    /// Check the configuration for values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_entries == 0 {
            return Err(Error::InvalidConfig("num_entries cannot be 0".into()));
        }
        if self.max_payload == 0 {
            return Err(Error::InvalidConfig("max_payload cannot be 0".into()));
        }
        if !self.window_align.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "window_align must be a power of two, got {}",
                self.window_align
            )));
        }
        if self.rx_ring_timeout.is_zero() || self.tx_ring_timeout.is_zero() {
            return Err(Error::InvalidConfig("ring timeouts cannot be 0".into()));
        }
        if self.link_announce_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "link_announce_interval cannot be 0".into(),
            ));
        }
        if self.max_queues == Some(0) {
            return Err(Error::InvalidConfig("max_queues cannot be 0".into()));
        }
        Ok(())
    }
}
