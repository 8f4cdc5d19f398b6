//! Hardware capability interface.
//!
//! The transport never touches bridge registers directly. Everything it needs
//! from the hardware (doorbells, scratchpads, memory window translation and
//! link status) goes through [`NtbHardware`]. A driver for a real bridge
//! implements this trait; [`crate::loopback`] provides an in-process pair.

use std::sync::Arc;

use crate::buffer::DmaRegion;
use crate::error::Result;

/// Scratchpads used per queue.
pub const SPADS_PER_QP: usize = 2;

/// Scratchpad slot carrying the writer's TX cursor.
pub const TX_OFFSET_SLOT: usize = 0;

/// Scratchpad slot carrying the reader's RX cursor.
pub const RX_OFFSET_SLOT: usize = 1;

/// Scratchpad index of `slot` for `queue`.
#[inline]
pub fn spad_index(queue: usize, slot: usize) -> usize {
    queue * SPADS_PER_QP + slot
}

/// Bridge-level event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwEvent {
    /// Physical link came up.
    LinkUp,
    /// Physical link went down.
    LinkDown,
    /// The bridge reported an unrecoverable error.
    HardwareError,
}

/// Called with the queue index when the peer rings that queue's doorbell.
pub type DoorbellCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Called on bridge-level events.
pub type EventCallback = Arc<dyn Fn(HwEvent) + Send + Sync>;

/// Capabilities the transport consumes from a non-transparent bridge.
///
/// Callbacks may be invoked from any thread, including from inside
/// `ring_doorbell` on the peer side, and must not block.
pub trait NtbHardware: Send + Sync {
    /// Claim the bridge for a transport. Fails with
    /// [`Error::AlreadyRegistered`](crate::Error::AlreadyRegistered) if one
    /// is already registered.
    fn register_transport(&self) -> Result<()>;

    /// Release the claim taken by `register_transport`.
    fn unregister_transport(&self);

    /// Doorbells available for queues.
    fn max_queues(&self) -> usize;

    /// Scratchpad registers available.
    fn spad_count(&self) -> usize;

    /// Number of memory windows.
    fn window_count(&self) -> usize;

    /// Size of memory window `window` in bytes.
    fn window_size(&self, window: usize) -> usize;

    /// Program the translation for window `window` so the peer can reach `region`.
    fn set_window_base(&self, window: usize, region: Arc<DmaRegion>) -> Result<()>;

    /// Remove the translation for window `window`.
    fn clear_window_base(&self, window: usize);

    /// The peer's memory window `window` as reached through the bridge, if
    /// the peer has programmed it.
    fn peer_window(&self, window: usize) -> Option<Arc<DmaRegion>>;

    /// Read a local scratchpad register (written by the peer).
    fn read_local_spad(&self, index: usize) -> u32;

    /// Write a scratchpad register on the peer.
    fn write_remote_spad(&self, index: usize, value: u32) -> Result<()>;

    /// Ring the peer's doorbell for `queue`.
    fn ring_doorbell(&self, queue: usize) -> Result<()>;

    fn register_doorbell_callback(&self, queue: usize, callback: DoorbellCallback) -> Result<()>;

    fn unregister_doorbell_callback(&self, queue: usize);

    fn register_event_callback(&self, callback: EventCallback) -> Result<()>;

    fn unregister_event_callback(&self);

    /// Physical link status.
    fn link_is_up(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spad_layout() {
        assert_eq!(spad_index(0, TX_OFFSET_SLOT), 0);
        assert_eq!(spad_index(0, RX_OFFSET_SLOT), 1);
        assert_eq!(spad_index(5, TX_OFFSET_SLOT), 10);
        assert_eq!(spad_index(5, RX_OFFSET_SLOT), 11);
    }
}
