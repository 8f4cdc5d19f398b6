//! Per-queue logical link negotiation.
//!
//! The logical link of a queue is separate from the physical bridge link.
//! A queue comes up when the peer rings its doorbell while it is down: after
//! a short settle delay both rings are reset and the client is told. While
//! the physical link is up every queue re-announces itself by ringing its
//! doorbell once per interval, so a doorbell lost before the peer's queue
//! existed is made up for on the next round. A queue goes down when the peer
//! sends the link-down sentinel, when the client asks for it, when its
//! partition is moved, or when the physical link drops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::hw::{RX_OFFSET_SLOT, TX_OFFSET_SLOT, spad_index};
use crate::queue::{Queue, QueueEvent, TxOutcome};

/// Kind of delayed work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkKind {
    /// Ring the doorbell to tell the peer this queue exists.
    Announce,
    /// Bring the logical link up.
    LinkUp,
    /// Bring the logical link down after the peer's sentinel.
    LinkDown,
}

/// Key of a delayed work item: one of each kind per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkKey {
    pub queue: usize,
    pub kind: WorkKind,
}

impl WorkKey {
    pub fn new(queue: usize, kind: WorkKind) -> Self {
        Self { queue, kind }
    }
}

/// Link state bits of one queue.
pub(crate) struct LinkFlags {
    qp_link: AtomicBool,
    client_ready: AtomicBool,
    /// Set when the partition moved under a queue; cleared once the peer
    /// has reset the cursors it publishes.
    resync: AtomicBool,
    sentinels: AtomicU64,
}

impl LinkFlags {
    pub fn new() -> Self {
        Self {
            qp_link: AtomicBool::new(false),
            client_ready: AtomicBool::new(false),
            resync: AtomicBool::new(false),
            sentinels: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn qp_link(&self) -> bool {
        self.qp_link.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_qp_link(&self, up: bool) {
        self.qp_link.store(up, Ordering::Release);
    }

    /// Set the logical link, returning the previous state.
    #[inline]
    pub fn swap_qp_link(&self, up: bool) -> bool {
        self.qp_link.swap(up, Ordering::AcqRel)
    }

    #[inline]
    pub fn client_ready(&self) -> bool {
        self.client_ready.load(Ordering::Acquire)
    }

    /// Set client readiness, returning the previous state.
    #[inline]
    pub fn set_client_ready(&self, ready: bool) -> bool {
        self.client_ready.swap(ready, Ordering::AcqRel)
    }

    #[inline]
    pub fn resync(&self) -> bool {
        self.resync.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_resync(&self, pending: bool) {
        self.resync.store(pending, Ordering::Release);
    }

    /// Sentinels the TX worker has finished with (sent or dropped).
    #[inline]
    pub fn sentinels(&self) -> u64 {
        self.sentinels.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sentinel_sent(&self) {
        self.sentinels.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Signal that the client is ready to exchange data.
    ///
    /// The logical link comes up once the peer's queue answers.
    pub fn link_up(&self) {
        if self.link.set_client_ready(true) {
            return;
        }
        debug!("queue {}: client ready", self.index);
        if self.hw.link_is_up() {
            self.schedule_announce(Duration::ZERO);
        }
    }

    /// Withdraw client readiness. If the logical link is up the peer is sent
    /// a link-down sentinel and the event handler sees `LinkDown`; otherwise
    /// this does nothing.
    ///
    /// Called from the TX handler, the sentinel is written directly instead
    /// of going through the queued list.
    pub fn link_down(&self) {
        self.link.set_client_ready(false);
        if self.send_link_down() {
            debug!("queue {}: link down by client", self.index);
            self.notify(QueueEvent::LinkDown);
        }
    }

    /// Logical link state.
    #[inline]
    pub fn is_link_up(&self) -> bool {
        self.link.qp_link()
    }

    /// Doorbell from the peer: new data while up, a link announcement while down.
    pub(crate) fn on_doorbell(&self) {
        if self.stopping() {
            return;
        }
        if self.link.qp_link() {
            self.rx_wake.notify();
            return;
        }
        if !self.link.client_ready() || self.failure().is_some() {
            return;
        }
        let me = self.me.clone();
        self.scheduler.schedule(
            WorkKey::new(self.index, WorkKind::LinkUp),
            self.config.link_settle_delay,
            move || {
                if let Some(queue) = me.upgrade() {
                    queue.link_up_work();
                }
            },
        );
    }

    /// (Re)arm the announcement, replacing one already pending.
    pub(crate) fn schedule_announce(&self, delay: Duration) {
        let me = self.me.clone();
        self.scheduler.reschedule(
            WorkKey::new(self.index, WorkKind::Announce),
            delay,
            move || {
                if let Some(queue) = me.upgrade() {
                    queue.announce();
                }
            },
        );
    }

    fn announce(&self) {
        if self.stopping() || self.failure().is_some() {
            return;
        }
        if !self.hw.link_is_up() {
            debug!("queue {}: physical link down, announcements stop", self.index);
            return;
        }
        if self.link.client_ready() {
            if let Err(e) = self.hw.ring_doorbell(self.index) {
                warn!("queue {}: announcement doorbell failed: {}", self.index, e);
            }
        }
        self.schedule_announce(self.config.link_announce_interval);
    }

    fn link_up_work(&self) {
        if self.stopping() || self.failure().is_some() {
            return;
        }
        if !self.link.client_ready() {
            debug!("queue {}: client not ready, link stays down", self.index);
            return;
        }
        if self.link.qp_link() {
            debug!("queue {}: link already up", self.index);
            return;
        }
        if self.link.resync() {
            if !self.peer_cursors_reset() {
                debug!("queue {}: peer cursors predate the new partition", self.index);
                return;
            }
            self.link.set_resync(false);
        }

        {
            let mut rx = self.rx_ring.lock();
            let mut tx = self.tx_ring.lock();
            rx.reset();
            tx.reset();
        }
        self.counters.reset_packets();
        for slot in [TX_OFFSET_SLOT, RX_OFFSET_SLOT] {
            if let Err(e) = self.hw.write_remote_spad(spad_index(self.index, slot), 0) {
                warn!("queue {}: failed to clear scratchpad: {}", self.index, e);
            }
        }

        self.link.set_qp_link(true);
        debug!("queue {}: link up", self.index);

        if self.hw.link_is_up() {
            self.schedule_announce(Duration::ZERO);
        }
        self.notify(QueueEvent::LinkUp);
        self.rx_wake.notify();
        self.tx_wake.notify();
    }

    /// Whether the peer has reset the cursors it publishes to us.
    ///
    /// The peer's RX cursor stays at zero from its reset until we send
    /// again, while its TX cursor may already have moved within the ring.
    fn peer_cursors_reset(&self) -> bool {
        let partition = self.partition();
        let rx = self.hw.read_local_spad(spad_index(self.index, RX_OFFSET_SLOT));
        let tx = self.hw.read_local_spad(spad_index(self.index, TX_OFFSET_SLOT));
        rx == 0 && partition.contains(tx as usize)
    }

    fn link_down_work(&self) {
        if self.stopping() {
            return;
        }
        if !self.link.swap_qp_link(false) {
            debug!("queue {}: link already down", self.index);
            return;
        }
        debug!("queue {}: link down by peer", self.index);
        self.notify(QueueEvent::LinkDown);
    }

    /// The RX worker consumed the peer's link-down sentinel.
    pub(crate) fn peer_link_down(&self) {
        debug!("queue {}: link-down sentinel received", self.index);
        let me = self.me.clone();
        self.scheduler.schedule(
            WorkKey::new(self.index, WorkKind::LinkDown),
            self.config.link_settle_delay,
            move || {
                if let Some(queue) = me.upgrade() {
                    queue.link_down_work();
                }
            },
        );
    }

    /// Drop the logical link without telling the peer or the client.
    ///
    /// Returns whether the link was up; the caller decides when to notify.
    pub(crate) fn force_link_down(&self) -> bool {
        self.scheduler.cancel_sync(WorkKey::new(self.index, WorkKind::LinkUp));
        self.link.swap_qp_link(false)
    }

    /// Send the link-down sentinel and drop the logical link.
    ///
    /// Waits up to `link_down_timeout` for a free TX entry and for the TX
    /// worker to get the sentinel out. On the TX worker itself nothing would
    /// make progress while we wait, so the sentinel goes out from here, ahead
    /// of anything still queued. Returns false if the link was down.
    pub(crate) fn send_link_down(&self) -> bool {
        if !self.link.qp_link() {
            return false;
        }
        let inline = self.on_tx_worker();
        let deadline = Instant::now() + self.config.link_down_timeout;
        let poll = Duration::from_millis(1);

        let entry = loop {
            if let Some(entry) = self.tx_lists.free.pop_front() {
                break Some(entry);
            }
            if inline || Instant::now() >= deadline {
                warn!("queue {}: no free TX entry for link-down sentinel", self.index);
                break None;
            }
            thread::sleep(poll);
        };

        if let Some(mut entry) = entry {
            entry.fill_link_down();
            if inline {
                if self.tx_process(entry) != TxOutcome::Sent {
                    warn!("queue {}: link-down sentinel not sent", self.index);
                }
                self.link.set_qp_link(false);
                return true;
            }
            let before = self.link.sentinels();
            self.tx_lists.queued.push_back(entry);
            self.tx_wake.notify();
            while self.link.sentinels() == before {
                if Instant::now() >= deadline {
                    warn!("queue {}: link-down sentinel not sent in time", self.index);
                    break;
                }
                thread::sleep(poll);
            }
        }

        self.link.set_qp_link(false);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_keys_order_by_queue() {
        let mut keys = vec![
            WorkKey::new(1, WorkKind::LinkUp),
            WorkKey::new(0, WorkKind::LinkDown),
            WorkKey::new(0, WorkKind::Announce),
        ];
        keys.sort();
        assert_eq!(keys[0], WorkKey::new(0, WorkKind::Announce));
        assert_eq!(keys[2].queue, 1);
    }

    #[test]
    fn test_link_flags() {
        let flags = LinkFlags::new();
        assert!(!flags.qp_link());
        assert!(!flags.swap_qp_link(true));
        assert!(flags.swap_qp_link(false));
        assert!(!flags.set_client_ready(true));
        assert!(flags.client_ready());

        flags.sentinel_sent();
        assert_eq!(flags.sentinels(), 1);

        assert!(!flags.resync());
        flags.set_resync(true);
        assert!(flags.resync());
    }
}
