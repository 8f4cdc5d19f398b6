//! Transport queue: one bidirectional channel over a memory window partition.
//!
//! Each queue owns an RX ring in a partition of a local memory window (the
//! peer writes it) and a TX ring in the matching partition of the peer's
//! window (we write it). Two worker threads move entries through the rings:
//!
//! - The TX worker takes entries off the queued list, writes header and
//!   payload into the peer's ring, publishes its cursor through the peer's
//!   TX offset scratchpad and rings the doorbell.
//! - The RX worker compares its cursor with the peer's published TX cursor,
//!   reads one message at a time into a posted client buffer and publishes
//!   its own cursor through the peer's RX offset scratchpad.
//!
//! Clients get completions back through `rx_dequeue`/`tx_dequeue` after the
//! matching handler has been called.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::DmaRegion;
use crate::config::TransportConfig;
use crate::entry::{Completion, Entry, EntryLists};
use crate::error::{Error, FatalError, Result};
use crate::hw::{NtbHardware, RX_OFFSET_SLOT, TX_OFFSET_SLOT, spad_index};
use crate::link::{LinkFlags, WorkKey, WorkKind};
use crate::packet::{HEADER_SIZE, PayloadHeader};
use crate::ring::{Partition, RingCursor};
use crate::stats::{Counters, QueueStats};
use crate::work::Scheduler;

/// Link and failure notifications delivered to the event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// The peer's queue is reachable and both rings were reset.
    LinkUp,
    /// The logical link went down.
    LinkDown,
    /// The queue hit an unrecoverable error and stopped.
    Fatal(FatalError),
}

type Handler<T> = Box<dyn Fn(&Queue<T>) + Send + Sync>;
type EventHandler<T> = Box<dyn Fn(&Queue<T>, QueueEvent) + Send + Sync>;

/// Client callbacks for one queue.
///
/// Handlers run on the queue's worker threads and on the transport's work
/// thread. They may call back into the queue (typically `rx_dequeue`,
/// `tx_dequeue` and `rx_enqueue`) but should not block.
pub struct QueueHandlers<T> {
    rx: Handler<T>,
    tx: Handler<T>,
    event: EventHandler<T>,
}

impl<T> Default for QueueHandlers<T> {
    fn default() -> Self {
        Self {
            rx: Box::new(|_| {}),
            tx: Box::new(|_| {}),
            event: Box::new(|_, _| {}),
        }
    }
}

impl<T> QueueHandlers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after a received message was moved to the RX completed list.
    pub fn on_rx<F>(mut self, f: F) -> Self
    where
        F: Fn(&Queue<T>) + Send + Sync + 'static,
    {
        self.rx = Box::new(f);
        self
    }

    /// Called after a sent message was moved to the TX completed list.
    pub fn on_tx<F>(mut self, f: F) -> Self
    where
        F: Fn(&Queue<T>) + Send + Sync + 'static,
    {
        self.tx = Box::new(f);
        self
    }

    /// Called on link transitions and fatal errors.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Queue<T>, QueueEvent) + Send + Sync + 'static,
    {
        self.event = Box::new(f);
        self
    }
}

/// Lengths of the six entry lists of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryCounts {
    pub rx_free: usize,
    pub rx_queued: usize,
    pub rx_completed: usize,
    pub tx_free: usize,
    pub tx_queued: usize,
    pub tx_completed: usize,
}

impl EntryCounts {
    pub fn rx_total(&self) -> usize {
        self.rx_free + self.rx_queued + self.rx_completed
    }

    pub fn tx_total(&self) -> usize {
        self.tx_free + self.tx_queued + self.tx_completed
    }
}

/// One direction's ring position.
pub(crate) struct RingState {
    pub partition: Partition,
    pub cursor: RingCursor,
    /// Next packet sequence number.
    pub seq: u32,
}

impl RingState {
    fn new() -> Self {
        Self {
            partition: Partition::default(),
            cursor: RingCursor::new(0),
            seq: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cursor.reset(self.partition.size);
        self.seq = 0;
    }
}

/// Result of one RX pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxOutcome {
    Delivered,
    Empty,
    NoBuffer,
    Desync,
    Overflow,
    PeerDown,
    LinkDown,
    Failed,
}

/// Result of processing one TX entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOutcome {
    Sent,
    Noop,
    /// The payload no longer fits the partition and was handed back unsent.
    Dropped,
    RingFull,
    LinkDown,
    Failed,
}

/// Level-triggered wakeup for a worker.
pub(crate) struct Wake {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wake {
    fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Sleep until notified or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// A transport queue.
///
/// Obtained through [`QueueHandle`](crate::QueueHandle), which dereferences
/// to this type, and passed to the client's handlers.
pub struct Queue<T> {
    pub(crate) index: usize,
    pub(crate) window: usize,
    pub(crate) hw: Arc<dyn NtbHardware>,
    rx_window: Arc<DmaRegion>,
    pub(crate) scheduler: Arc<Scheduler<WorkKey>>,
    pub(crate) config: TransportConfig,
    pub(crate) me: Weak<Queue<T>>,
    handlers: QueueHandlers<T>,

    pub(crate) rx_lists: EntryLists<T>,
    pub(crate) tx_lists: EntryLists<T>,
    pub(crate) rx_ring: Mutex<RingState>,
    pub(crate) tx_ring: Mutex<RingState>,
    max_payload: AtomicUsize,
    pub(crate) counters: Counters,

    pub(crate) link: LinkFlags,
    failed: Mutex<Option<FatalError>>,

    pub(crate) rx_wake: Wake,
    pub(crate) tx_wake: Wake,
    stop: AtomicBool,
    rx_ring_timeout: AtomicU64,
    tx_ring_timeout: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tx_thread: Mutex<Option<ThreadId>>,
}

impl<T: Send + 'static> Queue<T> {
    pub(crate) fn new(
        index: usize,
        window: usize,
        hw: Arc<dyn NtbHardware>,
        rx_window: Arc<DmaRegion>,
        scheduler: Arc<Scheduler<WorkKey>>,
        config: &TransportConfig,
        handlers: QueueHandlers<T>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            index,
            window,
            hw,
            rx_window,
            scheduler,
            config: config.clone(),
            me: me.clone(),
            handlers,
            rx_lists: EntryLists::new(config.num_entries),
            tx_lists: EntryLists::new(config.num_entries),
            rx_ring: Mutex::new(RingState::new()),
            tx_ring: Mutex::new(RingState::new()),
            max_payload: AtomicUsize::new(0),
            counters: Counters::default(),
            link: LinkFlags::new(),
            failed: Mutex::new(None),
            rx_wake: Wake::new(),
            tx_wake: Wake::new(),
            stop: AtomicBool::new(false),
            rx_ring_timeout: AtomicU64::new(config.rx_ring_timeout.as_nanos() as u64),
            tx_ring_timeout: AtomicU64::new(config.tx_ring_timeout.as_nanos() as u64),
            workers: Mutex::new(Vec::new()),
            tx_thread: Mutex::new(None),
        })
    }

    /// Spawn the RX and TX workers.
    pub(crate) fn start_workers(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();

        let queue = self.clone();
        let rx = thread::Builder::new()
            .name(format!("ntb-rx{}", self.index))
            .spawn(move || queue.rx_worker())?;
        workers.push(rx);

        let queue = self.clone();
        let tx = thread::Builder::new()
            .name(format!("ntb-tx{}", self.index))
            .spawn(move || queue.tx_worker())?;
        *self.tx_thread.lock() = Some(tx.thread().id());
        workers.push(tx);
        Ok(())
    }

    /// Stop and join both workers.
    ///
    /// Safe to call from a handler running on one of the workers; that
    /// worker is then left to exit on its own.
    pub(crate) fn stop_workers(&self) {
        self.stop.store(true, Ordering::Release);
        self.rx_wake.notify();
        self.tx_wake.notify();

        let me = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!("queue {}: worker panicked", self.index);
            }
        }
    }

    /// Whether the caller runs on the TX worker, i.e. inside the TX handler.
    pub(crate) fn on_tx_worker(&self) -> bool {
        *self.tx_thread.lock() == Some(thread::current().id())
    }

    /// Tear the queue down: link-down sentinel, workers, doorbell, work
    /// items, entries and the scratchpads the peer reads for this index.
    ///
    /// Nothing rings the doorbell once the sentinel is out.
    pub(crate) fn shutdown(&self) {
        self.link.set_client_ready(false);
        self.scheduler.cancel_sync(WorkKey::new(self.index, WorkKind::Announce));
        if self.link.qp_link() {
            self.send_link_down();
        }
        self.stop.store(true, Ordering::Release);

        self.hw.unregister_doorbell_callback(self.index);
        let index = self.index;
        self.scheduler.cancel_matching_sync(|key| key.queue == index);
        self.stop_workers();

        self.drain_lists();

        for slot in [TX_OFFSET_SLOT, RX_OFFSET_SLOT] {
            if let Err(e) = self.hw.write_remote_spad(spad_index(self.index, slot), 0) {
                warn!("queue {}: failed to clear scratchpad: {}", self.index, e);
            }
        }
        info!("queue {}: freed", self.index);
    }

    fn drain_lists(&self) {
        for (dir, lists) in [("rx", &self.rx_lists), ("tx", &self.tx_lists)] {
            for (name, list) in [("queued", &lists.queued), ("completed", &lists.completed)] {
                let entries = list.drain();
                if !entries.is_empty() {
                    warn!(
                        "queue {}: {} {} {} entries not reclaimed at teardown",
                        self.index,
                        entries.len(),
                        dir,
                        name
                    );
                }
            }
            lists.free.drain();
        }
    }

    #[inline]
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Client API
    // ------------------------------------------------------------------

    /// Post a receive buffer. Its length is the capacity offered to the ring.
    pub fn rx_enqueue(&self, token: T, buf: Vec<u8>) -> Result<()> {
        let mut entry = self.rx_lists.free.pop_front().ok_or(Error::OutOfMemory)?;
        let len = buf.len();
        entry.fill(token, buf, len);
        self.rx_lists.queued.push_back(entry);
        self.rx_wake.notify();
        Ok(())
    }

    /// Submit `buf` for transmission.
    ///
    /// A zero-length buffer is accepted and handed straight back to the free
    /// list without touching the ring or calling the TX handler.
    pub fn tx_enqueue(&self, token: T, buf: Vec<u8>) -> Result<()> {
        if let Some(fatal) = self.failure() {
            return Err(Error::QueueFailed(fatal));
        }
        if !self.link.qp_link() {
            return Err(Error::LinkDown);
        }
        let len = buf.len();
        let max = self.max_payload_size();
        if len > max {
            return Err(Error::PayloadTooLarge { len, max });
        }

        let mut entry = self.tx_lists.free.pop_front().ok_or(Error::OutOfMemory)?;
        entry.fill(token, buf, len);
        self.tx_lists.queued.push_back(entry);
        self.tx_wake.notify();
        Ok(())
    }

    /// Reclaim a transmitted buffer.
    ///
    /// A completion with `len == 0` was not sent: the payload stopped fitting
    /// after the partition shrank.
    pub fn tx_dequeue(&self) -> Option<Completion<T>> {
        let mut entry = self.tx_lists.completed.pop_front()?;
        let done = entry.take();
        self.tx_lists.free.push_back(entry);
        done
    }

    /// Take a received message.
    pub fn rx_dequeue(&self) -> Option<Completion<T>> {
        let mut entry = self.rx_lists.completed.pop_front()?;
        let done = entry.take();
        self.rx_lists.free.push_back(entry);
        done.map(|mut done| {
            done.buf.truncate(done.len);
            done
        })
    }

    /// Take back a posted receive buffer that was never filled.
    ///
    /// Only allowed while the client has not signalled link up.
    pub fn rx_remove(&self) -> Result<Option<Completion<T>>> {
        if self.link.client_ready() {
            return Err(Error::NotPermitted("rx_remove while client link is up"));
        }
        let Some(mut entry) = self.rx_lists.queued.pop_front() else {
            return Ok(None);
        };
        let done = entry.take().map(|mut done| {
            done.len = 0;
            done
        });
        self.rx_lists.free.push_back(entry);
        Ok(done)
    }

    /// Queue index, unique among live queues of a transport.
    #[inline]
    pub fn queue_number(&self) -> usize {
        self.index
    }

    /// Largest payload `tx_enqueue` accepts with the current partition.
    #[inline]
    pub fn max_payload_size(&self) -> usize {
        self.max_payload.load(Ordering::Acquire)
    }

    /// Fatal error the queue was failed with, if any.
    pub fn failure(&self) -> Option<FatalError> {
        *self.failed.lock()
    }

    pub fn rx_ring_timeout(&self) -> Duration {
        Duration::from_nanos(self.rx_ring_timeout.load(Ordering::Relaxed))
    }

    pub fn tx_ring_timeout(&self) -> Duration {
        Duration::from_nanos(self.tx_ring_timeout.load(Ordering::Relaxed))
    }

    /// Change how long the RX worker sleeps before retrying.
    pub fn set_rx_ring_timeout(&self, timeout: Duration) {
        self.rx_ring_timeout.store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Change how long the TX worker sleeps before retrying a full ring.
    pub fn set_tx_ring_timeout(&self, timeout: Duration) {
        self.tx_ring_timeout.store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Snapshot of the counters, ring positions and link state.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::snapshot(&self.counters);
        stats.queue = self.index;
        {
            let rx = self.rx_ring.lock();
            stats.rx_partition = rx.partition;
            stats.rx_offset = rx.cursor.offset();
        }
        {
            let tx = self.tx_ring.lock();
            stats.tx_partition = tx.partition;
            stats.tx_offset = tx.cursor.offset();
        }
        stats.link_up = self.link.qp_link();
        stats.rx_ring_timeout = self.rx_ring_timeout();
        stats.tx_ring_timeout = self.tx_ring_timeout();
        stats
    }

    /// Lengths of the six entry lists.
    pub fn entry_counts(&self) -> EntryCounts {
        let [rx_free, rx_queued, rx_completed] = self.rx_lists.counts();
        let [tx_free, tx_queued, tx_completed] = self.tx_lists.counts();
        EntryCounts {
            rx_free,
            rx_queued,
            rx_completed,
            tx_free,
            tx_queued,
            tx_completed,
        }
    }

    // ------------------------------------------------------------------
    // Partition and failure
    // ------------------------------------------------------------------

    /// Move both rings to `partition` and reset them.
    ///
    /// Waits for any RX or TX pass in progress.
    pub(crate) fn set_partition(&self, partition: Partition) {
        let mut rx = self.rx_ring.lock();
        let mut tx = self.tx_ring.lock();
        rx.partition = partition;
        rx.reset();
        tx.partition = partition;
        tx.reset();
        let max = partition.max_payload().min(self.config.max_payload);
        self.max_payload.store(max, Ordering::Release);
    }

    /// Move an existing queue to a re-split partition.
    ///
    /// The link must already be down. The peer's published cursors still
    /// point into the old partition, so the link stays down until the peer
    /// has reset them. Our own published cursors are zeroed right away.
    pub(crate) fn move_partition(&self, partition: Partition) {
        self.link.set_resync(true);
        self.set_partition(partition);
        for slot in [TX_OFFSET_SLOT, RX_OFFSET_SLOT] {
            if let Err(e) = self.hw.write_remote_spad(spad_index(self.index, slot), 0) {
                warn!("queue {}: failed to clear scratchpad: {}", self.index, e);
            }
        }
    }

    pub(crate) fn partition(&self) -> Partition {
        self.rx_ring.lock().partition
    }

    /// Fail the queue. Only the first error is kept and reported.
    pub(crate) fn fail(&self, fatal: FatalError) {
        {
            let mut failed = self.failed.lock();
            if failed.is_some() {
                return;
            }
            *failed = Some(fatal);
        }
        self.link.set_qp_link(false);
        error!("queue {}: {}", self.index, fatal);
        self.notify(QueueEvent::Fatal(fatal));
        self.rx_wake.notify();
        self.tx_wake.notify();
    }

    pub(crate) fn notify(&self, event: QueueEvent) {
        (self.handlers.event)(self, event);
    }

    /// Read the peer's cursor for `slot` from our scratchpad bank.
    ///
    /// The value is only trusted for the current pass.
    pub(crate) fn fetch_peer_cursor(
        &self,
        slot: usize,
        partition: Partition,
    ) -> std::result::Result<usize, FatalError> {
        let offset = self.hw.read_local_spad(spad_index(self.index, slot)) as usize;
        if !partition.contains(offset) {
            return Err(FatalError::OffsetOutOfBounds {
                queue: self.index,
                offset,
                size: partition.size,
            });
        }
        Ok(offset)
    }

    fn publish_cursor(&self, slot: usize, offset: usize) {
        if let Err(e) = self
            .hw
            .write_remote_spad(spad_index(self.index, slot), offset as u32)
        {
            warn!("queue {}: failed to publish cursor: {}", self.index, e);
        }
    }

    // ------------------------------------------------------------------
    // RX
    // ------------------------------------------------------------------

    fn rx_worker(self: Arc<Self>) {
        while !self.stopping() {
            match self.rx_process() {
                RxOutcome::Delivered | RxOutcome::Overflow => {}
                RxOutcome::Empty
                | RxOutcome::NoBuffer
                | RxOutcome::Desync
                | RxOutcome::PeerDown
                | RxOutcome::LinkDown
                | RxOutcome::Failed => self.rx_wake.wait(self.rx_ring_timeout()),
            }
        }
        trace!("queue {}: rx worker exit", self.index);
    }

    /// Consume at most one message from the RX ring.
    pub(crate) fn rx_process(&self) -> RxOutcome {
        if self.failure().is_some() {
            return RxOutcome::Failed;
        }
        let mut ring = self.rx_ring.lock();
        if !self.link.qp_link() {
            return RxOutcome::LinkDown;
        }
        let partition = ring.partition;

        let peer = match self.fetch_peer_cursor(TX_OFFSET_SLOT, partition) {
            Ok(peer) => peer,
            Err(fatal) => {
                drop(ring);
                self.fail(fatal);
                return RxOutcome::Failed;
            }
        };
        if ring.cursor.is_empty(peer) {
            Counters::inc(&self.counters.rx_ring_empty);
            return RxOutcome::Empty;
        }

        let Some(mut entry) = self.rx_lists.queued.pop_front() else {
            Counters::inc(&self.counters.rx_err_no_buf);
            return RxOutcome::NoBuffer;
        };

        let mut raw = [0u8; HEADER_SIZE];
        let header_at = partition.begin + ring.cursor.header_offset();
        if let Err(e) = self.rx_window.read_bytes(header_at, &mut raw) {
            self.rx_lists.queued.push_front(entry);
            drop(ring);
            warn!("queue {}: {}", self.index, e);
            self.fail(FatalError::OffsetOutOfBounds {
                queue: self.index,
                offset: header_at,
                size: partition.size,
            });
            return RxOutcome::Failed;
        }
        let header = PayloadHeader::from_bytes(&raw);

        if header.version != ring.seq {
            warn!(
                "queue {}: version mismatch, expected {} got {}",
                self.index, ring.seq, header.version
            );
            Counters::inc(&self.counters.rx_err_ver);
            self.rx_lists.queued.push_front(entry);
            return RxOutcome::Desync;
        }

        let len = header.len as usize;
        if len == 0 {
            if header.is_link_down() {
                let placement = ring.cursor.placement(0);
                ring.cursor.advance(&placement);
                self.publish_cursor(RX_OFFSET_SLOT, ring.cursor.offset());
                drop(ring);
                self.rx_lists.queued.push_front(entry);
                self.peer_link_down();
                return RxOutcome::PeerDown;
            }
            warn!("queue {}: zero-length payload without link-down flag", self.index);
            Counters::inc(&self.counters.rx_err_ver);
            self.rx_lists.queued.push_front(entry);
            return RxOutcome::Desync;
        }
        if len + HEADER_SIZE > partition.size {
            warn!(
                "queue {}: payload length {} exceeds ring of {} bytes",
                self.index, len, partition.size
            );
            Counters::inc(&self.counters.rx_err_ver);
            self.rx_lists.queued.push_front(entry);
            return RxOutcome::Desync;
        }

        let placement = ring.cursor.placement(len);
        if len > entry.buf.len() {
            warn!(
                "queue {}: {} byte payload overflows {} byte buffer",
                self.index,
                len,
                entry.buf.len()
            );
            Counters::inc(&self.counters.rx_err_oflow);
            ring.cursor.advance(&placement);
            ring.seq = ring.seq.wrapping_add(1);
            self.publish_cursor(RX_OFFSET_SLOT, ring.cursor.offset());
            self.rx_lists.queued.push_front(entry);
            return RxOutcome::Overflow;
        }

        let payload_at = partition.begin + placement.payload;
        if let Err(e) = self.rx_window.read_bytes(payload_at, &mut entry.buf[..len]) {
            self.rx_lists.queued.push_front(entry);
            drop(ring);
            warn!("queue {}: {}", self.index, e);
            self.fail(FatalError::OffsetOutOfBounds {
                queue: self.index,
                offset: payload_at,
                size: partition.size,
            });
            return RxOutcome::Failed;
        }
        entry.len = len;

        ring.cursor.advance(&placement);
        ring.seq = ring.seq.wrapping_add(1);
        self.publish_cursor(RX_OFFSET_SLOT, ring.cursor.offset());
        trace!(
            "queue {}: rx {} bytes at {:#x}, cursor {:#x}",
            self.index,
            len,
            placement.payload,
            ring.cursor.offset()
        );
        drop(ring);

        Counters::inc(&self.counters.rx_pkts);
        Counters::add(&self.counters.rx_bytes, len);
        self.rx_lists.completed.push_back(entry);
        (self.handlers.rx)(self);
        RxOutcome::Delivered
    }

    // ------------------------------------------------------------------
    // TX
    // ------------------------------------------------------------------

    fn tx_worker(self: Arc<Self>) {
        while !self.stopping() {
            let Some(entry) = self.tx_lists.queued.pop_front() else {
                self.tx_wake.wait(self.tx_ring_timeout());
                continue;
            };
            match self.tx_process(entry) {
                TxOutcome::Sent | TxOutcome::Noop | TxOutcome::Dropped => {}
                TxOutcome::RingFull | TxOutcome::LinkDown | TxOutcome::Failed => {
                    self.tx_wake.wait(self.tx_ring_timeout())
                }
            }
        }
        trace!("queue {}: tx worker exit", self.index);
    }

    /// Write one entry into the peer's ring, or put it back at the head of
    /// the queued list.
    pub(crate) fn tx_process(&self, mut entry: Entry<T>) -> TxOutcome {
        if entry.len == 0 && !entry.link_down {
            self.tx_lists.free.push_back(entry);
            return TxOutcome::Noop;
        }
        if self.failure().is_some() {
            return self.tx_give_up(entry, TxOutcome::Failed);
        }

        let mut ring = self.tx_ring.lock();
        if !self.link.qp_link() {
            drop(ring);
            return self.tx_give_up(entry, TxOutcome::LinkDown);
        }
        let partition = ring.partition;

        let Some(window) = self.hw.peer_window(self.window) else {
            drop(ring);
            return self.tx_give_up(entry, TxOutcome::LinkDown);
        };

        let tail = match self.fetch_peer_cursor(RX_OFFSET_SLOT, partition) {
            Ok(tail) => tail,
            Err(fatal) => {
                drop(ring);
                self.tx_lists.queued.push_front(entry);
                self.fail(fatal);
                return TxOutcome::Failed;
            }
        };

        if entry.len > partition.max_payload() {
            drop(ring);
            warn!(
                "queue {}: {} byte payload no longer fits the ring, dropped",
                self.index, entry.len
            );
            Counters::inc(&self.counters.tx_err_oversize);
            entry.len = 0;
            self.tx_lists.completed.push_back(entry);
            (self.handlers.tx)(self);
            return TxOutcome::Dropped;
        }

        let placement = match ring.cursor.reserve(entry.len, tail) {
            Ok(placement) => placement,
            Err(reason) => {
                trace!("queue {}: tx ring full ({:?})", self.index, reason);
                Counters::inc(&self.counters.tx_ring_full);
                self.tx_lists.queued.push_front(entry);
                return TxOutcome::RingFull;
            }
        };

        let header = if entry.link_down {
            PayloadHeader::link_down(ring.seq)
        } else {
            PayloadHeader::payload(entry.len as u32, ring.seq)
        };
        let written = window
            .write_bytes(partition.begin + placement.header, &header.to_bytes())
            .and_then(|()| {
                window.write_bytes(
                    partition.begin + placement.payload,
                    &entry.buf[..entry.len],
                )
            });
        if let Err(e) = written {
            drop(ring);
            warn!("queue {}: {}", self.index, e);
            self.tx_lists.queued.push_front(entry);
            self.fail(FatalError::OffsetOutOfBounds {
                queue: self.index,
                offset: placement.payload,
                size: partition.size,
            });
            return TxOutcome::Failed;
        }

        ring.cursor.advance(&placement);
        if !entry.link_down {
            ring.seq = ring.seq.wrapping_add(1);
        }
        self.publish_cursor(TX_OFFSET_SLOT, ring.cursor.offset());
        trace!(
            "queue {}: tx {} bytes at {:#x}, cursor {:#x}",
            self.index,
            entry.len,
            placement.payload,
            ring.cursor.offset()
        );
        drop(ring);

        if let Err(e) = self.hw.ring_doorbell(self.index) {
            warn!("queue {}: doorbell failed: {}", self.index, e);
        }

        if entry.link_down {
            self.tx_lists.free.push_back(entry);
            self.link.sentinel_sent();
            return TxOutcome::Sent;
        }

        Counters::inc(&self.counters.tx_pkts);
        Counters::add(&self.counters.tx_bytes, entry.len);
        self.tx_lists.completed.push_back(entry);
        (self.handlers.tx)(self);
        TxOutcome::Sent
    }

    /// Requeue an entry that cannot go out now. A sentinel that cannot go
    /// out has nobody left to tell and is dropped.
    fn tx_give_up(&self, entry: Entry<T>, outcome: TxOutcome) -> TxOutcome {
        if entry.link_down {
            self.tx_lists.free.push_back(entry);
            self.link.sentinel_sent();
        } else {
            self.tx_lists.queued.push_front(entry);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConfig, LoopbackNtb, LoopbackPort};

    /// A queue on one end of a loopback pair, with no workers running and
    /// the peer's window programmed so the TX path has somewhere to write.
    fn standalone_queue(entries: usize) -> (Arc<Queue<u32>>, Arc<DmaRegion>) {
        let (queue, remote, _) = standalone_queue_on(entries, 1024);
        (queue, remote)
    }

    /// Same as `standalone_queue` with a `size`-byte partition, also handing
    /// back the peer end of the bridge.
    fn standalone_queue_on(
        entries: usize,
        size: usize,
    ) -> (Arc<Queue<u32>>, Arc<DmaRegion>, LoopbackPort) {
        let (a, b) = LoopbackNtb::pair(LoopbackConfig::new().with_window_size(4096));
        let local = Arc::new(DmaRegion::new(4096, 4096).unwrap());
        let remote = Arc::new(DmaRegion::new(4096, 4096).unwrap());
        a.set_window_base(0, local.clone()).unwrap();
        b.set_window_base(0, remote.clone()).unwrap();

        let hw: Arc<dyn NtbHardware> = Arc::new(a);
        let config = TransportConfig::new().with_num_entries(entries);
        let scheduler = Arc::new(Scheduler::new("test-work").unwrap());
        let queue = Queue::new(0, 0, hw, local, scheduler, &config, QueueHandlers::new());
        queue.set_partition(Partition::new(0, size));
        (queue, remote, b)
    }

    #[test]
    fn test_enqueue_requires_link() {
        let (queue, _) = standalone_queue(4);
        assert!(matches!(
            queue.tx_enqueue(1, vec![0; 8]),
            Err(Error::LinkDown)
        ));
        queue.link.set_qp_link(true);
        assert!(queue.tx_enqueue(1, vec![0; 8]).is_ok());
    }

    #[test]
    fn test_enqueue_size_limit() {
        let (queue, _) = standalone_queue(4);
        queue.link.set_qp_link(true);
        let max = queue.max_payload_size();
        assert_eq!(max, (1024 - 1) / 2 - HEADER_SIZE);
        assert!(queue.tx_enqueue(1, vec![0; max]).is_ok());
        assert!(matches!(
            queue.tx_enqueue(2, vec![0; max + 1]),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_enqueue_out_of_entries() {
        let (queue, _) = standalone_queue(2);
        queue.link.set_qp_link(true);
        queue.tx_enqueue(1, vec![1]).unwrap();
        queue.tx_enqueue(2, vec![2]).unwrap();
        assert!(matches!(queue.tx_enqueue(3, vec![3]), Err(Error::OutOfMemory)));

        queue.rx_enqueue(1, vec![0; 16]).unwrap();
        queue.rx_enqueue(2, vec![0; 16]).unwrap();
        assert!(matches!(queue.rx_enqueue(3, vec![0; 16]), Err(Error::OutOfMemory)));
    }

    #[test]
    fn test_tx_process_writes_ring() {
        let (queue, remote) = standalone_queue(4);
        queue.link.set_qp_link(true);
        queue.tx_enqueue(9, b"hello".to_vec()).unwrap();

        let entry = queue.tx_lists.queued.pop_front().unwrap();
        assert_eq!(queue.tx_process(entry), TxOutcome::Sent);

        let mut raw = [0u8; HEADER_SIZE];
        remote.read_bytes(0, &mut raw).unwrap();
        let header = PayloadHeader::from_bytes(&raw);
        assert_eq!(header.len, 5);
        assert_eq!(header.version, 0);
        assert!(header.link());

        let mut payload = [0u8; 5];
        remote.read_bytes(HEADER_SIZE, &mut payload).unwrap();
        assert_eq!(&payload, b"hello");

        let done = queue.tx_dequeue().unwrap();
        assert_eq!(done.token, 9);
        assert_eq!(queue.stats().tx_pkts, 1);
        assert_eq!(queue.stats().tx_offset, HEADER_SIZE + 5);
    }

    #[test]
    fn test_zero_length_tx_is_noop() {
        let (queue, _) = standalone_queue(4);
        queue.link.set_qp_link(true);
        queue.tx_enqueue(1, Vec::new()).unwrap();
        let entry = queue.tx_lists.queued.pop_front().unwrap();
        assert_eq!(queue.tx_process(entry), TxOutcome::Noop);
        assert_eq!(queue.entry_counts().tx_free, 4);
        assert!(queue.tx_dequeue().is_none());
        assert_eq!(queue.stats().tx_offset, 0);
    }

    #[test]
    fn test_rx_remove_only_before_link_up() {
        let (queue, _) = standalone_queue(4);
        queue.rx_enqueue(5, vec![0; 32]).unwrap();
        let done = queue.rx_remove().unwrap().unwrap();
        assert_eq!(done.token, 5);
        assert_eq!(done.buf.len(), 32);
        assert!(queue.rx_remove().unwrap().is_none());

        queue.link.set_client_ready(true);
        assert!(matches!(queue.rx_remove(), Err(Error::NotPermitted(_))));
    }

    #[test]
    fn test_rx_empty_and_no_buffer() {
        let (queue, _) = standalone_queue(4);
        queue.link.set_qp_link(true);
        assert_eq!(queue.rx_process(), RxOutcome::Empty);
        assert_eq!(queue.stats().rx_ring_empty, 1);
    }

    #[test]
    fn test_fail_is_reported_once() {
        let (queue, _) = standalone_queue(4);
        queue.link.set_qp_link(true);
        queue.fail(FatalError::HardwareError);
        queue.fail(FatalError::OffsetOutOfBounds {
            queue: 0,
            offset: 1,
            size: 0,
        });
        assert_eq!(queue.failure(), Some(FatalError::HardwareError));
        assert!(!queue.link.qp_link());
        assert!(matches!(
            queue.tx_enqueue(1, vec![1]),
            Err(Error::QueueFailed(FatalError::HardwareError))
        ));
    }

    #[test]
    fn test_oversize_after_shrink_is_dropped() {
        let (queue, _, _) = standalone_queue_on(4, 4096);
        queue.link.set_qp_link(true);
        queue.tx_enqueue(1, vec![7; 2000]).unwrap();
        queue.tx_enqueue(2, b"small".to_vec()).unwrap();

        queue.set_partition(Partition::new(0, 2048));
        assert!(queue.max_payload_size() < 2000);

        let entry = queue.tx_lists.queued.pop_front().unwrap();
        assert_eq!(queue.tx_process(entry), TxOutcome::Dropped);
        let done = queue.tx_dequeue().unwrap();
        assert_eq!(done.token, 1);
        assert_eq!(done.len, 0);
        assert_eq!(done.buf.len(), 2000);

        let entry = queue.tx_lists.queued.pop_front().unwrap();
        assert_eq!(queue.tx_process(entry), TxOutcome::Sent);
        assert_eq!(queue.tx_dequeue().unwrap().token, 2);

        let stats = queue.stats();
        assert_eq!(stats.tx_err_oversize, 1);
        assert_eq!(stats.tx_pkts, 1);
        assert_eq!(stats.tx_ring_full, 0);
        assert_eq!(queue.entry_counts().tx_free, 4);
    }

    #[test]
    fn test_move_partition_zeroes_published_cursors() {
        let (queue, _, peer) = standalone_queue_on(4, 4096);
        queue.link.set_qp_link(true);
        queue.tx_enqueue(1, vec![1; 100]).unwrap();
        let entry = queue.tx_lists.queued.pop_front().unwrap();
        assert_eq!(queue.tx_process(entry), TxOutcome::Sent);
        assert_eq!(peer.read_local_spad(spad_index(0, TX_OFFSET_SLOT)), 116);

        assert!(queue.force_link_down());
        queue.move_partition(Partition::new(0, 2048));
        assert!(queue.link.resync());
        assert_eq!(peer.read_local_spad(spad_index(0, TX_OFFSET_SLOT)), 0);
        assert_eq!(peer.read_local_spad(spad_index(0, RX_OFFSET_SLOT)), 0);
        assert_eq!(queue.stats().tx_offset, 0);
        assert_eq!(queue.partition(), Partition::new(0, 2048));
    }

    #[test]
    fn test_tx_worker_thread_is_recorded() {
        let (queue, _) = standalone_queue(4);
        assert!(!queue.on_tx_worker());
        queue.start_workers().unwrap();
        assert!(!queue.on_tx_worker());
        queue.stop_workers();
    }
}
