//! In-process bridge connecting two transports.
//!
//! `LoopbackNtb::pair` returns the two ends of a simulated non-transparent
//! bridge. Each port has its own scratchpad bank and memory window table.
//! Writing a remote scratchpad on one port stores into the other port's bank,
//! ringing a doorbell invokes the other port's doorbell callback on the
//! calling thread, and `peer_window` hands out the region the other port's
//! transport programmed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::buffer::DmaRegion;
use crate::error::{Error, Result};
use crate::hw::{DoorbellCallback, EventCallback, HwEvent, NtbHardware};

/// Shape of a simulated bridge.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Doorbells (and thus queues) per side.
    /// Default: 8
    pub max_queues: usize,
    /// Scratchpad registers per side.
    /// Default: 16
    pub spad_count: usize,
    /// Memory windows per side.
    /// Default: 2
    pub window_count: usize,
    /// Size of every memory window.
    /// Default: 64 KiB
    pub window_size: usize,
    /// Physical link state at creation.
    /// Default: true
    pub link_up: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_queues: 8,
            spad_count: 16,
            window_count: 2,
            window_size: 64 * 1024,
            link_up: true,
        }
    }
}

impl LoopbackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_queues(mut self, max_queues: usize) -> Self {
        self.max_queues = max_queues;
        self
    }

    pub fn with_spad_count(mut self, spad_count: usize) -> Self {
        self.spad_count = spad_count;
        self
    }

    pub fn with_window_count(mut self, window_count: usize) -> Self {
        self.window_count = window_count;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_link_up(mut self, link_up: bool) -> Self {
        self.link_up = link_up;
        self
    }
}

/// State of one side of the bridge.
struct Side {
    registered: AtomicBool,
    spads: Box<[AtomicU32]>,
    windows: Mutex<Vec<Option<Arc<DmaRegion>>>>,
    doorbell_callbacks: Mutex<Vec<Option<DoorbellCallback>>>,
    event_callback: Mutex<Option<EventCallback>>,
    doorbells_rung: Box<[AtomicU64]>,
}

impl Side {
    fn new(config: &LoopbackConfig) -> Self {
        Self {
            registered: AtomicBool::new(false),
            spads: (0..config.spad_count).map(|_| AtomicU32::new(0)).collect(),
            windows: Mutex::new(vec![None; config.window_count]),
            doorbell_callbacks: Mutex::new(vec![None; config.max_queues]),
            event_callback: Mutex::new(None),
            doorbells_rung: (0..config.max_queues).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn raise(&self, event: HwEvent) {
        let callback = self.event_callback.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// Constructor for loopback bridge pairs.
pub struct LoopbackNtb;

impl LoopbackNtb {
    /// Create both ends of a bridge.
    pub fn pair(config: LoopbackConfig) -> (LoopbackPort, LoopbackPort) {
        let a = Arc::new(Side::new(&config));
        let b = Arc::new(Side::new(&config));
        let link = Arc::new(AtomicBool::new(config.link_up));
        (
            LoopbackPort {
                config: config.clone(),
                local: a.clone(),
                peer: b.clone(),
                link: link.clone(),
            },
            LoopbackPort {
                config,
                local: b,
                peer: a,
                link,
            },
        )
    }
}

/// One end of a loopback bridge.
pub struct LoopbackPort {
    config: LoopbackConfig,
    local: Arc<Side>,
    peer: Arc<Side>,
    link: Arc<AtomicBool>,
}

impl LoopbackPort {
    /// Change the physical link state, raising `LinkUp`/`LinkDown` on both ends.
    pub fn set_link(&self, up: bool) {
        if self.link.swap(up, Ordering::AcqRel) == up {
            return;
        }
        debug!("loopback: physical link {}", if up { "up" } else { "down" });
        let event = if up { HwEvent::LinkUp } else { HwEvent::LinkDown };
        self.local.raise(event);
        self.peer.raise(event);
    }

    /// Raise `HardwareError` on this end.
    pub fn raise_hardware_error(&self) {
        self.local.raise(HwEvent::HardwareError);
    }

    /// Doorbells this end has delivered for `queue`.
    pub fn doorbells_rung(&self, queue: usize) -> u64 {
        self.local
            .doorbells_rung
            .get(queue)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// The region this end's transport programmed for window `window`.
    pub fn local_window(&self, window: usize) -> Option<Arc<DmaRegion>> {
        self.local.windows.lock().get(window).cloned().flatten()
    }

    /// Whether a transport is registered on this end.
    pub fn is_registered(&self) -> bool {
        self.local.registered.load(Ordering::Acquire)
    }
}

impl NtbHardware for LoopbackPort {
    fn register_transport(&self) -> Result<()> {
        if self.local.registered.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRegistered);
        }
        Ok(())
    }

    fn unregister_transport(&self) {
        self.local.registered.store(false, Ordering::Release);
    }

    fn max_queues(&self) -> usize {
        self.config.max_queues
    }

    fn spad_count(&self) -> usize {
        self.config.spad_count
    }

    fn window_count(&self) -> usize {
        self.config.window_count
    }

    fn window_size(&self, _window: usize) -> usize {
        self.config.window_size
    }

    fn set_window_base(&self, window: usize, region: Arc<DmaRegion>) -> Result<()> {
        let mut windows = self.local.windows.lock();
        let slot = windows
            .get_mut(window)
            .ok_or_else(|| Error::Hardware(format!("no memory window {}", window)))?;
        if region.len() < self.config.window_size {
            return Err(Error::Hardware(format!(
                "window {} region of {} bytes is smaller than the window",
                window,
                region.len()
            )));
        }
        *slot = Some(region);
        Ok(())
    }

    fn clear_window_base(&self, window: usize) {
        if let Some(slot) = self.local.windows.lock().get_mut(window) {
            *slot = None;
        }
    }

    fn peer_window(&self, window: usize) -> Option<Arc<DmaRegion>> {
        self.peer.windows.lock().get(window).cloned().flatten()
    }

    fn read_local_spad(&self, index: usize) -> u32 {
        self.local
            .spads
            .get(index)
            .map_or(0, |spad| spad.load(Ordering::Acquire))
    }

    fn write_remote_spad(&self, index: usize, value: u32) -> Result<()> {
        let spad = self
            .peer
            .spads
            .get(index)
            .ok_or_else(|| Error::Hardware(format!("no scratchpad {}", index)))?;
        spad.store(value, Ordering::Release);
        Ok(())
    }

    fn ring_doorbell(&self, queue: usize) -> Result<()> {
        if queue >= self.config.max_queues {
            return Err(Error::Hardware(format!("no doorbell {}", queue)));
        }
        if !self.link.load(Ordering::Acquire) {
            return Err(Error::Hardware("physical link is down".into()));
        }
        self.local.doorbells_rung[queue].fetch_add(1, Ordering::AcqRel);
        trace!("loopback: doorbell {}", queue);

        let callback = self.peer.doorbell_callbacks.lock()[queue].clone();
        if let Some(callback) = callback {
            callback(queue);
        }
        Ok(())
    }

    fn register_doorbell_callback(&self, queue: usize, callback: DoorbellCallback) -> Result<()> {
        let mut callbacks = self.local.doorbell_callbacks.lock();
        let slot = callbacks
            .get_mut(queue)
            .ok_or_else(|| Error::Hardware(format!("no doorbell {}", queue)))?;
        *slot = Some(callback);
        Ok(())
    }

    fn unregister_doorbell_callback(&self, queue: usize) {
        if let Some(slot) = self.local.doorbell_callbacks.lock().get_mut(queue) {
            *slot = None;
        }
    }

    fn register_event_callback(&self, callback: EventCallback) -> Result<()> {
        *self.local.event_callback.lock() = Some(callback);
        Ok(())
    }

    fn unregister_event_callback(&self) {
        *self.local.event_callback.lock() = None;
    }

    fn link_is_up(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }
}
