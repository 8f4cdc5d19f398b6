//! Transport device: memory windows, queue table and event fan-out.
//!
//! A [`Transport`] is created over one bridge and brings its device state up
//! lazily on the first `create_queue`. The device claims the bridge,
//! allocates and programs one [`DmaRegion`] per memory window, starts the
//! work thread and subscribes to bridge events. When the last queue is freed
//! all of that is released again.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::buffer::DmaRegion;
use crate::config::TransportConfig;
use crate::error::{Error, FatalError, Result};
use crate::hw::{HwEvent, NtbHardware, SPADS_PER_QP};
use crate::link::WorkKey;
use crate::queue::{Queue, QueueEvent, QueueHandlers};
use crate::ring::{MIN_PARTITION_SIZE, Partition};
use crate::work::Scheduler;

/// What the device needs from a queue, independent of the client token type.
pub(crate) trait QueueDriver: Send + Sync {
    fn index(&self) -> usize;
    fn partition(&self) -> Partition;
    fn set_partition(&self, partition: Partition);
    fn move_partition(&self, partition: Partition);
    fn force_link_down(&self) -> bool;
    fn schedule_announce(&self, delay: Duration);
    fn notify(&self, event: QueueEvent);
    fn fail(&self, fatal: FatalError);
}

impl<T: Send + 'static> QueueDriver for Queue<T> {
    fn index(&self) -> usize {
        self.index
    }

    fn partition(&self) -> Partition {
        Queue::partition(self)
    }

    fn set_partition(&self, partition: Partition) {
        Queue::set_partition(self, partition)
    }

    fn move_partition(&self, partition: Partition) {
        Queue::move_partition(self, partition)
    }

    fn force_link_down(&self) -> bool {
        Queue::force_link_down(self)
    }

    fn schedule_announce(&self, delay: Duration) {
        Queue::schedule_announce(self, delay)
    }

    fn notify(&self, event: QueueEvent) {
        Queue::notify(self, event)
    }

    fn fail(&self, fatal: FatalError) {
        Queue::fail(self, fatal)
    }
}

/// Live device state.
struct Device {
    windows: Vec<Arc<DmaRegion>>,
    window_sizes: Vec<usize>,
    queues: Vec<Option<Arc<dyn QueueDriver>>>,
    free_slots: BTreeSet<usize>,
    live: usize,
    scheduler: Arc<Scheduler<WorkKey>>,
}

impl Device {
    /// Claim the bridge and set up windows, the work thread and the event
    /// callback. Everything acquired is released again on failure.
    fn init(shared: &Arc<Shared>) -> Result<Self> {
        let hw = &shared.hw;
        hw.register_transport()?;

        let mut windows = Vec::new();
        let result = Self::init_claimed(shared, &mut windows);
        if result.is_err() {
            hw.unregister_event_callback();
            for window in 0..windows.len() {
                hw.clear_window_base(window);
            }
            hw.unregister_transport();
        }
        result
    }

    fn init_claimed(shared: &Arc<Shared>, windows: &mut Vec<Arc<DmaRegion>>) -> Result<Self> {
        let hw = &shared.hw;
        let config = &shared.config;

        let window_count = hw.window_count();
        if window_count == 0 {
            return Err(Error::Hardware("bridge has no memory windows".into()));
        }

        let mut window_sizes = Vec::with_capacity(window_count);
        for window in 0..window_count {
            let size = hw.window_size(window);
            if size < MIN_PARTITION_SIZE {
                return Err(Error::Hardware(format!(
                    "memory window {} of {} bytes is too small",
                    window, size
                )));
            }
            let region = Arc::new(DmaRegion::new(size, config.window_align)?);
            hw.set_window_base(window, region.clone())?;
            windows.push(region);
            window_sizes.push(size);
        }

        // Every queue needs its own doorbell, two scratchpads and a partition
        // large enough to hold a ring.
        let smallest = window_sizes.iter().copied().min().unwrap_or(0);
        let per_window = smallest / MIN_PARTITION_SIZE;
        let max_queues = hw
            .max_queues()
            .min(hw.spad_count() / SPADS_PER_QP)
            .min(config.max_queues.unwrap_or(usize::MAX))
            .min(per_window * window_count);
        if max_queues == 0 {
            return Err(Error::Hardware("bridge supports no queues".into()));
        }

        let scheduler = Arc::new(Scheduler::new("ntb-work")?);

        let weak: Weak<Shared> = Arc::downgrade(shared);
        hw.register_event_callback(Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(event);
            }
        }))?;

        info!(
            "transport up: {} queues over {} memory windows",
            max_queues, window_count
        );
        Ok(Self {
            windows: std::mem::take(windows),
            window_sizes,
            queues: vec![None; max_queues],
            free_slots: (0..max_queues).collect(),
            live: 0,
            scheduler,
        })
    }

    /// Release everything `init` acquired.
    fn teardown(&self, hw: &dyn NtbHardware) {
        hw.unregister_event_callback();
        self.scheduler.shutdown();
        for window in 0..self.windows.len() {
            hw.clear_window_base(window);
        }
        hw.unregister_transport();
        info!("transport down");
    }

    fn window_of(&self, index: usize) -> usize {
        index % self.windows.len()
    }

    /// Split `window` among its live queues and move every queue whose
    /// partition changed, except `joining`, which is only assigned its slice.
    ///
    /// Returns the queues whose link was forced down; they must be told
    /// after the device lock is released.
    fn repartition(&self, window: usize, joining: Option<usize>) -> Vec<Arc<dyn QueueDriver>> {
        let window_count = self.windows.len();
        let members: Vec<&Arc<dyn QueueDriver>> = self
            .queues
            .iter()
            .flatten()
            .filter(|queue| self.window_of(queue.index()) == window)
            .collect();
        let Some(slots) = members
            .iter()
            .map(|queue| queue.index() / window_count + 1)
            .max()
        else {
            return Vec::new();
        };

        let window_size = self.window_sizes[window];
        let mut forced = Vec::new();
        for queue in members {
            let partition = Partition::split(window_size, slots, queue.index() / window_count);
            if Some(queue.index()) == joining {
                queue.set_partition(partition);
                continue;
            }
            if queue.partition() == partition {
                continue;
            }
            debug!(
                "queue {}: partition moves to {:#x}+{:#x}",
                queue.index(),
                partition.begin,
                partition.size
            );
            if queue.force_link_down() {
                forced.push(queue.clone());
            }
            queue.move_partition(partition);
            queue.schedule_announce(Duration::ZERO);
        }
        forced
    }
}

/// State shared between a [`Transport`], its queue handles and the bridge
/// event callback.
struct Shared {
    hw: Arc<dyn NtbHardware>,
    config: TransportConfig,
    device: Mutex<Option<Device>>,
}

impl Shared {
    fn handle_event(&self, event: HwEvent) {
        let queues: Vec<Arc<dyn QueueDriver>> = match self.device.lock().as_ref() {
            Some(device) => device.queues.iter().flatten().cloned().collect(),
            None => return,
        };

        match event {
            HwEvent::LinkUp => {
                info!("physical link up");
                for queue in queues {
                    queue.schedule_announce(Duration::ZERO);
                }
            }
            HwEvent::LinkDown => {
                info!("physical link down");
                for queue in queues {
                    if queue.force_link_down() {
                        queue.notify(QueueEvent::LinkDown);
                    }
                }
            }
            HwEvent::HardwareError => {
                error!("bridge reported a hardware error");
                for queue in queues {
                    queue.fail(FatalError::HardwareError);
                }
            }
        }
    }

    /// Remove a queue from the table, tearing the device down if it was the
    /// last one.
    fn release<T: Send + 'static>(&self, queue: &Arc<Queue<T>>) {
        queue.shutdown();

        let mut guard = self.device.lock();
        let Some(device) = guard.as_mut() else {
            return;
        };
        let index = queue.index;
        if device.queues[index].take().is_none() {
            warn!("queue {}: freed twice", index);
            return;
        }
        device.free_slots.insert(index);
        device.live -= 1;
        if device.live == 0 {
            device.teardown(self.hw.as_ref());
            *guard = None;
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(device) = self.device.get_mut().take() {
            device.teardown(self.hw.as_ref());
        }
    }
}

/// Reliable multi-queue transport over one bridge.
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Create a transport. The bridge is not claimed until the first queue
    /// is created.
    pub fn new(hw: Arc<dyn NtbHardware>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                hw,
                config,
                device: Mutex::new(None),
            }),
        })
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Whether the device is currently initialized.
    pub fn is_active(&self) -> bool {
        self.shared.device.lock().is_some()
    }

    /// Number of live queues.
    pub fn live_queues(&self) -> usize {
        self.shared
            .device
            .lock()
            .as_ref()
            .map_or(0, |device| device.live)
    }

    /// Create a queue on the lowest free slot.
    ///
    /// The queue starts with its link down. Post receive buffers, then call
    /// [`Queue::link_up`].
    pub fn create_queue<T: Send + 'static>(
        &self,
        handlers: QueueHandlers<T>,
    ) -> Result<QueueHandle<T>> {
        let shared = &self.shared;
        let hw = &shared.hw;
        let mut guard = shared.device.lock();
        if guard.is_none() {
            *guard = Some(Device::init(shared)?);
        }
        let Some(device) = guard.as_mut() else {
            return Err(Error::NoFreeQueue);
        };

        let Some(index) = device.free_slots.first().copied() else {
            if device.live == 0 {
                device.teardown(hw.as_ref());
                *guard = None;
            }
            return Err(Error::NoFreeQueue);
        };
        let window = device.window_of(index);

        let queue = Queue::new(
            index,
            window,
            hw.clone(),
            device.windows[window].clone(),
            device.scheduler.clone(),
            &shared.config,
            handlers,
        );
        device.queues[index] = Some(queue.clone() as Arc<dyn QueueDriver>);
        device.free_slots.remove(&index);
        device.live += 1;
        let mut forced = device.repartition(window, Some(index));

        let weak = Arc::downgrade(&queue);
        let started = hw
            .register_doorbell_callback(
                index,
                Arc::new(move |_| {
                    if let Some(queue) = weak.upgrade() {
                        queue.on_doorbell();
                    }
                }),
            )
            .and_then(|()| queue.start_workers());

        if let Err(e) = started {
            warn!("queue {}: setup failed: {}", index, e);
            hw.unregister_doorbell_callback(index);
            queue.stop_workers();
            device.queues[index] = None;
            device.free_slots.insert(index);
            device.live -= 1;
            forced.extend(device.repartition(window, None));
            if device.live == 0 {
                device.teardown(hw.as_ref());
                *guard = None;
            }
            drop(guard);
            for other in forced {
                other.notify(QueueEvent::LinkDown);
            }
            return Err(e);
        }

        if hw.link_is_up() {
            queue.schedule_announce(Duration::ZERO);
        }
        drop(guard);

        for other in forced {
            other.notify(QueueEvent::LinkDown);
        }
        info!(
            "queue {}: created on window {} ({} byte partition)",
            index,
            window,
            queue.partition().size
        );
        Ok(QueueHandle {
            queue,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Free a queue: send the peer a link-down sentinel if the link is up,
    /// stop the workers and release every entry. Same as dropping the handle.
    pub fn free_queue<T: Send + 'static>(&self, handle: QueueHandle<T>) {
        drop(handle);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.shared.config)
            .field("live_queues", &self.live_queues())
            .finish()
    }
}

/// Owning handle of a queue. Dropping it frees the queue.
pub struct QueueHandle<T: Send + 'static> {
    queue: Arc<Queue<T>>,
    shared: Weak<Shared>,
}

impl<T: Send + 'static> Deref for QueueHandle<T> {
    type Target = Queue<T>;

    fn deref(&self) -> &Queue<T> {
        &self.queue
    }
}

impl<T: Send + 'static> Drop for QueueHandle<T> {
    fn drop(&mut self) {
        match self.shared.upgrade() {
            Some(shared) => shared.release(&self.queue),
            None => self.queue.shutdown(),
        }
    }
}
