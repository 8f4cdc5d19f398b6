//! Common test utilities for transport integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ntb_transport::loopback::{LoopbackConfig, LoopbackNtb, LoopbackPort};
use ntb_transport::{NtbHardware, QueueEvent, QueueHandle, QueueHandlers, Transport, TransportConfig};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Transport configuration with short timers so tests settle quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig::new()
        .with_num_entries(64)
        .with_rx_ring_timeout(Duration::from_millis(5))
        .with_tx_ring_timeout(Duration::from_millis(1))
        .with_link_announce_interval(Duration::from_millis(20))
        .with_link_settle_delay(Duration::from_millis(1))
        .with_link_down_timeout(Duration::from_secs(1))
}

/// One host: its transport and its end of the bridge.
pub struct Host {
    pub port: Arc<LoopbackPort>,
    pub transport: Transport,
}

/// Two hosts joined by a loopback bridge.
pub struct TestPair {
    pub a: Host,
    pub b: Host,
}

impl TestPair {
    pub fn new(loopback: LoopbackConfig, config: TransportConfig) -> Self {
        init_logging();
        let (a, b) = LoopbackNtb::pair(loopback);
        let host = |port: LoopbackPort| {
            let port = Arc::new(port);
            let hw: Arc<dyn NtbHardware> = port.clone();
            Host {
                port,
                transport: Transport::new(hw, config.clone()).unwrap(),
            }
        };
        Self {
            a: host(a),
            b: host(b),
        }
    }
}

/// Everything a queue's handlers observed.
pub struct Mailbox {
    /// Receive buffer size re-posted after each message; 0 disables re-posting.
    pub rx_buf_size: usize,
    pub received: Mutex<Vec<Vec<u8>>>,
    pub events: Mutex<Vec<QueueEvent>>,
    pub sent: AtomicUsize,
    /// When false, the TX handler leaves completions for the test to take.
    pub reclaim_tx: bool,
}

impl Mailbox {
    pub fn new(rx_buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            rx_buf_size,
            received: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            reclaim_tx: true,
        })
    }

    pub fn without_tx_reclaim(rx_buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            rx_buf_size,
            received: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            reclaim_tx: false,
        })
    }

    pub fn handlers(self: &Arc<Self>) -> QueueHandlers<u64> {
        let rx = self.clone();
        let tx = self.clone();
        let ev = self.clone();
        QueueHandlers::new()
            .on_rx(move |q| {
                while let Some(msg) = q.rx_dequeue() {
                    assert_eq!(msg.buf.len(), msg.len);
                    rx.received.lock().push(msg.buf);
                    if rx.rx_buf_size > 0 {
                        let _ = q.rx_enqueue(msg.token, vec![0; rx.rx_buf_size]);
                    }
                }
            })
            .on_tx(move |q| {
                if !tx.reclaim_tx {
                    return;
                }
                while q.tx_dequeue().is_some() {
                    tx.sent.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_event(move |_, event| ev.events.lock().push(event))
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn event_count(&self, event: QueueEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

/// Poll `pred` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    pred()
}

/// A queue on each host, `rx_posted` receive buffers posted on each side and
/// both links up.
pub fn connect(
    pair: &TestPair,
    mailbox_a: &Arc<Mailbox>,
    mailbox_b: &Arc<Mailbox>,
    rx_posted: usize,
) -> (QueueHandle<u64>, QueueHandle<u64>) {
    let qa = pair.a.transport.create_queue(mailbox_a.handlers()).unwrap();
    let qb = pair.b.transport.create_queue(mailbox_b.handlers()).unwrap();
    assert_eq!(qa.queue_number(), qb.queue_number());

    for (queue, mailbox) in [(&qa, mailbox_a), (&qb, mailbox_b)] {
        for token in 0..rx_posted as u64 {
            queue.rx_enqueue(token, vec![0; mailbox.rx_buf_size]).unwrap();
        }
    }
    qa.link_up();
    qb.link_up();
    assert!(
        wait_until(WAIT, || qa.is_link_up() && qb.is_link_up()),
        "queue {} did not come up",
        qa.queue_number()
    );
    (qa, qb)
}

/// Deterministic payload for message `seq` of length `len`.
pub fn payload(seq: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seq * 31 + i * 7) as u8).collect()
}
