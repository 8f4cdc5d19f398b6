//! # ntb_transport - Message queues over a PCIe non-transparent bridge
//!
//! This crate turns the raw facilities of a non-transparent bridge (NTB) -
//! doorbells, scratchpad registers and memory windows - into reliable,
//! ordered, multiplexed message queues between two hosts.
//!
//! ## Features
//!
//! - **Byte rings in shared memory**: each queue writes length/sequence
//!   framed payloads into its partition of the peer's memory window
//! - **Cursor exchange through scratchpads**: no lock is shared between the
//!   hosts; each side publishes its cursor and polls the other's
//! - **Window sharing**: queues are spread over the memory windows and a
//!   window is re-split whenever a queue joins it
//! - **Per-queue link negotiation**: doorbell announcements bring queues up,
//!   a zero-length sentinel takes them down
//! - **Software loopback bridge** for running both ends in one process
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ntb_transport::loopback::{LoopbackConfig, LoopbackNtb};
//! use ntb_transport::{NtbHardware, QueueHandlers, Transport, TransportConfig};
//!
//! let (a, _b) = LoopbackNtb::pair(LoopbackConfig::default());
//! let hw: Arc<dyn NtbHardware> = Arc::new(a);
//! let transport = Transport::new(hw, TransportConfig::default())?;
//!
//! let queue = transport.create_queue(
//!     QueueHandlers::<u64>::new()
//!         .on_rx(|q| {
//!             while let Some(msg) = q.rx_dequeue() {
//!                 println!("received {} bytes", msg.len);
//!                 let _ = q.rx_enqueue(msg.token, vec![0; 2048]);
//!             }
//!         })
//!         .on_tx(|q| while q.tx_dequeue().is_some() {}),
//! )?;
//!
//! for token in 0..16 {
//!     queue.rx_enqueue(token, vec![0; 2048])?;
//! }
//! queue.link_up();
//!
//! // Once the peer's queue is up:
//! // queue.tx_enqueue(0, b"hello".to_vec())?;
//!
//! transport.free_queue(queue);
//! # Ok::<(), ntb_transport::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`hw`]: Hardware capability interface (`NtbHardware`)
//! - [`loopback`]: In-process bridge pair (`LoopbackNtb`)
//! - [`buffer`]: Memory window backing store (`DmaRegion`)
//! - [`packet`]: Payload header format (`PayloadHeader`)
//! - [`ring`]: Ring offset arithmetic
//! - [`entry`]: Entries and entry lists
//! - [`queue`]: Queue API and the RX/TX workers (`Queue`)
//! - [`link`]: Logical link negotiation
//! - [`work`]: Delayed work scheduler
//! - [`device`]: Transport device and queue table (`Transport`)
//! - [`stats`]: Per-queue statistics (`QueueStats`)

pub mod buffer;
pub mod config;
pub mod device;
pub mod entry;
pub mod error;
pub mod hw;
pub mod link;
pub mod loopback;
pub mod packet;
pub mod queue;
pub mod ring;
pub mod stats;
pub mod work;

// Re-export main types
pub use buffer::DmaRegion;
pub use config::TransportConfig;
pub use device::{QueueHandle, Transport};
pub use entry::Completion;
pub use error::{Error, FatalError, Result};
pub use hw::{HwEvent, NtbHardware};
pub use packet::{HEADER_SIZE, HeaderFlags, PayloadHeader};
pub use queue::{EntryCounts, Queue, QueueEvent, QueueHandlers};
pub use stats::QueueStats;
