//! Queue entries and the lists that own them.
//!
//! Every entry is created once, when the queue is created, and lives in
//! exactly one list from then on. Moving an entry is a pop from one list
//! followed by a push onto another; the entry is owned by value in between,
//! so it cannot be in two lists at once or be lost without the compiler
//! noticing.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// One client buffer in flight.
pub struct Entry<T> {
    id: u32,
    /// Client token, present from enqueue until the client takes it back.
    pub token: Option<T>,
    /// Client buffer. For RX its length is the capacity offered to the ring.
    pub buf: Vec<u8>,
    /// Payload length once completed.
    pub len: usize,
    /// Synthetic link-down sentinel.
    pub link_down: bool,
}

impl<T> Entry<T> {
    /// Create an empty entry with a unique id.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            token: None,
            buf: Vec::new(),
            len: 0,
            link_down: false,
        }
    }

    /// Entry id, unique within its queue and direction.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Load a client buffer.
    pub fn fill(&mut self, token: T, buf: Vec<u8>, len: usize) {
        self.token = Some(token);
        self.buf = buf;
        self.len = len;
        self.link_down = false;
    }

    /// Turn the entry into a link-down sentinel.
    pub fn fill_link_down(&mut self) {
        self.token = None;
        self.buf = Vec::new();
        self.len = 0;
        self.link_down = true;
    }

    /// Take the client's token and buffer, leaving the entry empty.
    pub fn take(&mut self) -> Option<Completion<T>> {
        let token = self.token.take()?;
        let buf = std::mem::take(&mut self.buf);
        let len = std::mem::take(&mut self.len);
        self.link_down = false;
        Some(Completion { token, buf, len })
    }
}

/// A buffer handed back to the client.
#[derive(Debug)]
pub struct Completion<T> {
    /// Token given at enqueue.
    pub token: T,
    /// The client's buffer. Received buffers are truncated to `len`.
    pub buf: Vec<u8>,
    /// Payload length.
    pub len: usize,
}

/// FIFO of entries behind its own lock.
pub struct EntryList<T> {
    entries: Mutex<VecDeque<Entry<T>>>,
}

impl<T> EntryList<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// List holding `count` fresh entries with ids `0..count`.
    pub fn with_entries(count: usize) -> Self {
        Self {
            entries: Mutex::new((0..count as u32).map(Entry::new).collect()),
        }
    }

    #[inline]
    pub fn push_back(&self, entry: Entry<T>) {
        self.entries.lock().push_back(entry);
    }

    /// Put an entry back at the head, ahead of everything queued after it.
    #[inline]
    pub fn push_front(&self, entry: Entry<T>) {
        self.entries.lock().push_front(entry);
    }

    #[inline]
    pub fn pop_front(&self) -> Option<Entry<T>> {
        self.entries.lock().pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<Entry<T>> {
        self.entries.lock().drain(..).collect()
    }

    /// Ids of the entries in list order.
    pub fn ids(&self) -> Vec<u32> {
        self.entries.lock().iter().map(Entry::id).collect()
    }
}

impl<T> Default for EntryList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three lists of one direction.
pub struct EntryLists<T> {
    /// Unused entries.
    pub free: EntryList<T>,
    /// Submitted by the client, not yet processed.
    pub queued: EntryList<T>,
    /// Processed, waiting for the client to dequeue.
    pub completed: EntryList<T>,
}

impl<T> EntryLists<T> {
    /// Lists for `count` entries, all free.
    pub fn new(count: usize) -> Self {
        Self {
            free: EntryList::with_entries(count),
            queued: EntryList::new(),
            completed: EntryList::new(),
        }
    }

    /// `[free, queued, completed]` lengths.
    pub fn counts(&self) -> [usize; 3] {
        [self.free.len(), self.queued.len(), self.completed.len()]
    }
}
