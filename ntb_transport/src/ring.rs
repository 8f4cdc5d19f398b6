//! Ring offset arithmetic shared by the RX and TX paths.
//!
//! A queue's ring is a byte range (partition) of a memory window. Both sides
//! address it with offsets relative to the partition start. The writer owns
//! the write cursor and learns the reader's cursor through a scratchpad, and
//! the reader does the mirror image. Nothing is ever reserved atomically, so
//! the header and the payload each wrap to the partition start on their own
//! when they would straddle the end.

use crate::packet::HEADER_SIZE;

/// Smallest partition the transport will run a ring in.
pub const MIN_PARTITION_SIZE: usize = 8 * HEADER_SIZE;

/// Byte range of a memory window assigned to one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Partition {
    /// Offset of the first byte within the window.
    pub begin: usize,
    /// Length in bytes.
    pub size: usize,
}

impl Partition {
    /// Create a partition.
    pub fn new(begin: usize, size: usize) -> Self {
        Self { begin, size }
    }

    /// Partition `slot` out of `count` equal partitions of a `window_size` window.
    ///
    /// Trailing bytes left by the integer division stay unused.
    pub fn split(window_size: usize, count: usize, slot: usize) -> Self {
        debug_assert!(slot < count);
        let size = window_size / count;
        Self {
            begin: slot * size,
            size,
        }
    }

    /// One past the last byte within the window.
    #[inline]
    pub fn end(&self) -> usize {
        self.begin + self.size
    }

    /// Check that a ring-relative offset is inside the partition.
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        offset < self.size
    }

    /// Largest payload a ring of this size can carry under the 2x margin.
    #[inline]
    pub fn max_payload(&self) -> usize {
        (self.size.saturating_sub(1) / 2).saturating_sub(HEADER_SIZE)
    }
}

/// Free bytes between the write cursor `head` and the reader cursor `tail`.
///
/// Equal cursors mean the ring is empty, so the whole ring is free.
#[inline]
pub fn free_space(head: usize, tail: usize, size: usize) -> usize {
    debug_assert!(head < size && tail < size);
    if tail > head {
        tail - head
    } else {
        size - (head - tail)
    }
}

/// Whether `len` bytes of payload fit with the 2x safety margin.
///
/// The comparison is strict: exactly twice the message size is not enough.
#[inline]
pub fn has_room(free: usize, len: usize) -> bool {
    free > 2 * (len + HEADER_SIZE)
}

/// Position of an object of `len` bytes wanted at `pos`: `pos` itself, or the
/// partition start when it would straddle the end.
#[inline]
pub fn place(pos: usize, len: usize, size: usize) -> usize {
    if pos + len > size { 0 } else { pos }
}

/// Whether a write that moved the cursor from `head` to `next` passed over
/// the reader cursor `tail`, walking forward with wraparound.
///
/// Landing exactly on `tail` counts as passing it, because the reader would
/// then see an empty ring.
#[inline]
pub fn overtakes(head: usize, next: usize, tail: usize, size: usize) -> bool {
    let moved = (next + size - head) % size;
    let gap = match (tail + size - head) % size {
        0 => size,
        gap => gap,
    };
    gap <= moved
}

/// Where one message lands in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Ring-relative offset of the header.
    pub header: usize,
    /// Ring-relative offset of the payload.
    pub payload: usize,
    /// Ring-relative cursor after the message.
    pub next: usize,
}

impl Placement {
    /// Lay out a `len`-byte message at `cursor`.
    pub fn at(cursor: usize, len: usize, size: usize) -> Self {
        let header = place(cursor, HEADER_SIZE, size);
        let payload = place(header + HEADER_SIZE, len, size);
        let next = payload + len;
        Self {
            header,
            payload,
            next: if next >= size { 0 } else { next },
        }
    }
}

/// Reason a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingFull {
    /// Free space is not more than twice the message size.
    NoRoom,
    /// The message would run past the reader cursor.
    Overtake,
}

/// Local cursor of one ring direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    offset: usize,
    size: usize,
}

impl RingCursor {
    /// Cursor at the start of a `size`-byte ring.
    pub fn new(size: usize) -> Self {
        Self { offset: 0, size }
    }

    /// Ring-relative offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Ring size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Move back to the ring start, optionally with a new ring size.
    pub fn reset(&mut self, size: usize) {
        self.offset = 0;
        self.size = size;
    }

    /// Reader side: whether the writer's published cursor says there is nothing to read.
    #[inline]
    pub fn is_empty(&self, peer_cursor: usize) -> bool {
        self.offset == peer_cursor
    }

    /// Reader side: ring-relative offset of the next header.
    #[inline]
    pub fn header_offset(&self) -> usize {
        place(self.offset, HEADER_SIZE, self.size)
    }

    /// Writer side: lay out a `len`-byte message if the reader cursor `tail`
    /// leaves room for it.
    ///
    /// The margin check and the overtake check overlap; the margin check
    /// alone already rules out every overtake.
    pub fn reserve(&self, len: usize, tail: usize) -> Result<Placement, RingFull> {
        let free = free_space(self.offset, tail, self.size);
        if !has_room(free, len) {
            return Err(RingFull::NoRoom);
        }
        let placement = Placement::at(self.offset, len, self.size);
        if overtakes(self.offset, placement.next, tail, self.size) {
            return Err(RingFull::Overtake);
        }
        Ok(placement)
    }

    /// Lay out a `len`-byte message at the cursor without any room check.
    #[inline]
    pub fn placement(&self, len: usize) -> Placement {
        Placement::at(self.offset, len, self.size)
    }

    /// Move past a placed message.
    #[inline]
    pub fn advance(&mut self, placement: &Placement) {
        debug_assert!(placement.next < self.size);
        self.offset = placement.next;
    }
}
