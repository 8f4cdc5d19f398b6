//! Memory window backing store.
//!
//! A `DmaRegion` is one contiguous, page-aligned, zeroed allocation that the
//! bridge translates for the remote host. The local side reads its receive
//! rings out of it and the peer writes its transmit rings into it, so all
//! access goes through `&self` with bounds-checked copies. Ordering between
//! the ring bytes and the cursors published in scratchpads is provided by the
//! scratchpad accesses themselves (release on write, acquire on read).

use std::ptr;

use crate::error::{Error, Result};

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Page-aligned, zero-initialized memory shared with the peer.
pub struct DmaRegion {
    ptr: *mut u8,
    len: usize,
}

impl DmaRegion {
    /// Allocate a region of at least `size` bytes, rounded up to `align`.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("window size cannot be 0".into()));
        }
        if !align.is_power_of_two() || align < std::mem::size_of::<usize>() {
            return Err(Error::InvalidConfig(format!(
                "invalid window alignment {}",
                align
            )));
        }
        let len = align_up(size, align);

        let ptr = unsafe {
            let mut ptr: *mut libc::c_void = ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, align, len);
            if ret != 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    format!("posix_memalign failed: {}", ret),
                )));
            }
            ptr::write_bytes(ptr as *mut u8, 0, len);
            ptr as *mut u8
        };

        Ok(Self { ptr, len })
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address the bridge would be programmed with.
    #[inline]
    pub fn dma_addr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::Hardware(format!(
                "access {}+{} outside window of {} bytes",
                offset, len, self.len
            ))),
        }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the region at `offset`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr as *mut libc::c_void);
        }
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr()))
            .field("len", &self.len)
            .finish()
    }
}

// Safety: DmaRegion owns its allocation. Concurrent access to one byte range
// is excluded by the ring protocol, not by the type.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_region_is_aligned_and_zeroed() {
        let region = DmaRegion::new(5000, 4096).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.dma_addr() % 4096, 0);

        let mut buf = vec![0xffu8; region.len()];
        region.read_bytes(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_copy() {
        let region = DmaRegion::new(4096, 4096).unwrap();
        region.write_bytes(100, b"doorbell").unwrap();

        let mut buf = [0u8; 8];
        region.read_bytes(100, &mut buf).unwrap();
        assert_eq!(&buf, b"doorbell");
    }

    #[test]
    fn test_region_bounds() {
        let region = DmaRegion::new(4096, 4096).unwrap();
        assert!(region.write_bytes(4090, &[0u8; 6]).is_ok());
        assert!(region.write_bytes(4090, &[0u8; 7]).is_err());
        let mut buf = [0u8; 1];
        assert!(region.read_bytes(4096, &mut buf).is_err());
        assert!(region.read_bytes(usize::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_region_rejects_bad_alignment() {
        assert!(DmaRegion::new(4096, 3000).is_err());
        assert!(DmaRegion::new(0, 4096).is_err());
    }
}
