//! Host buffers and their registration.
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::fabric::{AccessFlags, Fabric, Region, RegisteredRegion};
use crate::Error;

const HUGE_PAGE_SIZE: usize = 2097152;

/// Anonymous, zero-filled memory aligned to a page, or to a huge page once it is at least
/// that large.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
}

// The buffer is plain memory owned by this value.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr.as_ptr().cast(), self.mapped_len)
                .unwrap_or_else(|e| log::warn!("failed to munmap: {}", e))
        };
    }
}

impl Buffer {
    pub fn new(len: usize) -> io::Result<Self> {
        let nonzero = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty buffer"))?;
        let align = if len < HUGE_PAGE_SIZE {
            page_size()
        } else {
            HUGE_PAGE_SIZE
        };
        let mapped_len = (nonzero.get() + align - 1) / align * align;
        let reserved_len = mapped_len + align;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(reserved_len).unwrap_or(nonzero),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        let addr = ptr as usize;
        // cut off the extra head
        let head_len = (align - addr % align) % align;
        if head_len > 0 {
            unsafe { munmap(ptr, head_len)? };
        }
        // and whatever is left of the tail
        let tail_len = align - head_len;
        if tail_len > 0 {
            let tail_addr = addr + head_len + mapped_len;
            unsafe { munmap(tail_addr as *mut libc::c_void, tail_len)? };
        }

        let aligned = ptr.cast::<u8>().wrapping_add(head_len);
        log::debug!(
            "buffer: {:0x?}, align: {}, len: {}, mapped_len: {}",
            aligned,
            align,
            len,
            mapped_len,
        );
        debug_assert!(aligned as usize % align == 0);
        let ptr = NonNull::new(aligned)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Buffer {
            ptr,
            len,
            mapped_len,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Buffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

            PAGE_SIZE.store(page_size, Ordering::Relaxed);

            page_size
        }
        page_size => page_size,
    }
}

#[derive(Debug, Default)]
struct Slot {
    buffer: Option<Buffer>,
    region: Option<RegisteredRegion>,
}

/// The send and receive buffers of one endpoint and their registrations.
///
/// A buffer is only freed once it is no longer registered.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    slots: [Slot; 2],
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zero-filled buffer of `size` bytes for `region`.
    pub fn allocate(&mut self, region: Region, size: usize) -> Result<&mut Buffer, Error> {
        let slot = &mut self.slots[region.index()];
        assert!(slot.buffer.is_none(), "{:?} buffer allocated twice", region);
        let buffer = Buffer::new(size).map_err(|source| Error::Allocation { size, source })?;
        Ok(slot.buffer.insert(buffer))
    }

    /// Registers the buffer of `region` with the fabric's protection domain.
    pub fn register<F: Fabric>(
        &mut self,
        fabric: &mut F,
        region: Region,
        access: AccessFlags,
    ) -> Result<RegisteredRegion, Error> {
        let slot = &mut self.slots[region.index()];
        let buffer = slot
            .buffer
            .as_mut()
            .ok_or_else(|| Error::MemoryRegistration(io::Error::from(io::ErrorKind::NotFound)))?;
        // SAFETY: the buffer is only unmapped by `free`, which refuses registered slots.
        let registered =
            unsafe { fabric.reg_mr(region, buffer.as_mut_ptr(), buffer.len(), access)? };
        slot.region = Some(registered);
        Ok(registered)
    }

    /// Forgets the registration of `region` after the fabric released it.
    pub fn unregistered(&mut self, region: Region) {
        self.slots[region.index()].region = None;
    }

    #[inline]
    pub fn registered(&self, region: Region) -> Option<&RegisteredRegion> {
        self.slots[region.index()].region.as_ref()
    }

    #[inline]
    pub fn buffer(&self, region: Region) -> Option<&Buffer> {
        self.slots[region.index()].buffer.as_ref()
    }

    /// The receive buffer for reading and the send buffer for writing, at the same time.
    pub fn split_mut(&mut self) -> Option<(&[u8], &mut [u8])> {
        let [recv, send] = &mut self.slots;
        match (recv.buffer.as_ref(), send.buffer.as_mut()) {
            (Some(recv), Some(send)) => Some((&recv[..], &mut send[..])),
            _ => None,
        }
    }

    /// Unmaps every buffer that is not registered anymore.
    pub fn free(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.region.is_none() {
                slot.buffer = None;
            } else {
                log::warn!("not freeing a buffer that is still registered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_buffers_are_page_aligned_and_zeroed() {
        let buf = Buffer::new(140).unwrap();
        assert_eq!(buf.len(), 140);
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn large_buffers_are_huge_page_aligned() {
        let mut buf = Buffer::new(3 * HUGE_PAGE_SIZE + 17).unwrap();
        assert_eq!(buf.as_ptr() as usize % HUGE_PAGE_SIZE, 0);
        let len = buf.len();
        buf[len - 1] = 0xff;
        assert_eq!(buf[len - 1], 0xff);
    }

    #[test]
    fn empty_buffer_is_an_allocation_error() {
        let mut registry = BufferRegistry::new();
        let err = registry.allocate(Region::Send, 0).unwrap_err();
        assert!(matches!(err, Error::Allocation { size: 0, .. }));
    }

    #[test]
    fn split_gives_both_buffers() {
        let mut registry = BufferRegistry::new();
        registry.allocate(Region::Recv, 64).unwrap()[0] = 7;
        registry.allocate(Region::Send, 96).unwrap();
        let (recv, send) = registry.split_mut().unwrap();
        assert_eq!(recv.len(), 64);
        assert_eq!(recv[0], 7);
        send[95] = 1;
        registry.free();
        assert!(registry.buffer(Region::Recv).is_none());
    }
}
