//! Registration of caller-owned memory with a protection domain.
use std::io;
use std::ptr::NonNull;

use crate::ffi;
use crate::ibv;

/// A registered memory region. The registration is released on drop; the memory itself belongs
/// to whoever registered it and must outlive this value.
#[derive(Debug)]
pub struct MemoryRegion {
    mr: NonNull<ffi::ibv_mr>,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dereg_mr(self.mr.as_ptr()) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            log::warn!("ibv_dereg_mr failed: {}", e);
        }
    }
}

impl MemoryRegion {
    /// Registers `[addr, addr + len)` with `pd`.
    ///
    /// # Safety
    ///
    /// The range must stay mapped until the returned region is dropped, and no work request
    /// referring to it may be outstanding at that point.
    pub unsafe fn register(
        pd: &ibv::ProtectionDomain,
        addr: *mut u8,
        len: usize,
        access: ffi::ibv_access_flags,
    ) -> io::Result<Self> {
        let mr = ffi::ibv_reg_mr(pd.pd(), addr.cast(), len, access.0 as _);
        NonNull::new(mr)
            .map(|mr| MemoryRegion { mr })
            .ok_or_else(io::Error::last_os_error)
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        unsafe { self.mr.as_ref() }.addr as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { self.mr.as_ref() }.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref() }.lkey
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref() }.rkey
    }

    /// Whether `[addr, addr + len)` lies inside the registration.
    #[inline]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.addr();
        addr >= start && addr + len as u64 <= start + self.len() as u64
    }
}
