use std::ffi::CStr;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::{self, NonNull};

use crate::ffi;
use crate::mr::MemoryRegion;

/// Borrowed device context, owned by the rdma_cm_id it came from.
#[derive(Debug, Clone, Copy)]
pub struct Context(pub(crate) *mut ffi::ibv_context);

unsafe impl Send for Context {}

#[derive(Debug)]
pub struct ProtectionDomain {
    pd: NonNull<ffi::ibv_pd>,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd.as_ptr()) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            log::warn!("ibv_dealloc_pd failed: {}", e);
        }
    }
}

impl ProtectionDomain {
    pub fn alloc(ctx: Context) -> io::Result<Self> {
        let pd = unsafe { ffi::ibv_alloc_pd(ctx.0) };
        NonNull::new(pd)
            .map(|pd| ProtectionDomain { pd })
            .ok_or_else(io::Error::last_os_error)
    }

    #[inline]
    pub(crate) fn pd(&self) -> *mut ffi::ibv_pd {
        self.pd.as_ptr()
    }
}

#[derive(Debug)]
pub struct CompChannel {
    channel: NonNull<ffi::ibv_comp_channel>,
}

unsafe impl Send for CompChannel {}
unsafe impl Sync for CompChannel {}

impl Drop for CompChannel {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_comp_channel(self.channel.as_ptr()) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            log::warn!("ibv_destroy_comp_channel failed: {}", e);
        }
    }
}

impl AsRawFd for CompChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        unsafe { self.channel.as_ref() }.fd
    }
}

impl CompChannel {
    pub fn create(ctx: Context) -> io::Result<Self> {
        let channel = unsafe { ffi::ibv_create_comp_channel(ctx.0) };
        NonNull::new(channel)
            .map(|channel| CompChannel { channel })
            .ok_or_else(io::Error::last_os_error)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking(self.as_raw_fd(), nonblocking)
    }

    /// Reads one completion event. The event must later be acknowledged on the queue it was
    /// reported for, see [`CompletionQueue::ack_events`].
    ///
    /// Returns `WouldBlock` when the channel is non-blocking and no event is pending.
    pub fn get_cq_event(&self) -> io::Result<()> {
        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();
        let rc =
            unsafe { ffi::ibv_get_cq_event(self.channel.as_ptr(), &mut cq, &mut cq_context) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if nonblocking {
        flags |= libc::O_NONBLOCK;
    } else {
        flags &= !libc::O_NONBLOCK;
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A completion queue bound to a completion channel. Must be dropped before that channel.
#[derive(Debug)]
pub struct CompletionQueue {
    cq: NonNull<ffi::ibv_cq>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_cq(self.cq.as_ptr()) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            log::warn!("ibv_destroy_cq failed: {}", e);
        }
    }
}

impl CompletionQueue {
    pub fn create(ctx: Context, min_cq_entries: i32, channel: &CompChannel) -> io::Result<Self> {
        let cq = unsafe {
            ffi::ibv_create_cq(
                ctx.0,
                min_cq_entries,
                ptr::null_mut(),
                channel.channel.as_ptr(),
                0,
            )
        };
        NonNull::new(cq)
            .map(|cq| CompletionQueue { cq })
            .ok_or_else(io::Error::last_os_error)
    }

    /// Raw handle, for the queue pair attributes.
    #[inline]
    pub fn cq(&self) -> *mut ffi::ibv_cq {
        self.cq.as_ptr()
    }

    /// Requests a completion event for the next completion added to the queue.
    pub fn req_notify(&self, solicited_only: bool) -> io::Result<()> {
        let rc = unsafe { ffi::ibv_req_notify_cq_real(self.cq.as_ptr(), solicited_only as i32) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    pub fn ack_events(&self, nevents: u32) {
        unsafe { ffi::ibv_ack_cq_events(self.cq.as_ptr(), nevents) };
    }

    /// Drains up to `completions.len()` entries, returning how many were written.
    #[inline]
    pub fn poll(&self, completions: &mut [ffi::ibv_wc]) -> io::Result<usize> {
        let n = unsafe {
            ffi::ibv_poll_cq_real(
                self.cq.as_ptr(),
                completions.len() as i32,
                completions.as_mut_ptr(),
            )
        };
        if n < 0 {
            Err(io::Error::new(io::ErrorKind::Other, "ibv_poll_cq failed"))
        } else {
            Ok(n as usize)
        }
    }
}

/// Borrowed queue pair, owned by the rdma_cm_id that created it.
#[derive(Debug)]
pub struct QueuePair {
    pub(crate) qp: *mut ffi::ibv_qp,
}

impl QueuePair {
    /// Posts a single receive covering `[0, len)` of `mr`.
    ///
    /// # Safety
    ///
    /// The registered memory must stay valid and untouched until a work completion for `wr_id`
    /// has been retrieved from the receive completion queue.
    pub unsafe fn post_recv(&self, wr_id: u64, mr: &MemoryRegion, len: usize) -> io::Result<()> {
        assert!(mr.contains(mr.addr(), len));
        let mut sge = ffi::ibv_sge {
            addr: mr.addr(),
            length: len as u32,
            lkey: mr.lkey(),
        };
        let mut wr = ffi::ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr = ptr::null_mut();
        let rc = ffi::ibv_post_recv_real(self.qp, &mut wr, &mut bad_wr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Posts a signaled two-sided send of `[0, len)` of `mr`. `remote_addr` and `rkey` ride
    /// along in the work request; a plain send does not consume them.
    ///
    /// # Safety
    ///
    /// The registered memory must stay valid and unmodified until a work completion for `wr_id`
    /// has been retrieved from the send completion queue.
    pub unsafe fn post_send(
        &self,
        wr_id: u64,
        mr: &MemoryRegion,
        len: usize,
        flags: ffi::ibv_send_flags,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        assert!(mr.contains(mr.addr(), len));
        let mut sge = ffi::ibv_sge {
            addr: mr.addr(),
            length: len as u32,
            lkey: mr.lkey(),
        };
        let mut wr: ffi::ibv_send_wr = Default::default();
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = flags.0;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        let mut bad_wr = ptr::null_mut();
        let rc = ffi::ibv_post_send_real(self.qp, &mut wr, &mut bad_wr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

/// Human readable name of a work completion status.
pub fn wc_status_str(status: ffi::ibv_wc_status::Type) -> String {
    let msg = unsafe { CStr::from_ptr(ffi::ibv_wc_status_str(status)) };
    msg.to_string_lossy().into_owned()
}
