use std::ffi::CStr;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::slice;

use socket2::SockAddr;

use crate::ffi;
use crate::ibv;

#[repr(transparent)]
#[derive(Debug)]
pub struct CmEvent(*mut ffi::rdma_cm_event);

unsafe impl Send for CmEvent {}
unsafe impl Sync for CmEvent {}

/// All events which are allocated by rdma_get_cm_event must be released, there
/// should be a one-to-one correspondence  between  successful  gets  and  acks.
/// This call frees the event structure and any memory that it references.
impl Drop for CmEvent {
    fn drop(&mut self) {
        // ignore the error
        let rc = unsafe { ffi::rdma_ack_cm_event(self.0) };
        if rc != 0 {
            log::debug!(
                "An error occurred on ack_cm_event: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ffi::rdma_event_str((*self.0).event)) };
        write!(f, "{}", msg.to_string_lossy())
    }
}

impl CmEvent {
    #[inline]
    pub fn status(&self) -> i32 {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.status
    }

    #[inline]
    pub fn event(&self) -> ffi::rdma_cm_event_type::Type {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.event
    }

    /// Private data attached to a connect request, a connect response or an established event.
    /// The slice is only valid until the event is acknowledged, so copy it out.
    pub fn private_data(&self) -> &[u8] {
        assert!(!self.0.is_null());
        let conn = unsafe { &(*self.0).param.conn };
        if conn.private_data.is_null() {
            return &[];
        }
        unsafe {
            slice::from_raw_parts(
                conn.private_data as *const u8,
                conn.private_data_len as usize,
            )
        }
    }

    /// Takes ownership of the new rdma_cm_id carried by a connect request.
    ///
    /// Only valid for a new connect request, and only once per event.
    pub fn take_request_id(&self) -> CmId {
        assert!(!self.0.is_null());
        let event = unsafe { &*self.0 };
        assert_eq!(
            event.event,
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST
        );
        assert!(!event.id.is_null());
        CmId(event.id)
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct EventChannel(*mut ffi::rdma_event_channel);

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl AsRawFd for EventChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.fd
    }
}

impl EventChannel {
    pub fn create_event_channel() -> io::Result<Self> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventChannel(channel))
        }
    }

    /// Returns `WouldBlock` when the channel is non-blocking and no event is pending.
    pub fn get_cm_event(&self) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.0, &mut event) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(CmEvent(event))
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        ibv::set_nonblocking(self.as_raw_fd(), nonblocking)
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.0) };
    }
}

/// An owned rdma_cm_id. Must be dropped before the event channel it reports to.
#[derive(Debug)]
pub struct CmId(*mut ffi::rdma_cm_id);

unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl Drop for CmId {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            log::debug!(
                "error occured when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl CmId {
    pub fn create_id(
        channel: &EventChannel,
        ps: ffi::rdma_port_space::Type,
    ) -> io::Result<CmId> {
        let mut cm_id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe { ffi::rdma_create_id(channel.0, &mut cm_id, ptr::null_mut(), ps) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        assert!(!cm_id.is_null());
        Ok(CmId(cm_id))
    }

    /// Device context the id is bound to. Only present once the address has been resolved (or a
    /// connect request arrived on it).
    #[inline]
    pub fn verbs(&self) -> Option<ibv::Context> {
        assert!(!self.0.is_null());
        let ctx = unsafe { &*self.0 }.verbs;
        if ctx.is_null() {
            None
        } else {
            Some(ibv::Context(ctx))
        }
    }

    /// Return a borrow of the inner QP. Returns None if the cmid does not have a QP associated
    /// with.
    #[inline]
    pub fn qp(&self) -> Option<ibv::QueuePair> {
        assert!(!self.0.is_null());
        let qp = unsafe { &*self.0 }.qp;
        if qp.is_null() {
            None
        } else {
            Some(ibv::QueuePair { qp })
        }
    }

    pub fn bind_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(*sockaddr);
        let rc = unsafe { ffi::rdma_bind_addr(self.0, addr.as_ptr() as *mut ffi::sockaddr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_listen(self.0, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn resolve_addr(&self, sockaddr: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let dst_addr = SockAddr::from(*sockaddr);
        let rc = unsafe {
            ffi::rdma_resolve_addr(
                self.0,
                ptr::null_mut(),
                dst_addr.as_ptr() as *mut ffi::sockaddr,
                timeout_ms,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_resolve_route(self.0, timeout_ms) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Create a queue pair on this id, associated with `pd`. The queue pair lives until
    /// [`CmId::destroy_qp`] is called.
    pub fn create_qp(
        &self,
        pd: &ibv::ProtectionDomain,
        qp_init_attr: &ffi::ibv_qp_init_attr,
    ) -> io::Result<()> {
        let rc = unsafe {
            ffi::rdma_create_qp(
                self.0,
                pd.pd(),
                qp_init_attr as *const _ as *mut _,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn destroy_qp(&self) {
        if self.qp().is_some() {
            unsafe { ffi::rdma_destroy_qp(self.0) };
        }
    }

    pub fn connect(&self, conn_param: Option<&ffi::rdma_conn_param>) -> io::Result<()> {
        let rc = unsafe {
            ffi::rdma_connect(
                self.0,
                conn_param.map_or(ptr::null_mut(), |param| param as *const _ as *mut _),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn accept(&self, conn_param: Option<&ffi::rdma_conn_param>) -> io::Result<()> {
        let rc = unsafe {
            ffi::rdma_accept(
                self.0,
                conn_param.map_or(ptr::null_mut(), |param| param as *const _ as *mut _),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disconnect(&self) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_disconnect(self.0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Builds connection parameters pointing at `private_data`. The returned value borrows the
/// buffer by raw pointer, so keep `private_data` alive across the connect/accept call.
pub fn conn_param(
    private_data: &[u8],
    responder_resources: u8,
    initiator_depth: u8,
    retry_count: u8,
    rnr_retry_count: u8,
) -> ffi::rdma_conn_param {
    ffi::rdma_conn_param {
        private_data: private_data.as_ptr() as *const c_void,
        private_data_len: private_data.len() as u8,
        responder_resources,
        initiator_depth,
        retry_count,
        rnr_retry_count,
        ..Default::default()
    }
}
