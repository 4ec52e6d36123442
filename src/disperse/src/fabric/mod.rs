//! The seam between the connection logic and the transport underneath it.
//!
//! A [`Provider`] opens one [`Fabric`] per connection. The fabric owns every transport object
//! of that connection (event channel, protection domain, memory regions, completion channel
//! and queue, queue pair) and exposes the verbs the endpoint drives. The endpoint decides the
//! order; the fabric only does what it is told.
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bitflags::bitflags;

use crate::wire::RemoteBufferDescriptor;
use crate::Error;

pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

#[cfg(test)]
pub(crate) mod mock;

bitflags! {
    /// Memory region access rights. Values match `ibv_access_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0001;
        const REMOTE_WRITE = 0b0010;
        const REMOTE_READ = 0b0100;
    }
}

bitflags! {
    /// Values match `ibv_send_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SendFlags: u32 {
        const FENCE = 0b0001;
        const SIGNALED = 0b0010;
        const SOLICITED = 0b0100;
        const INLINE = 0b1000;
    }
}

/// The two buffers every endpoint owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Recv,
    Send,
}

impl Region {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Region::Recv => 0,
            Region::Send => 1,
        }
    }
}

/// A buffer registered with a protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

impl RegisteredRegion {
    #[inline]
    pub fn descriptor(&self) -> RemoteBufferDescriptor {
        RemoteBufferDescriptor {
            addr: self.addr,
            rkey: self.rkey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(u32),
}

impl WcStatus {
    pub const LOC_LEN_ERR: u32 = 1;
    pub const WR_FLUSH_ERR: u32 = 5;
    pub const RETRY_EXC_ERR: u32 = 12;
    pub const RNR_RETRY_EXC_ERR: u32 = 13;

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }

    #[inline]
    pub fn is_flush(&self) -> bool {
        matches!(self, WcStatus::Error(Self::WR_FLUSH_ERR))
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WcStatus::Success => write!(f, "success"),
            WcStatus::Error(Self::LOC_LEN_ERR) => write!(f, "local length error"),
            WcStatus::Error(Self::WR_FLUSH_ERR) => write!(f, "Work Request Flushed Error"),
            WcStatus::Error(Self::RETRY_EXC_ERR) => write!(f, "transport retry counter exceeded"),
            WcStatus::Error(Self::RNR_RETRY_EXC_ERR) => write!(f, "RNR retry counter exceeded"),
            WcStatus::Error(code) => write!(f, "status {}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    Other(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    pub status: i32,
    pub private_data: Vec<u8>,
}

impl CmEvent {
    pub fn new(kind: CmEventKind) -> Self {
        CmEvent {
            kind,
            status: 0,
            private_data: Vec::new(),
        }
    }

    pub fn with_private_data(kind: CmEventKind, private_data: Vec<u8>) -> Self {
        CmEvent {
            kind,
            status: 0,
            private_data,
        }
    }
}

/// Queue pair capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QpCapability {
    fn default() -> Self {
        QpCapability {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnParam {
    pub private_data: Vec<u8>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// Transport objects held by a connection, released one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The CM event channel together with the connection identifiers reporting to it.
    EventChannel,
    ProtectionDomain,
    MemoryRegion(Region),
    /// The completion queue together with its completion channel.
    CompletionQueue,
    QueuePair,
}

/// Opens fabrics. One per process, shared by every connection.
pub trait Provider {
    type Fabric: Fabric + 'static;

    /// Creates the event channel and an unbound connection identifier.
    fn open(&self) -> Result<Self::Fabric, Error>;
}

/// The transport objects of one connection.
///
/// Blocking waits take an optional deadline and report expiry as `Ok(None)`/`Ok(false)`
/// rather than an error so the caller can name what timed out.
pub trait Fabric: Send {
    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> Result<(), Error>;

    fn resolve_route(&mut self, timeout: Duration) -> Result<(), Error>;

    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> Result<(), Error>;

    /// Next connection-manager event, or `None` if `timeout` expires first. On a connect request
    /// the fabric switches to the new connection identifier.
    fn get_cm_event(&mut self, timeout: Option<Duration>) -> Result<Option<CmEvent>, Error>;

    fn alloc_pd(&mut self) -> Result<(), Error>;

    /// # Safety
    ///
    /// `[addr, addr + len)` must stay mapped until `Resource::MemoryRegion(region)` is released.
    unsafe fn reg_mr(
        &mut self,
        region: Region,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredRegion, Error>;

    /// Creates the completion channel and a queue of at least `min_entries` bound to it.
    fn create_cq(&mut self, min_entries: u32) -> Result<(), Error>;

    /// Arms the completion queue for one notification.
    fn req_notify_cq(&mut self) -> Result<(), Error>;

    fn create_qp(&mut self, cap: &QpCapability) -> Result<(), Error>;

    fn connect(&mut self, param: &ConnParam) -> Result<(), Error>;

    fn accept(&mut self, param: &ConnParam) -> Result<(), Error>;

    fn disconnect(&mut self) -> Result<(), Error>;

    /// Posts a receive into `[0, len)` of `region`.
    ///
    /// # Safety
    ///
    /// The region must not be read or written by anyone else until the completion for `wr_id`
    /// has been polled.
    unsafe fn post_recv(&mut self, wr_id: u64, region: Region, len: usize) -> Result<(), Error>;

    /// Posts a two-sided send of `[0, len)` of `region`. `remote` travels with the request as
    /// metadata only.
    ///
    /// # Safety
    ///
    /// The region must not be written until the completion for `wr_id` has been polled.
    unsafe fn post_send(
        &mut self,
        wr_id: u64,
        region: Region,
        len: usize,
        flags: SendFlags,
        remote: RemoteBufferDescriptor,
    ) -> Result<(), Error>;

    /// Waits for the next completion-channel event. Returns `false` if `timeout` expires first.
    fn get_cq_event(&mut self, timeout: Option<Duration>) -> Result<bool, Error>;

    fn ack_cq_events(&mut self, nevents: u32);

    /// Appends up to `max` completions to `completions`, returning how many were appended.
    fn poll_cq(&mut self, completions: &mut Vec<WorkCompletion>, max: usize)
        -> Result<usize, Error>;

    fn release(&mut self, resource: Resource) -> Result<(), Error>;
}
