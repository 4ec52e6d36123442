//! librdmacm/libibverbs behind the [`Fabric`] seam.
//!
//! Both the CM event channel and the completion channel are switched to non-blocking mode and
//! registered with a mio poll, so every wait can carry a deadline.
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use rdma::ffi;
use rdma::ibv::{self, CompChannel, CompletionQueue, ProtectionDomain};
use rdma::mr::MemoryRegion;
use rdma::rdmacm::{self, CmId, EventChannel};

use super::{
    AccessFlags, CmEvent, CmEventKind, ConnParam, Fabric, Provider, QpCapability, Region,
    RegisteredRegion, Resource, SendFlags, WcOpcode, WcStatus, WorkCompletion,
};
use crate::wire::RemoteBufferDescriptor;
use crate::Error;

const CM_TOKEN: Token = Token(0);
const COMP_TOKEN: Token = Token(1);

const MAX_POLL_CQ: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerbsProvider;

impl VerbsProvider {
    pub fn new() -> Self {
        VerbsProvider
    }
}

impl Provider for VerbsProvider {
    type Fabric = VerbsFabric;

    fn open(&self) -> Result<VerbsFabric, Error> {
        let channel = EventChannel::create_event_channel().map_err(Error::RdmaCm)?;
        channel.set_nonblocking(true).map_err(Error::RdmaCm)?;
        let id = CmId::create_id(&channel, ffi::rdma_port_space::RDMA_PS_TCP)
            .map_err(Error::RdmaCm)?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&channel.as_raw_fd()),
            CM_TOKEN,
            Interest::READABLE,
        )?;

        Ok(VerbsFabric {
            poll,
            events: Events::with_capacity(2),
            cq: None,
            comp_channel: None,
            mrs: [None, None],
            pd: None,
            id: Some(id),
            listener: None,
            channel: Some(channel),
        })
    }
}

/// Fields are declared in release order, so dropping a fabric that was never released is safe
/// as well.
pub struct VerbsFabric {
    poll: Poll,
    events: Events,
    cq: Option<CompletionQueue>,
    comp_channel: Option<CompChannel>,
    mrs: [Option<MemoryRegion>; 2],
    pd: Option<ProtectionDomain>,
    /// The connection. On the passive side this is the id carried by the connect request.
    id: Option<CmId>,
    listener: Option<CmId>,
    channel: Option<EventChannel>,
}

fn missing(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{} not created", what))
}

fn event_kind(event: ffi::rdma_cm_event_type::Type) -> CmEventKind {
    use ffi::rdma_cm_event_type::*;
    match event {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        other => CmEventKind::Other(other),
    }
}

fn work_completion(wc: &ffi::ibv_wc) -> WorkCompletion {
    let status = if wc.status == ffi::ibv_wc_status::IBV_WC_SUCCESS {
        WcStatus::Success
    } else {
        log::debug!(
            "wr {} completed with {}",
            wc.wr_id,
            ibv::wc_status_str(wc.status)
        );
        WcStatus::Error(wc.status)
    };
    let opcode = match wc.opcode {
        ffi::ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ffi::ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        other => WcOpcode::Other(other),
    };
    WorkCompletion {
        wr_id: wc.wr_id,
        status,
        opcode,
        byte_len: wc.byte_len,
    }
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

impl VerbsFabric {
    fn id(&self) -> Result<&CmId, Error> {
        self.id.as_ref().ok_or_else(|| Error::RdmaCm(missing("cm id")))
    }

    fn context(&self) -> Result<ibv::Context, Error> {
        self.id()?.verbs().ok_or_else(|| {
            Error::Ibv(io::Error::new(
                io::ErrorKind::NotConnected,
                "cm id is not bound to a device",
            ))
        })
    }

    fn mr(&self, region: Region) -> Result<&MemoryRegion, Error> {
        self.mrs[region.index()]
            .as_ref()
            .ok_or_else(|| Error::Ibv(missing("memory region")))
    }

    fn qp(&self) -> Result<ibv::QueuePair, Error> {
        self.id()?
            .qp()
            .ok_or_else(|| Error::Ibv(missing("queue pair")))
    }

    /// Blocks in the poll until something is readable or `deadline` passes. Returns false once
    /// the deadline has passed.
    fn wait_readable(&mut self, deadline: Option<Instant>) -> Result<bool, Error> {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if remaining == Some(Duration::ZERO) {
            return Ok(false);
        }
        match self.poll.poll(&mut self.events, remaining) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn convert(&mut self, event: rdmacm::CmEvent) -> CmEvent {
        let kind = event_kind(event.event());
        if kind == CmEventKind::ConnectRequest {
            // serve the new id from now on, keep the listening one alive until release
            let id = event.take_request_id();
            self.listener = self.id.replace(id);
        }
        CmEvent {
            kind,
            status: event.status(),
            private_data: event.private_data().to_vec(),
        }
    }
}

impl Fabric for VerbsFabric {
    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> Result<(), Error> {
        self.id()?
            .resolve_addr(&dst, timeout_ms(timeout))
            .map_err(Error::RdmaCm)
    }

    fn resolve_route(&mut self, timeout: Duration) -> Result<(), Error> {
        self.id()?
            .resolve_route(timeout_ms(timeout))
            .map_err(Error::RdmaCm)
    }

    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> Result<(), Error> {
        let id = self.id()?;
        id.bind_addr(&addr).map_err(Error::RdmaCm)?;
        id.listen(backlog).map_err(Error::RdmaCm)
    }

    fn get_cm_event(&mut self, timeout: Option<Duration>) -> Result<Option<CmEvent>, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let channel = self
                .channel
                .as_ref()
                .ok_or_else(|| Error::RdmaCm(missing("event channel")))?;
            match channel.get_cm_event() {
                Ok(event) => return Ok(Some(self.convert(event))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::RdmaCm(e)),
            }
            if !self.wait_readable(deadline)? {
                return Ok(None);
            }
        }
    }

    fn alloc_pd(&mut self) -> Result<(), Error> {
        let pd = ProtectionDomain::alloc(self.context()?).map_err(Error::Ibv)?;
        self.pd = Some(pd);
        Ok(())
    }

    unsafe fn reg_mr(
        &mut self,
        region: Region,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredRegion, Error> {
        let pd = self
            .pd
            .as_ref()
            .ok_or_else(|| Error::MemoryRegistration(missing("protection domain")))?;
        let mr = MemoryRegion::register(pd, addr, len, ffi::ibv_access_flags(access.bits()))
            .map_err(Error::MemoryRegistration)?;
        let registered = RegisteredRegion {
            addr: mr.addr(),
            len: mr.len(),
            lkey: mr.lkey(),
            rkey: mr.rkey(),
        };
        self.mrs[region.index()] = Some(mr);
        Ok(registered)
    }

    fn create_cq(&mut self, min_entries: u32) -> Result<(), Error> {
        let ctx = self.context()?;
        let comp_channel = CompChannel::create(ctx).map_err(Error::CompletionChannel)?;
        comp_channel
            .set_nonblocking(true)
            .map_err(Error::CompletionChannel)?;
        let cq = CompletionQueue::create(ctx, min_entries as i32, &comp_channel)
            .map_err(Error::CompletionChannel)?;
        self.poll.registry().register(
            &mut SourceFd(&comp_channel.as_raw_fd()),
            COMP_TOKEN,
            Interest::READABLE,
        )?;
        self.comp_channel = Some(comp_channel);
        self.cq = Some(cq);
        Ok(())
    }

    fn req_notify_cq(&mut self) -> Result<(), Error> {
        self.cq
            .as_ref()
            .ok_or_else(|| Error::CompletionChannel(missing("completion queue")))?
            .req_notify(false)
            .map_err(Error::CompletionChannel)
    }

    fn create_qp(&mut self, cap: &QpCapability) -> Result<(), Error> {
        let pd = self
            .pd
            .as_ref()
            .ok_or_else(|| Error::QueuePairCreation(missing("protection domain")))?;
        let cq = self
            .cq
            .as_ref()
            .ok_or_else(|| Error::QueuePairCreation(missing("completion queue")))?;
        let attr = ffi::ibv_qp_init_attr {
            send_cq: cq.cq(),
            recv_cq: cq.cq(),
            cap: ffi::ibv_qp_cap {
                max_send_wr: cap.max_send_wr,
                max_recv_wr: cap.max_recv_wr,
                max_send_sge: cap.max_send_sge,
                max_recv_sge: cap.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
            ..Default::default()
        };
        self.id()?
            .create_qp(pd, &attr)
            .map_err(Error::QueuePairCreation)
    }

    fn connect(&mut self, param: &ConnParam) -> Result<(), Error> {
        let param = rdmacm::conn_param(
            &param.private_data,
            param.responder_resources,
            param.initiator_depth,
            param.retry_count,
            param.rnr_retry_count,
        );
        self.id()?.connect(Some(&param)).map_err(Error::RdmaCm)
    }

    fn accept(&mut self, param: &ConnParam) -> Result<(), Error> {
        let param = rdmacm::conn_param(
            &param.private_data,
            param.responder_resources,
            param.initiator_depth,
            param.retry_count,
            param.rnr_retry_count,
        );
        self.id()?.accept(Some(&param)).map_err(Error::RdmaCm)
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.id()?.disconnect().map_err(Error::RdmaCm)
    }

    unsafe fn post_recv(&mut self, wr_id: u64, region: Region, len: usize) -> Result<(), Error> {
        let qp = self.qp()?;
        qp.post_recv(wr_id, self.mr(region)?, len)
            .map_err(Error::Ibv)
    }

    unsafe fn post_send(
        &mut self,
        wr_id: u64,
        region: Region,
        len: usize,
        flags: SendFlags,
        remote: RemoteBufferDescriptor,
    ) -> Result<(), Error> {
        let qp = self.qp()?;
        qp.post_send(
            wr_id,
            self.mr(region)?,
            len,
            ffi::ibv_send_flags(flags.bits()),
            remote.addr,
            remote.rkey,
        )
        .map_err(Error::Ibv)
    }

    fn get_cq_event(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let comp_channel = self
                .comp_channel
                .as_ref()
                .ok_or_else(|| Error::CompletionChannel(missing("completion channel")))?;
            match comp_channel.get_cq_event() {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::CompletionChannel(e)),
            }
            if !self.wait_readable(deadline)? {
                return Ok(false);
            }
        }
    }

    fn ack_cq_events(&mut self, nevents: u32) {
        if let Some(cq) = self.cq.as_ref() {
            cq.ack_events(nevents);
        }
    }

    fn poll_cq(
        &mut self,
        completions: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, Error> {
        let cq = self
            .cq
            .as_ref()
            .ok_or_else(|| Error::CompletionChannel(missing("completion queue")))?;
        let mut wc = [ffi::ibv_wc::default(); MAX_POLL_CQ];
        let n = cq
            .poll(&mut wc[..max.min(MAX_POLL_CQ)])
            .map_err(Error::Ibv)?;
        completions.extend(wc[..n].iter().map(work_completion));
        Ok(n)
    }

    fn release(&mut self, resource: Resource) -> Result<(), Error> {
        match resource {
            Resource::QueuePair => {
                if let Some(id) = self.id.as_ref() {
                    id.destroy_qp();
                }
            }
            Resource::CompletionQueue => {
                self.cq = None;
                if let Some(comp_channel) = self.comp_channel.take() {
                    self.poll
                        .registry()
                        .deregister(&mut SourceFd(&comp_channel.as_raw_fd()))?;
                }
            }
            Resource::MemoryRegion(region) => self.mrs[region.index()] = None,
            Resource::ProtectionDomain => self.pd = None,
            Resource::EventChannel => {
                self.id = None;
                self.listener = None;
                if let Some(channel) = self.channel.take() {
                    self.poll
                        .registry()
                        .deregister(&mut SourceFd(&channel.as_raw_fd()))?;
                }
            }
        }
        Ok(())
    }
}
