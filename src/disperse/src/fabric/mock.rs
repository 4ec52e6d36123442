//! A scripted fabric that records what it is asked to do.
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    AccessFlags, CmEvent, ConnParam, Fabric, QpCapability, Region, RegisteredRegion, Resource,
    SendFlags, WorkCompletion,
};
use crate::wire::RemoteBufferDescriptor;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    ResolveAddr(SocketAddr),
    ResolveRoute,
    Listen(SocketAddr),
    AllocPd,
    RegMr(Region, usize),
    CreateCq,
    Arm,
    CreateQp,
    Connect(Vec<u8>),
    Accept(Vec<u8>),
    Disconnect,
    PostRecv(u64, usize),
    PostSend(u64, usize),
    Ack(u32),
    Release(Resource),
}

pub(crate) type Journal = Arc<Mutex<Vec<Call>>>;

/// Which provider call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    AllocPd,
    RegMr,
    CreateCq,
    CreateQp,
}

pub(crate) struct MockFabric {
    pub(crate) journal: Journal,
    pub(crate) events: VecDeque<CmEvent>,
    pub(crate) completions: VecDeque<WorkCompletion>,
    pub(crate) fail_at: Option<FailAt>,
    armed: bool,
}

impl MockFabric {
    pub(crate) fn new(events: impl IntoIterator<Item = CmEvent>) -> Self {
        MockFabric {
            journal: Journal::default(),
            events: events.into_iter().collect(),
            completions: VecDeque::new(),
            fail_at: None,
            armed: false,
        }
    }

    fn record(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }

    fn fail(&self, at: FailAt) -> Result<(), io::Error> {
        if self.fail_at == Some(at) {
            Err(io::Error::from_raw_os_error(libc::ENOMEM))
        } else {
            Ok(())
        }
    }
}

impl Fabric for MockFabric {
    fn resolve_addr(&mut self, dst: SocketAddr, _timeout: Duration) -> Result<(), Error> {
        self.record(Call::ResolveAddr(dst));
        Ok(())
    }

    fn resolve_route(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.record(Call::ResolveRoute);
        Ok(())
    }

    fn listen(&mut self, addr: SocketAddr, _backlog: i32) -> Result<(), Error> {
        self.record(Call::Listen(addr));
        Ok(())
    }

    fn get_cm_event(&mut self, _timeout: Option<Duration>) -> Result<Option<CmEvent>, Error> {
        Ok(self.events.pop_front())
    }

    fn alloc_pd(&mut self) -> Result<(), Error> {
        self.fail(FailAt::AllocPd).map_err(Error::Ibv)?;
        self.record(Call::AllocPd);
        Ok(())
    }

    unsafe fn reg_mr(
        &mut self,
        region: Region,
        addr: *mut u8,
        len: usize,
        _access: AccessFlags,
    ) -> Result<RegisteredRegion, Error> {
        self.fail(FailAt::RegMr).map_err(Error::MemoryRegistration)?;
        self.record(Call::RegMr(region, len));
        Ok(RegisteredRegion {
            addr: addr as u64,
            len,
            lkey: 7,
            rkey: 7,
        })
    }

    fn create_cq(&mut self, _min_entries: u32) -> Result<(), Error> {
        self.fail(FailAt::CreateCq).map_err(Error::CompletionChannel)?;
        self.record(Call::CreateCq);
        Ok(())
    }

    fn req_notify_cq(&mut self) -> Result<(), Error> {
        self.record(Call::Arm);
        self.armed = true;
        Ok(())
    }

    fn create_qp(&mut self, _cap: &QpCapability) -> Result<(), Error> {
        self.fail(FailAt::CreateQp).map_err(Error::QueuePairCreation)?;
        self.record(Call::CreateQp);
        Ok(())
    }

    fn connect(&mut self, param: &ConnParam) -> Result<(), Error> {
        self.record(Call::Connect(param.private_data.clone()));
        Ok(())
    }

    fn accept(&mut self, param: &ConnParam) -> Result<(), Error> {
        self.record(Call::Accept(param.private_data.clone()));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.record(Call::Disconnect);
        Ok(())
    }

    unsafe fn post_recv(&mut self, wr_id: u64, _region: Region, len: usize) -> Result<(), Error> {
        self.record(Call::PostRecv(wr_id, len));
        Ok(())
    }

    unsafe fn post_send(
        &mut self,
        wr_id: u64,
        _region: Region,
        len: usize,
        _flags: SendFlags,
        _remote: RemoteBufferDescriptor,
    ) -> Result<(), Error> {
        self.record(Call::PostSend(wr_id, len));
        Ok(())
    }

    fn get_cq_event(&mut self, _timeout: Option<Duration>) -> Result<bool, Error> {
        if self.armed && !self.completions.is_empty() {
            self.armed = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn ack_cq_events(&mut self, nevents: u32) {
        self.record(Call::Ack(nevents));
    }

    fn poll_cq(
        &mut self,
        completions: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, Error> {
        let n = max.min(self.completions.len());
        completions.extend(self.completions.drain(..n));
        Ok(n)
    }

    fn release(&mut self, resource: Resource) -> Result<(), Error> {
        self.record(Call::Release(resource));
        Ok(())
    }
}
