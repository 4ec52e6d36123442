//! An in-process fabric.
//!
//! Connections are pairs of crossbeam channels; "registered memory" is the caller's buffer,
//! copied into on receive and out of on send. The event sequence, the arm/ack discipline of the
//! completion channel and the receive matching of a reliable connection behave like the real
//! thing, which lets the whole stack run in a single process. Addresses can be given faults to
//! exercise the failure paths.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::slice;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender, TryRecvError};

use super::{
    AccessFlags, CmEvent, CmEventKind, ConnParam, Fabric, Provider, QpCapability, Region,
    RegisteredRegion, Resource, SendFlags, WcOpcode, WcStatus, WorkCompletion,
};
use crate::wire::RemoteBufferDescriptor;
use crate::Error;

/// `ECONNREFUSED`-like status reported with a reject when nobody listens.
const REJECT_NO_LISTENER: i32 = 28;

/// Misbehaviour of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Address resolution reports an error.
    Unresolvable,
    /// Address resolution never reports anything.
    Blackhole,
    /// Route resolution reports an error.
    NoRoute,
    /// Connection requests are rejected.
    Reject,
    /// Connection requests are dropped without an answer.
    Silent,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<SocketAddr, Sender<ConnectRequest>>,
    faults: HashMap<SocketAddr, Fault>,
}

impl Registry {
    fn fault(&self, addr: &SocketAddr) -> Option<Fault> {
        self.faults.get(addr).copied()
    }

    fn listener(&self, addr: &SocketAddr) -> Option<&Sender<ConnectRequest>> {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
        self.listeners
            .get(addr)
            .or_else(|| self.listeners.get(&any))
    }
}

/// A network of loopback fabrics. Clones share the same address space.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    registry: Arc<spin::Mutex<Registry>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, addr: SocketAddr, fault: Fault) {
        self.registry.lock().faults.insert(addr, fault);
    }

    pub fn clear(&self, addr: &SocketAddr) {
        self.registry.lock().faults.remove(addr);
    }

    /// Whether somebody listens on `addr`.
    pub fn is_listening(&self, addr: &SocketAddr) -> bool {
        self.registry.lock().listeners.contains_key(addr)
    }
}

impl Provider for LoopbackNetwork {
    type Fabric = LoopbackFabric;

    fn open(&self) -> Result<LoopbackFabric, Error> {
        Ok(LoopbackFabric::new(self.clone()))
    }
}

enum Packet {
    Data(Vec<u8>),
    Disconnect,
}

struct ConnectRequest {
    private_data: Vec<u8>,
    events: Sender<CmEvent>,
    to_client: Sender<Packet>,
    from_client: Receiver<Packet>,
}

struct Link {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

struct LocalRegion {
    ptr: *mut u8,
    registered: RegisteredRegion,
}

#[derive(Default)]
struct CqState {
    armed: bool,
    unacked: u32,
    completions: VecDeque<WorkCompletion>,
}

struct QpState {
    cap: QpCapability,
    recvs: VecDeque<(u64, Region, usize)>,
    sends: usize,
    inbox: VecDeque<Vec<u8>>,
    /// Either side disconnected; nothing will arrive anymore and posted receives are flushed.
    broken: bool,
}

pub struct LoopbackFabric {
    network: LoopbackNetwork,
    events_tx: Sender<CmEvent>,
    events_rx: Receiver<CmEvent>,
    dst: Option<SocketAddr>,
    bound: Option<SocketAddr>,
    requests: Option<Receiver<ConnectRequest>>,
    pending: Option<ConnectRequest>,
    link: Option<Link>,
    pd: bool,
    regions: [Option<LocalRegion>; 2],
    cq: Option<CqState>,
    qp: Option<QpState>,
    next_key: u32,
}

// The raw region pointers refer to buffers owned by the endpoint that owns this fabric.
unsafe impl Send for LoopbackFabric {}

fn not_ready(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{} not created", what))
}

impl LoopbackFabric {
    fn new(network: LoopbackNetwork) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        LoopbackFabric {
            network,
            events_tx,
            events_rx,
            dst: None,
            bound: None,
            requests: None,
            pending: None,
            link: None,
            pd: false,
            regions: [None, None],
            cq: None,
            qp: None,
            next_key: 0x100,
        }
    }

    fn raise(&self, event: CmEvent) {
        // we hold the receiver, this cannot fail
        let _ = self.events_tx.send(event);
    }

    fn complete(&mut self, wc: WorkCompletion) {
        if let Some(cq) = self.cq.as_mut() {
            cq.completions.push_back(wc);
        }
    }

    fn deliver(&mut self, packet: Packet) {
        match packet {
            Packet::Data(data) => {
                if let Some(qp) = self.qp.as_mut() {
                    qp.inbox.push_back(data);
                }
            }
            Packet::Disconnect => self.break_link(),
        }
    }

    fn break_link(&mut self) {
        if let Some(qp) = self.qp.as_mut() {
            if !qp.broken {
                qp.broken = true;
                self.raise(CmEvent::new(CmEventKind::Disconnected));
            }
        }
    }

    /// Moves whatever the peer sent into posted receives.
    fn progress(&mut self) {
        loop {
            let packet = match self.link.as_ref().map(|link| link.rx.try_recv()) {
                Some(Ok(packet)) => packet,
                Some(Err(TryRecvError::Disconnected)) => Packet::Disconnect,
                Some(Err(TryRecvError::Empty)) | None => break,
            };
            let last = matches!(packet, Packet::Disconnect);
            self.deliver(packet);
            if last {
                break;
            }
        }

        let Some(qp) = self.qp.as_mut() else {
            return;
        };
        let mut done = Vec::new();
        while !qp.inbox.is_empty() && !qp.recvs.is_empty() {
            let (Some(data), Some((wr_id, region, len))) =
                (qp.inbox.pop_front(), qp.recvs.pop_front())
            else {
                break;
            };
            let wc = match self.regions[region.index()].as_ref() {
                Some(local) if data.len() <= len => {
                    // SAFETY: the receive was posted on a registered region of at least `len`
                    // bytes, and nobody touches it until this completion is polled.
                    unsafe { slice::from_raw_parts_mut(local.ptr, data.len()) }
                        .copy_from_slice(&data);
                    WorkCompletion {
                        wr_id,
                        status: WcStatus::Success,
                        opcode: WcOpcode::Recv,
                        byte_len: data.len() as u32,
                    }
                }
                _ => WorkCompletion {
                    wr_id,
                    status: WcStatus::Error(WcStatus::LOC_LEN_ERR),
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                },
            };
            done.push(wc);
        }
        if qp.broken {
            for (wr_id, _, _) in qp.recvs.drain(..) {
                done.push(WorkCompletion {
                    wr_id,
                    status: WcStatus::Error(WcStatus::WR_FLUSH_ERR),
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                });
            }
        }
        for wc in done {
            self.complete(wc);
        }
    }

    fn region(&self, region: Region, len: usize) -> Result<&LocalRegion, Error> {
        match self.regions[region.index()].as_ref() {
            Some(local) if len <= local.registered.len => Ok(local),
            Some(_) => Err(Error::Ibv(io::Error::from_raw_os_error(libc::EINVAL))),
            None => Err(Error::Ibv(not_ready("memory region"))),
        }
    }
}

impl Fabric for LoopbackFabric {
    fn resolve_addr(&mut self, dst: SocketAddr, _timeout: Duration) -> Result<(), Error> {
        let fault = self.network.registry.lock().fault(&dst);
        self.dst = Some(dst);
        match fault {
            Some(Fault::Unresolvable) => self.raise(CmEvent {
                kind: CmEventKind::AddrError,
                status: -libc::EHOSTUNREACH,
                private_data: Vec::new(),
            }),
            Some(Fault::Blackhole) => {}
            _ => self.raise(CmEvent::new(CmEventKind::AddrResolved)),
        }
        Ok(())
    }

    fn resolve_route(&mut self, _timeout: Duration) -> Result<(), Error> {
        let dst = self
            .dst
            .ok_or_else(|| Error::RdmaCm(io::Error::from_raw_os_error(libc::EINVAL)))?;
        match self.network.registry.lock().fault(&dst) {
            Some(Fault::NoRoute) => self.raise(CmEvent {
                kind: CmEventKind::RouteError,
                status: -libc::ENETUNREACH,
                private_data: Vec::new(),
            }),
            _ => self.raise(CmEvent::new(CmEventKind::RouteResolved)),
        }
        Ok(())
    }

    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> Result<(), Error> {
        let mut registry = self.network.registry.lock();
        if registry.listeners.contains_key(&addr) {
            return Err(Error::RdmaCm(io::Error::from_raw_os_error(libc::EADDRINUSE)));
        }
        let (tx, rx) = channel::bounded(backlog.max(1) as usize);
        registry.listeners.insert(addr, tx);
        self.bound = Some(addr);
        self.requests = Some(rx);
        log::debug!("loopback listening on {}", addr);
        Ok(())
    }

    fn get_cm_event(&mut self, timeout: Option<Duration>) -> Result<Option<CmEvent>, Error> {
        let never = channel::never();
        let requests = self.requests.as_ref().unwrap_or(&never);

        let mut sel = Select::new();
        let event_index = sel.recv(&self.events_rx);
        sel.recv(requests);
        let oper = match timeout {
            Some(timeout) => match sel.select_timeout(timeout) {
                Ok(oper) => oper,
                Err(_) => return Ok(None),
            },
            None => sel.select(),
        };

        let broken = || Error::RdmaCm(io::Error::from(io::ErrorKind::BrokenPipe));
        if oper.index() == event_index {
            let event = oper.recv(&self.events_rx).map_err(|_| broken())?;
            Ok(Some(event))
        } else {
            let request = oper.recv(requests).map_err(|_| broken())?;
            let event = CmEvent::with_private_data(
                CmEventKind::ConnectRequest,
                request.private_data.clone(),
            );
            self.pending = Some(request);
            Ok(Some(event))
        }
    }

    fn alloc_pd(&mut self) -> Result<(), Error> {
        self.pd = true;
        Ok(())
    }

    unsafe fn reg_mr(
        &mut self,
        region: Region,
        addr: *mut u8,
        len: usize,
        _access: AccessFlags,
    ) -> Result<RegisteredRegion, Error> {
        if !self.pd {
            return Err(Error::MemoryRegistration(not_ready("protection domain")));
        }
        let key = self.next_key;
        self.next_key += 1;
        let registered = RegisteredRegion {
            addr: addr as u64,
            len,
            lkey: key,
            rkey: key,
        };
        self.regions[region.index()] = Some(LocalRegion {
            ptr: addr,
            registered,
        });
        Ok(registered)
    }

    fn create_cq(&mut self, _min_entries: u32) -> Result<(), Error> {
        self.cq = Some(CqState::default());
        Ok(())
    }

    fn req_notify_cq(&mut self) -> Result<(), Error> {
        let cq = self
            .cq
            .as_mut()
            .ok_or_else(|| Error::CompletionChannel(not_ready("completion queue")))?;
        cq.armed = true;
        Ok(())
    }

    fn create_qp(&mut self, cap: &QpCapability) -> Result<(), Error> {
        if !self.pd || self.cq.is_none() {
            return Err(Error::QueuePairCreation(not_ready("completion queue")));
        }
        self.qp = Some(QpState {
            cap: *cap,
            recvs: VecDeque::new(),
            sends: 0,
            inbox: VecDeque::new(),
            broken: false,
        });
        Ok(())
    }

    fn connect(&mut self, param: &ConnParam) -> Result<(), Error> {
        let dst = self
            .dst
            .ok_or_else(|| Error::RdmaCm(io::Error::from_raw_os_error(libc::EINVAL)))?;
        if self.qp.is_none() {
            return Err(Error::RdmaCm(not_ready("queue pair")));
        }

        let registry = self.network.registry.lock();
        let fault = registry.fault(&dst);
        let listener = registry.listener(&dst).cloned();
        drop(registry);

        match (fault, listener) {
            (Some(Fault::Silent), _) => {}
            (Some(Fault::Reject), _) | (_, None) => self.raise(CmEvent {
                kind: CmEventKind::Rejected,
                status: REJECT_NO_LISTENER,
                private_data: Vec::new(),
            }),
            (_, Some(listener)) => {
                let (to_server, from_client) = channel::unbounded();
                let (to_client, from_server) = channel::unbounded();
                let request = ConnectRequest {
                    private_data: param.private_data.clone(),
                    events: self.events_tx.clone(),
                    to_client,
                    from_client,
                };
                if listener.try_send(request).is_err() {
                    self.raise(CmEvent {
                        kind: CmEventKind::Rejected,
                        status: REJECT_NO_LISTENER,
                        private_data: Vec::new(),
                    });
                } else {
                    self.link = Some(Link {
                        tx: to_server,
                        rx: from_server,
                    });
                }
            }
        }
        Ok(())
    }

    fn accept(&mut self, param: &ConnParam) -> Result<(), Error> {
        if self.qp.is_none() {
            return Err(Error::RdmaCm(not_ready("queue pair")));
        }
        let request = self
            .pending
            .take()
            .ok_or_else(|| Error::RdmaCm(io::Error::from_raw_os_error(libc::EINVAL)))?;
        request
            .events
            .send(CmEvent::with_private_data(
                CmEventKind::Established,
                param.private_data.clone(),
            ))
            .map_err(|_| Error::RdmaCm(io::Error::from(io::ErrorKind::ConnectionAborted)))?;
        self.link = Some(Link {
            tx: request.to_client,
            rx: request.from_client,
        });
        self.raise(CmEvent::new(CmEventKind::Established));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(link) = self.link.as_ref() {
            let _ = link.tx.send(Packet::Disconnect);
        }
        if let Some(qp) = self.qp.as_mut() {
            qp.broken = true;
        }
        Ok(())
    }

    unsafe fn post_recv(&mut self, wr_id: u64, region: Region, len: usize) -> Result<(), Error> {
        self.region(region, len)?;
        let qp = self
            .qp
            .as_mut()
            .ok_or_else(|| Error::Ibv(not_ready("queue pair")))?;
        if qp.recvs.len() >= qp.cap.max_recv_wr as usize {
            return Err(Error::Ibv(io::Error::from_raw_os_error(libc::ENOMEM)));
        }
        qp.recvs.push_back((wr_id, region, len));
        Ok(())
    }

    unsafe fn post_send(
        &mut self,
        wr_id: u64,
        region: Region,
        len: usize,
        flags: SendFlags,
        _remote: RemoteBufferDescriptor,
    ) -> Result<(), Error> {
        let local = self.region(region, len)?;
        // SAFETY: the region is registered for at least `len` bytes.
        let data = slice::from_raw_parts(local.ptr as *const u8, len).to_vec();
        let qp = self
            .qp
            .as_mut()
            .ok_or_else(|| Error::Ibv(not_ready("queue pair")))?;
        if qp.sends >= qp.cap.max_send_wr as usize {
            return Err(Error::Ibv(io::Error::from_raw_os_error(libc::ENOMEM)));
        }
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::Ibv(io::Error::from(io::ErrorKind::NotConnected)))?;

        let status = if qp.broken || link.tx.send(Packet::Data(data)).is_err() {
            WcStatus::Error(WcStatus::WR_FLUSH_ERR)
        } else {
            WcStatus::Success
        };
        if flags.contains(SendFlags::SIGNALED) || !status.is_success() {
            qp.sends += 1;
            self.complete(WorkCompletion {
                wr_id,
                status,
                opcode: WcOpcode::Send,
                byte_len: len as u32,
            });
        }
        Ok(())
    }

    fn get_cq_event(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            self.progress();
            let cq = self
                .cq
                .as_mut()
                .ok_or_else(|| Error::CompletionChannel(not_ready("completion queue")))?;
            if cq.armed && !cq.completions.is_empty() {
                cq.armed = false;
                cq.unacked += 1;
                return Ok(true);
            }

            let broken = self.qp.as_ref().map_or(true, |qp| qp.broken);
            let link = match self.link.as_ref() {
                Some(link) if !broken => link,
                _ => {
                    // nothing can arrive anymore
                    return match deadline {
                        Some(deadline) => {
                            thread::sleep(deadline.saturating_duration_since(Instant::now()));
                            Ok(false)
                        }
                        None => Err(Error::CompletionChannel(io::Error::from(
                            io::ErrorKind::BrokenPipe,
                        ))),
                    };
                }
            };
            let packet = match deadline {
                Some(deadline) => link.rx.recv_deadline(deadline),
                None => link.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match packet {
                Ok(packet) => self.deliver(packet),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => self.break_link(),
            }
        }
    }

    fn ack_cq_events(&mut self, nevents: u32) {
        if let Some(cq) = self.cq.as_mut() {
            cq.unacked = cq.unacked.saturating_sub(nevents);
        }
    }

    fn poll_cq(
        &mut self,
        completions: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, Error> {
        self.progress();
        let cq = self
            .cq
            .as_mut()
            .ok_or_else(|| Error::CompletionChannel(not_ready("completion queue")))?;
        let n = max.min(cq.completions.len());
        completions.extend(cq.completions.drain(..n));
        if let Some(qp) = self.qp.as_mut() {
            let sends = completions[completions.len() - n..]
                .iter()
                .filter(|wc| wc.opcode == WcOpcode::Send)
                .count();
            qp.sends = qp.sends.saturating_sub(sends);
        }
        Ok(n)
    }

    fn release(&mut self, resource: Resource) -> Result<(), Error> {
        match resource {
            Resource::QueuePair => {
                self.qp = None;
                self.link = None;
            }
            Resource::CompletionQueue => {
                if let Some(cq) = self.cq.take() {
                    if cq.unacked > 0 {
                        log::warn!("destroying a completion queue with {} unacked events", cq.unacked);
                    }
                }
            }
            Resource::MemoryRegion(region) => self.regions[region.index()] = None,
            Resource::ProtectionDomain => self.pd = false,
            Resource::EventChannel => {
                if let Some(addr) = self.bound.take() {
                    self.network.registry.lock().listeners.remove(&addr);
                }
                self.requests = None;
                self.pending = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_listener_accepts_any_host() {
        let network = LoopbackNetwork::new();
        let mut server = network.open().unwrap();
        server.listen(addr("0.0.0.0:7000"), 1).unwrap();
        assert!(network.is_listening(&addr("0.0.0.0:7000")));

        let registry = network.registry.lock();
        assert!(registry.listener(&addr("10.1.2.3:7000")).is_some());
        assert!(registry.listener(&addr("10.1.2.3:7001")).is_none());
    }

    #[test]
    fn one_listener_per_address() {
        let network = LoopbackNetwork::new();
        let mut first = network.open().unwrap();
        let mut second = network.open().unwrap();
        first.listen(addr("10.0.0.1:7000"), 1).unwrap();
        assert!(matches!(
            second.listen(addr("10.0.0.1:7000"), 1),
            Err(Error::RdmaCm(_))
        ));

        first.release(Resource::EventChannel).unwrap();
        assert!(!network.is_listening(&addr("10.0.0.1:7000")));
        second.listen(addr("10.0.0.1:7000"), 1).unwrap();
    }

    #[test]
    fn faults_can_be_cleared() {
        let network = LoopbackNetwork::new();
        let dst = addr("10.0.0.9:7000");
        network.inject(dst, Fault::Unresolvable);

        let mut fabric = network.open().unwrap();
        fabric.resolve_addr(dst, Duration::from_millis(10)).unwrap();
        let event = fabric.get_cm_event(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(event.kind, CmEventKind::AddrError);

        network.clear(&dst);
        fabric.resolve_addr(dst, Duration::from_millis(10)).unwrap();
        let event = fabric.get_cm_event(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(event.kind, CmEventKind::AddrResolved);
    }

    #[test]
    fn receive_queue_depth_is_enforced() {
        let network = LoopbackNetwork::new();
        let mut fabric = network.open().unwrap();
        let mut buf = vec![0u8; 64];
        fabric.alloc_pd().unwrap();
        unsafe {
            fabric
                .reg_mr(Region::Recv, buf.as_mut_ptr(), buf.len(), AccessFlags::LOCAL_WRITE)
                .unwrap();
        }
        fabric.create_cq(2).unwrap();
        fabric.create_qp(&QpCapability::default()).unwrap();

        unsafe {
            fabric.post_recv(0, Region::Recv, 64).unwrap();
            assert!(fabric.post_recv(0, Region::Recv, 64).is_err());
            // longer than the registration
            assert!(fabric.post_recv(0, Region::Recv, 65).is_err());
        }
        fabric.release(Resource::QueuePair).unwrap();
        fabric.release(Resource::MemoryRegion(Region::Recv)).unwrap();
    }
}
