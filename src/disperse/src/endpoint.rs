//! One connection to one peer, and every transport resource behind it.
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::buffer::BufferRegistry;
use crate::config::{DisperseConfig, Timeouts};
use crate::fabric::{
    AccessFlags, CmEvent, ConnParam, Fabric, QpCapability, Region, Resource, SendFlags,
};
use crate::poller::{Completion, CompletionPoller};
use crate::state::{EndpointState, Step};
use crate::wire::{RemoteBufferDescriptor, WrId};
use crate::Error;

/// At most one send and one receive are in flight per connection.
const CQ_ENTRIES: u32 = 2;

const CONNECT_RETRY_COUNT: u8 = 7;
/// 7 retries forever on receiver-not-ready.
const RNR_RETRY_COUNT: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Sizes of the two buffers an endpoint registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub send: usize,
    pub recv: usize,
}

impl BufferSizes {
    /// The coordinator sends a peer's share and receives its fragments.
    pub fn client(config: &DisperseConfig) -> Self {
        BufferSizes {
            send: config.send_size(),
            recv: config.recv_size(),
        }
    }

    /// A peer receives its share and sends back its fragments.
    pub fn server(config: &DisperseConfig) -> Self {
        BufferSizes {
            send: config.recv_size(),
            recv: config.send_size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub resolve_timeout: Duration,
    pub connect_timeout: Option<Duration>,
    /// How long a server waits for a connect request.
    pub accept_timeout: Option<Duration>,
    pub completion_timeout: Option<Duration>,
    pub qp_cap: QpCapability,
    pub access: AccessFlags,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::default())
    }
}

impl EndpointOptions {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        EndpointOptions {
            resolve_timeout: timeouts.resolve(),
            connect_timeout: timeouts.connect(),
            accept_timeout: None,
            completion_timeout: timeouts.completion(),
            qp_cap: QpCapability::default(),
            access: AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        }
    }
}

/// A connection driven through [`EndpointState`].
///
/// Resources are recorded as they are acquired and released in exactly the reverse order by
/// [`ConnectionEndpoint::teardown`], which also runs on drop.
pub struct ConnectionEndpoint<F: Fabric> {
    peer: SocketAddr,
    role: Role,
    state: EndpointState,
    fabric: F,
    acquired: Vec<Resource>,
    buffers: BufferRegistry,
    remote: Option<RemoteBufferDescriptor>,
    poller: CompletionPoller,
    outstanding: [bool; 2],
    options: EndpointOptions,
}

impl<F: Fabric> fmt::Debug for ConnectionEndpoint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("acquired", &self.acquired)
            .field("remote", &self.remote)
            .finish()
    }
}

impl<F: Fabric> Drop for ConnectionEndpoint<F> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<F: Fabric> ConnectionEndpoint<F> {
    fn new(fabric: F, peer: SocketAddr, role: Role, options: EndpointOptions) -> Self {
        ConnectionEndpoint {
            peer,
            role,
            state: EndpointState::Init,
            fabric,
            // the provider opened the event channel
            acquired: vec![Resource::EventChannel],
            buffers: BufferRegistry::new(),
            remote: None,
            poller: CompletionPoller::new(options.completion_timeout),
            outstanding: [false; 2],
            options,
        }
    }

    /// Connects to a listening peer. On failure everything acquired so far is released.
    pub fn connect(
        fabric: F,
        peer: SocketAddr,
        sizes: BufferSizes,
        options: EndpointOptions,
    ) -> Result<Self, Error> {
        let mut endpoint = Self::new(fabric, peer, Role::Client, options);
        match endpoint.establish_client(sizes) {
            Ok(()) => Ok(endpoint),
            Err(e) => {
                endpoint.teardown();
                endpoint.state.fail();
                Err(e)
            }
        }
    }

    /// Listens on `addr` and accepts the first connection. The first receive is posted before
    /// the connection is accepted.
    pub fn accept(
        fabric: F,
        addr: SocketAddr,
        sizes: BufferSizes,
        options: EndpointOptions,
    ) -> Result<Self, Error> {
        let mut endpoint = Self::new(fabric, addr, Role::Server, options);
        match endpoint.establish_server(sizes) {
            Ok(()) => Ok(endpoint),
            Err(e) => {
                endpoint.teardown();
                endpoint.state.fail();
                Err(e)
            }
        }
    }

    fn establish_client(&mut self, sizes: BufferSizes) -> Result<(), Error> {
        let resolve_timeout = self.options.resolve_timeout;

        self.state.step(Step::ResolveAddr)?;
        self.fabric.resolve_addr(self.peer, resolve_timeout)?;
        self.await_event(Some(resolve_timeout))?;

        self.state.step(Step::ResolveRoute)?;
        self.fabric.resolve_route(resolve_timeout)?;
        self.await_event(Some(resolve_timeout))?;

        self.create_resources(sizes)?;

        let param = ConnParam {
            private_data: self.local_descriptor()?.encode().to_vec(),
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: CONNECT_RETRY_COUNT,
            rnr_retry_count: RNR_RETRY_COUNT,
        };
        self.state.step(Step::Connect)?;
        self.fabric.connect(&param)?;
        let established = self.await_event(self.options.connect_timeout)?;
        self.remote = Some(RemoteBufferDescriptor::decode(&established.private_data)?);
        log::debug!("connected to {}, remote buffer {:?}", self.peer, self.remote);
        Ok(())
    }

    fn establish_server(&mut self, sizes: BufferSizes) -> Result<(), Error> {
        self.state.step(Step::Listen)?;
        self.fabric.listen(self.peer, 1)?;
        log::info!("listening on {}", self.peer);
        let request = self.await_event(self.options.accept_timeout)?;
        // a peer that does not advertise its buffer is still served
        self.remote = RemoteBufferDescriptor::decode(&request.private_data).ok();

        self.create_resources(sizes)?;
        self.post_recv()?;

        let param = ConnParam {
            private_data: self.local_descriptor()?.encode().to_vec(),
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: CONNECT_RETRY_COUNT,
            rnr_retry_count: RNR_RETRY_COUNT,
        };
        self.state.step(Step::Connect)?;
        self.fabric.accept(&param)?;
        self.await_event(self.options.connect_timeout)?;
        log::debug!("accepted connection, remote buffer {:?}", self.remote);
        Ok(())
    }

    fn await_event(&mut self, timeout: Option<Duration>) -> Result<CmEvent, Error> {
        match self.fabric.get_cm_event(timeout)? {
            Some(event) => {
                self.state.on_event(event.kind, event.status)?;
                Ok(event)
            }
            None => Err(self.state.on_timeout(timeout.unwrap_or_default())),
        }
    }

    /// Protection domain, both memory regions, the armed completion queue and the queue pair,
    /// in that order.
    fn create_resources(&mut self, sizes: BufferSizes) -> Result<(), Error> {
        self.fabric.alloc_pd()?;
        self.acquired.push(Resource::ProtectionDomain);

        self.buffers.allocate(Region::Recv, sizes.recv)?;
        self.buffers.allocate(Region::Send, sizes.send)?;
        for region in [Region::Recv, Region::Send] {
            self.buffers
                .register(&mut self.fabric, region, self.options.access)?;
            self.acquired.push(Resource::MemoryRegion(region));
        }

        self.fabric.create_cq(CQ_ENTRIES)?;
        self.acquired.push(Resource::CompletionQueue);
        self.fabric.req_notify_cq()?;

        self.fabric.create_qp(&self.options.qp_cap)?;
        self.acquired.push(Resource::QueuePair);

        self.state.step(Step::CreateQueuePair)
    }

    fn can_post(&self) -> Result<(), Error> {
        match self.state {
            EndpointState::QueuePairCreated
            | EndpointState::Connecting
            | EndpointState::Established => Ok(()),
            from => Err(Error::InvalidTransition {
                from,
                step: "post work request",
            }),
        }
    }

    /// Posts a receive spanning the whole receive buffer.
    pub fn post_recv(&mut self) -> Result<(), Error> {
        self.can_post()?;
        let id = WrId::Recv;
        if self.outstanding[id as usize] {
            return Err(Error::OutstandingRequest(id.as_raw()));
        }
        let len = self.recv_capacity();
        // SAFETY: the buffer stays mapped until teardown, which destroys the queue pair (and
        // with it every outstanding request) before unmapping.
        unsafe { self.fabric.post_recv(id.as_raw(), Region::Recv, len)? };
        self.outstanding[id as usize] = true;
        Ok(())
    }

    /// Posts a signaled send of the first `len` bytes of the send buffer.
    pub fn post_send(&mut self, len: usize) -> Result<(), Error> {
        self.can_post()?;
        let id = WrId::Send;
        if self.outstanding[id as usize] {
            return Err(Error::OutstandingRequest(id.as_raw()));
        }
        if len > self.send_capacity() {
            return Err(Error::SendTooLarge {
                len,
                capacity: self.send_capacity(),
            });
        }
        let remote = self.remote.unwrap_or_default();
        // SAFETY: see `post_recv`; the send buffer is not handed out while the send is in flight.
        unsafe {
            self.fabric
                .post_send(id.as_raw(), Region::Send, len, SendFlags::SIGNALED, remote)?
        };
        self.outstanding[id as usize] = true;
        Ok(())
    }

    /// Returns the next completion, whichever request it belongs to.
    pub fn wait_next(&mut self) -> Result<Completion, Error> {
        match self.poller.wait_next(&mut self.fabric) {
            Ok(completion) => {
                self.outstanding[completion.wr_id() as usize] = false;
                Ok(completion)
            }
            Err(e) => {
                if let Error::Transport { wr_id, .. } = &e {
                    if let Some(id) = WrId::from_raw(*wr_id) {
                        self.outstanding[id as usize] = false;
                    }
                }
                Err(e)
            }
        }
    }

    /// Waits until the request `id` completes. Completions of the other request that show up
    /// meanwhile are retired on the way.
    pub fn wait_for(&mut self, id: WrId) -> Result<Completion, Error> {
        if !self.outstanding[id as usize] {
            return Err(Error::InvalidTransition {
                from: self.state,
                step: "wait for a request that was never posted",
            });
        }
        loop {
            let completion = self.wait_next()?;
            if completion.wr_id() == id {
                return Ok(completion);
            }
            log::trace!("retired {:?} while waiting for {:?}", completion, id);
        }
    }

    #[inline]
    pub fn is_outstanding(&self, id: WrId) -> bool {
        self.outstanding[id as usize]
    }

    /// Receive buffer contents and the send buffer to fill, together.
    ///
    /// The receive buffer may already be the target of the next posted receive. Nothing stops
    /// the peer from sending into it while the caller still reads it: a client sends its pull
    /// trigger as soon as its pushes complete, so on hardware the trigger can overwrite the
    /// head of the share while it is being encoded. Callers must copy out what they need
    /// before the repost if that matters.
    pub fn buffers_mut(&mut self) -> Result<(&[u8], &mut [u8]), Error> {
        if self.outstanding[WrId::Send as usize] {
            return Err(Error::OutstandingRequest(WrId::Send.as_raw()));
        }
        self.buffers
            .split_mut()
            .ok_or_else(|| Error::InvalidTransition {
                from: self.state,
                step: "access released buffers",
            })
    }

    pub fn send_buf_mut(&mut self) -> Result<&mut [u8], Error> {
        self.buffers_mut().map(|(_, send)| send)
    }

    pub fn recv_buf(&self) -> Result<&[u8], Error> {
        self.buffers
            .buffer(Region::Recv)
            .map(|buf| &buf[..])
            .ok_or_else(|| Error::InvalidTransition {
                from: self.state,
                step: "access released buffers",
            })
    }

    #[inline]
    pub fn send_capacity(&self) -> usize {
        self.buffers.buffer(Region::Send).map_or(0, |buf| buf.len())
    }

    #[inline]
    pub fn recv_capacity(&self) -> usize {
        self.buffers.buffer(Region::Recv).map_or(0, |buf| buf.len())
    }

    /// Descriptor of our receive buffer, as advertised to the peer.
    pub fn local_descriptor(&self) -> Result<RemoteBufferDescriptor, Error> {
        self.buffers
            .registered(Region::Recv)
            .map(|region| region.descriptor())
            .ok_or_else(|| Error::InvalidTransition {
                from: self.state,
                step: "describe an unregistered buffer",
            })
    }

    /// The peer's receive buffer, if it advertised one.
    #[inline]
    pub fn remote(&self) -> Option<RemoteBufferDescriptor> {
        self.remote
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn fabric(&self) -> &F {
        &self.fabric
    }

    #[cfg(test)]
    pub(crate) fn fabric_mut(&mut self) -> &mut F {
        &mut self.fabric
    }

    /// Disconnects if connected, then releases every acquired resource in reverse order of
    /// acquisition: queue pair, completion queue, memory regions, protection domain, event
    /// channel. Host buffers are unmapped last. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.acquired.is_empty() {
            return;
        }

        if self.state == EndpointState::Established {
            if self.state.step(Step::Disconnect).is_ok() {
                if let Err(e) = self.fabric.disconnect() {
                    log::warn!("disconnect from {} failed: {}", self.peer, e);
                }
            }
        }

        while let Some(resource) = self.acquired.pop() {
            if let Err(e) = self.fabric.release(resource) {
                log::warn!("releasing {:?} of {} failed: {}", resource, self.peer, e);
            }
            if let Resource::MemoryRegion(region) = resource {
                self.buffers.unregistered(region);
            }
            log::debug!("released {:?} of {}", resource, self.peer);
        }
        self.buffers.free();
        self.outstanding = [false; 2];

        match self.state {
            EndpointState::Disconnecting => {
                let _ = self.state.step(Step::Close);
            }
            EndpointState::Failed | EndpointState::Closed => {}
            _ => self.state = EndpointState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::mock::{Call, FailAt, Journal, MockFabric};
    use crate::fabric::{CmEventKind, WcOpcode, WcStatus, WorkCompletion};

    const SIZES: BufferSizes = BufferSizes {
        send: 4096,
        recv: 6144,
    };

    fn peer() -> SocketAddr {
        "10.0.0.6:20079".parse().unwrap()
    }

    fn server_descriptor() -> Vec<u8> {
        RemoteBufferDescriptor {
            addr: 0x7000_0000,
            rkey: 99,
        }
        .encode()
        .to_vec()
    }

    fn client_events() -> Vec<CmEvent> {
        vec![
            CmEvent::new(CmEventKind::AddrResolved),
            CmEvent::new(CmEventKind::RouteResolved),
            CmEvent::with_private_data(CmEventKind::Established, server_descriptor()),
        ]
    }

    fn releases(journal: &Journal) -> Vec<Resource> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::Release(resource) => Some(*resource),
                _ => None,
            })
            .collect()
    }

    fn connected() -> (ConnectionEndpoint<MockFabric>, Journal) {
        let fabric = MockFabric::new(client_events());
        let journal = fabric.journal.clone();
        let endpoint =
            ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
                .unwrap();
        (endpoint, journal)
    }

    #[test]
    fn client_acquires_in_order() {
        let (endpoint, journal) = connected();
        assert_eq!(endpoint.state(), EndpointState::Established);
        assert_eq!(
            endpoint.remote(),
            Some(RemoteBufferDescriptor {
                addr: 0x7000_0000,
                rkey: 99
            })
        );
        let calls = journal.lock().unwrap().clone();
        assert_eq!(
            &calls[..8],
            &[
                Call::ResolveAddr(peer()),
                Call::ResolveRoute,
                Call::AllocPd,
                Call::RegMr(Region::Recv, SIZES.recv),
                Call::RegMr(Region::Send, SIZES.send),
                Call::CreateCq,
                Call::Arm,
                Call::CreateQp,
            ]
        );
        let local = endpoint.local_descriptor().unwrap().encode().to_vec();
        assert_eq!(calls[8], Call::Connect(local));
    }

    #[test]
    fn teardown_releases_in_reverse_order() {
        let (mut endpoint, journal) = connected();
        endpoint.teardown();
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert_eq!(
            releases(&journal),
            vec![
                Resource::QueuePair,
                Resource::CompletionQueue,
                Resource::MemoryRegion(Region::Send),
                Resource::MemoryRegion(Region::Recv),
                Resource::ProtectionDomain,
                Resource::EventChannel,
            ]
        );
        let calls = journal.lock().unwrap();
        let disconnect = calls.iter().position(|c| *c == Call::Disconnect).unwrap();
        let first_release = calls
            .iter()
            .position(|c| matches!(c, Call::Release(_)))
            .unwrap();
        assert!(disconnect < first_release);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (mut endpoint, journal) = connected();
        endpoint.teardown();
        let after_first = journal.lock().unwrap().len();
        endpoint.teardown();
        drop(endpoint);
        assert_eq!(journal.lock().unwrap().len(), after_first);
        assert_eq!(releases(&journal).len(), 6);
    }

    #[test]
    fn drop_tears_down() {
        let (endpoint, journal) = connected();
        drop(endpoint);
        assert_eq!(releases(&journal).len(), 6);
    }

    #[test]
    fn failed_queue_pair_releases_what_was_acquired() {
        let mut fabric = MockFabric::new(client_events());
        fabric.fail_at = Some(FailAt::CreateQp);
        let journal = fabric.journal.clone();
        let err = ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::QueuePairCreation(_)));
        assert_eq!(
            releases(&journal),
            vec![
                Resource::CompletionQueue,
                Resource::MemoryRegion(Region::Send),
                Resource::MemoryRegion(Region::Recv),
                Resource::ProtectionDomain,
                Resource::EventChannel,
            ]
        );
        assert!(!journal.lock().unwrap().contains(&Call::Disconnect));
    }

    #[test]
    fn failed_registration_releases_the_domain() {
        let mut fabric = MockFabric::new(client_events());
        fabric.fail_at = Some(FailAt::RegMr);
        let journal = fabric.journal.clone();
        let err = ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::MemoryRegistration(_)));
        assert_eq!(
            releases(&journal),
            vec![Resource::ProtectionDomain, Resource::EventChannel]
        );
    }

    #[test]
    fn out_of_order_event_fails_the_endpoint() {
        let fabric = MockFabric::new([
            CmEvent::new(CmEventKind::AddrResolved),
            CmEvent::new(CmEventKind::Established),
        ]);
        let journal = fabric.journal.clone();
        let err = ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                state: EndpointState::RouteResolving,
                event: CmEventKind::Established,
            }
        ));
        assert_eq!(releases(&journal), vec![Resource::EventChannel]);
    }

    #[test]
    fn silence_during_resolution_times_out() {
        let fabric = MockFabric::new([]);
        let err = ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ResolutionTimeout { .. }));
    }

    #[test]
    fn established_without_descriptor_is_rejected() {
        let fabric = MockFabric::new([
            CmEvent::new(CmEventKind::AddrResolved),
            CmEvent::new(CmEventKind::RouteResolved),
            CmEvent::new(CmEventKind::Established),
        ]);
        let journal = fabric.journal.clone();
        let err = ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPrivateData(0)));
        // the connection came up, so it is disconnected before the release
        assert!(journal.lock().unwrap().contains(&Call::Disconnect));
        assert_eq!(releases(&journal).len(), 6);
    }

    #[test]
    fn server_posts_receive_before_accepting() {
        let fabric = MockFabric::new([
            CmEvent::with_private_data(CmEventKind::ConnectRequest, server_descriptor()),
            CmEvent::new(CmEventKind::Established),
        ]);
        let journal = fabric.journal.clone();
        let endpoint = ConnectionEndpoint::accept(
            fabric,
            "0.0.0.0:20079".parse().unwrap(),
            SIZES,
            EndpointOptions::default(),
        )
        .unwrap();
        assert_eq!(endpoint.role(), Role::Server);
        assert!(endpoint.is_outstanding(WrId::Recv));

        let calls = journal.lock().unwrap().clone();
        let post = calls
            .iter()
            .position(|c| *c == Call::PostRecv(0, SIZES.recv))
            .unwrap();
        let accept = calls
            .iter()
            .position(|c| matches!(c, Call::Accept(_)))
            .unwrap();
        assert!(post < accept);
    }

    #[test]
    fn one_request_per_id_at_a_time() {
        let (mut endpoint, _journal) = connected();
        endpoint.post_send(16).unwrap();
        assert!(matches!(
            endpoint.post_send(16),
            Err(Error::OutstandingRequest(1))
        ));
        assert!(matches!(
            endpoint.send_buf_mut(),
            Err(Error::OutstandingRequest(1))
        ));
        endpoint.post_recv().unwrap();
        assert!(matches!(
            endpoint.post_recv(),
            Err(Error::OutstandingRequest(0))
        ));
    }

    #[test]
    fn buffers_stay_readable_under_a_posted_receive() {
        let (mut endpoint, _journal) = connected();
        endpoint.post_recv().unwrap();
        let (recv, send) = endpoint.buffers_mut().unwrap();
        assert_eq!((recv.len(), send.len()), (SIZES.recv, SIZES.send));
        endpoint.post_send(16).unwrap();
        assert!(matches!(
            endpoint.buffers_mut(),
            Err(Error::OutstandingRequest(1))
        ));
    }

    #[test]
    fn oversized_send_is_refused() {
        let (mut endpoint, journal) = connected();
        let posted = journal.lock().unwrap().len();
        assert!(matches!(
            endpoint.post_send(SIZES.send + 1),
            Err(Error::SendTooLarge {
                len: 4097,
                capacity: 4096
            })
        ));
        assert!(!endpoint.is_outstanding(WrId::Send));
        assert_eq!(journal.lock().unwrap().len(), posted);
        endpoint.post_send(SIZES.send).unwrap();
    }

    #[test]
    fn wait_for_retires_the_other_request() {
        let fabric = MockFabric::new(client_events());
        let mut endpoint =
            ConnectionEndpoint::connect(fabric, peer(), SIZES, EndpointOptions::default())
                .unwrap();
        endpoint.post_recv().unwrap();
        endpoint.post_send(64).unwrap();
        endpoint.fabric.completions.extend([
            WorkCompletion {
                wr_id: 1,
                status: WcStatus::Success,
                opcode: WcOpcode::Send,
                byte_len: 64,
            },
            WorkCompletion {
                wr_id: 0,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: 6144,
            },
        ]);
        let completion = endpoint.wait_for(WrId::Recv).unwrap();
        assert_eq!(completion, Completion::Inbound { byte_len: 6144 });
        assert!(!endpoint.is_outstanding(WrId::Send));
        assert!(!endpoint.is_outstanding(WrId::Recv));
    }
}
