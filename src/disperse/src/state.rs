//! Connection lifecycle of an endpoint.
//!
//! Client: `Init -> AddrResolving -> AddrResolved -> RouteResolving -> RouteResolved ->
//! QueuePairCreated -> Connecting -> Established -> Disconnecting -> Closed`.
//!
//! Server: `Init -> Listening -> ConnectRequested -> QueuePairCreated -> Connecting ->
//! Established -> Disconnecting -> Closed`.
//!
//! Any failure leads to `Failed`, which is terminal.
use crate::fabric::CmEventKind;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Init,
    AddrResolving,
    AddrResolved,
    RouteResolving,
    RouteResolved,
    Listening,
    ConnectRequested,
    QueuePairCreated,
    Connecting,
    Established,
    Disconnecting,
    Closed,
    Failed,
}

/// Transitions the endpoint makes on its own, as opposed to those driven by CM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ResolveAddr,
    ResolveRoute,
    Listen,
    CreateQueuePair,
    Connect,
    Disconnect,
    Close,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::ResolveAddr => "resolve address",
            Step::ResolveRoute => "resolve route",
            Step::Listen => "listen",
            Step::CreateQueuePair => "create queue pair",
            Step::Connect => "connect",
            Step::Disconnect => "disconnect",
            Step::Close => "close",
        }
    }
}

impl EndpointState {
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, EndpointState::Failed)
    }

    /// Takes a locally initiated step.
    pub fn step(&mut self, step: Step) -> Result<(), Error> {
        use EndpointState::*;
        let next = match (*self, step) {
            (Init, Step::ResolveAddr) => AddrResolving,
            (AddrResolved, Step::ResolveRoute) => RouteResolving,
            (Init, Step::Listen) => Listening,
            (RouteResolved | ConnectRequested, Step::CreateQueuePair) => QueuePairCreated,
            (QueuePairCreated, Step::Connect) => Connecting,
            (Established, Step::Disconnect) => Disconnecting,
            (Disconnecting, Step::Close) => Closed,
            (from, step) => {
                *self = Failed;
                return Err(Error::InvalidTransition {
                    from,
                    step: step.name(),
                });
            }
        };
        log::debug!("endpoint {:?} -> {:?}", *self, next);
        *self = next;
        Ok(())
    }

    /// Consumes a connection-manager event. An event the current state does not expect moves
    /// the endpoint to `Failed`.
    pub fn on_event(&mut self, event: CmEventKind, status: i32) -> Result<(), Error> {
        use EndpointState::*;
        let next = match (*self, event) {
            (AddrResolving, CmEventKind::AddrResolved) => Ok(AddrResolved),
            (AddrResolving, CmEventKind::AddrError) => Err(Error::AddressResolution { status }),
            (RouteResolving, CmEventKind::RouteResolved) => Ok(RouteResolved),
            (RouteResolving, CmEventKind::RouteError) => Err(Error::RouteResolution { status }),
            (Listening, CmEventKind::ConnectRequest) => Ok(ConnectRequested),
            (Connecting, CmEventKind::Established) => Ok(Established),
            (
                Connecting,
                CmEventKind::Rejected | CmEventKind::Unreachable | CmEventKind::ConnectError,
            ) => Err(Error::ConnectionRejected { event, status }),
            (Established, CmEventKind::Disconnected) => Ok(Disconnecting),
            (state, event) => Err(Error::ProtocolViolation { state, event }),
        };
        match next {
            Ok(next) => {
                log::debug!("endpoint {:?} -> {:?} on {:?}", *self, next, event);
                *self = next;
                Ok(())
            }
            Err(e) => {
                *self = Failed;
                Err(e)
            }
        }
    }

    /// The deadline for the awaited event expired.
    pub fn on_timeout(&mut self, timeout: std::time::Duration) -> Error {
        let err = match *self {
            EndpointState::AddrResolving => Error::ResolutionTimeout {
                stage: "address resolution",
                timeout,
            },
            EndpointState::RouteResolving => Error::ResolutionTimeout {
                stage: "route resolution",
                timeout,
            },
            _ => Error::ConnectTimeout(timeout),
        };
        *self = EndpointState::Failed;
        err
    }

    /// Marks the endpoint failed for reasons outside the state machine, e.g. a provider call
    /// that returned an error.
    #[inline]
    pub fn fail(&mut self) {
        *self = EndpointState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client_established() -> EndpointState {
        let mut state = EndpointState::Init;
        state.step(Step::ResolveAddr).unwrap();
        state.on_event(CmEventKind::AddrResolved, 0).unwrap();
        state.step(Step::ResolveRoute).unwrap();
        state.on_event(CmEventKind::RouteResolved, 0).unwrap();
        state.step(Step::CreateQueuePair).unwrap();
        state.step(Step::Connect).unwrap();
        state.on_event(CmEventKind::Established, 0).unwrap();
        state
    }

    #[test]
    fn client_path() {
        let mut state = client_established();
        assert_eq!(state, EndpointState::Established);
        state.step(Step::Disconnect).unwrap();
        state.step(Step::Close).unwrap();
        assert_eq!(state, EndpointState::Closed);
    }

    #[test]
    fn server_path() {
        let mut state = EndpointState::Init;
        state.step(Step::Listen).unwrap();
        state.on_event(CmEventKind::ConnectRequest, 0).unwrap();
        state.step(Step::CreateQueuePair).unwrap();
        state.step(Step::Connect).unwrap();
        state.on_event(CmEventKind::Established, 0).unwrap();
        assert_eq!(state, EndpointState::Established);
    }

    #[test]
    fn unexpected_event_fails() {
        let mut state = EndpointState::Init;
        state.step(Step::ResolveAddr).unwrap();
        let err = state.on_event(CmEventKind::RouteResolved, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                state: EndpointState::AddrResolving,
                event: CmEventKind::RouteResolved
            }
        ));
        assert!(state.is_failed());
    }

    #[test]
    fn established_before_connect_fails() {
        let mut state = EndpointState::Init;
        state.step(Step::ResolveAddr).unwrap();
        state.on_event(CmEventKind::AddrResolved, 0).unwrap();
        assert!(state.on_event(CmEventKind::Established, 0).is_err());
        assert!(state.is_failed());
    }

    #[test]
    fn failed_is_terminal() {
        let mut state = EndpointState::Failed;
        for event in [
            CmEventKind::AddrResolved,
            CmEventKind::RouteResolved,
            CmEventKind::Established,
            CmEventKind::ConnectRequest,
        ] {
            assert!(state.on_event(event, 0).is_err());
            assert!(state.is_failed());
        }
        for step in [Step::ResolveAddr, Step::Listen, Step::Connect, Step::Close] {
            assert!(state.step(step).is_err());
            assert!(state.is_failed());
        }
    }

    #[test]
    fn error_events_map_to_their_kind() {
        let mut state = EndpointState::AddrResolving;
        assert!(matches!(
            state.on_event(CmEventKind::AddrError, -110),
            Err(Error::AddressResolution { status: -110 })
        ));

        let mut state = EndpointState::RouteResolving;
        assert!(matches!(
            state.on_event(CmEventKind::RouteError, -1),
            Err(Error::RouteResolution { .. })
        ));

        let mut state = EndpointState::Connecting;
        assert!(matches!(
            state.on_event(CmEventKind::Rejected, 28),
            Err(Error::ConnectionRejected {
                event: CmEventKind::Rejected,
                status: 28
            })
        ));
        assert!(state.is_failed());
    }

    #[test]
    fn timeouts_name_the_stage() {
        let timeout = Duration::from_millis(5000);
        let mut state = EndpointState::AddrResolving;
        assert!(matches!(
            state.on_timeout(timeout),
            Error::ResolutionTimeout {
                stage: "address resolution",
                ..
            }
        ));
        assert!(state.is_failed());

        let mut state = EndpointState::RouteResolving;
        assert!(matches!(
            state.on_timeout(timeout),
            Error::ResolutionTimeout {
                stage: "route resolution",
                ..
            }
        ));
        assert!(state.is_failed());

        let mut state = EndpointState::Connecting;
        assert!(matches!(state.on_timeout(timeout), Error::ConnectTimeout(_)));
    }

    #[test]
    fn local_steps_out_of_order_fail() {
        let mut state = EndpointState::Init;
        assert!(matches!(
            state.step(Step::Connect),
            Err(Error::InvalidTransition {
                from: EndpointState::Init,
                ..
            })
        ));
        assert!(state.is_failed());
    }
}
