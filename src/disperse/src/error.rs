use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::fabric::{CmEventKind, WcStatus};
use crate::state::EndpointState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{stage} did not complete within {timeout:?}")]
    ResolutionTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("address resolution failed, status {status}")]
    AddressResolution { status: i32 },
    #[error("route resolution failed, status {status}")]
    RouteResolution { status: i32 },
    #[error("connection rejected: {event:?}, status {status}")]
    ConnectionRejected { event: CmEventKind, status: i32 },
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to create queue pair: {0}")]
    QueuePairCreation(io::Error),
    #[error("failed to register memory region: {0}")]
    MemoryRegistration(io::Error),
    #[error("failed to allocate {size} bytes: {source}")]
    Allocation { size: usize, source: io::Error },
    #[error("completion channel: {0}")]
    CompletionChannel(io::Error),
    #[error("no work completion within {0:?}")]
    CompletionTimeout(Duration),
    #[error("work request {wr_id} completed with {status}")]
    Transport { wr_id: u64, status: WcStatus },
    #[error("unexpected {event:?} in state {state:?}")]
    ProtocolViolation {
        state: EndpointState,
        event: CmEventKind,
    },
    #[error("illegal transition from {from:?}: {step}")]
    InvalidTransition {
        from: EndpointState,
        step: &'static str,
    },
    #[error("work completion with unknown id {0}")]
    UnknownWorkRequest(u64),
    #[error("a work request with id {0} is already outstanding")]
    OutstandingRequest(u64),
    #[error("private data of {0} bytes does not hold a buffer descriptor")]
    InvalidPrivateData(usize),
    #[error("send of {len} bytes exceeds the {capacity} byte send buffer")]
    SendTooLarge { len: usize, capacity: usize },
    #[error("rdmacm: {0}")]
    RdmaCm(io::Error),
    #[error("ibv: {0}")]
    Ibv(io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO Error {0}")]
    Io(#[from] io::Error),
    #[error("connecting to {peer} failed, aborting the run: {source}")]
    ConnectAborted {
        peer: String,
        #[source]
        source: Box<Error>,
    },
    #[error("worker for {0} panicked")]
    WorkerPanicked(String),
}

impl Error {
    /// Process exit code for this kind of failure. Every kind maps to a distinct non-zero value.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ResolutionTimeout { .. } => 10,
            Error::AddressResolution { .. } => 11,
            Error::RouteResolution { .. } => 12,
            Error::ConnectionRejected { .. } => 13,
            Error::ConnectTimeout(_) => 14,
            Error::QueuePairCreation(_) => 20,
            Error::MemoryRegistration(_) => 21,
            Error::Allocation { .. } => 22,
            Error::CompletionChannel(_) => 23,
            Error::CompletionTimeout(_) => 30,
            Error::Transport { .. } => 31,
            Error::ProtocolViolation { .. } => 40,
            Error::InvalidTransition { .. } => 41,
            Error::UnknownWorkRequest(_) => 42,
            Error::OutstandingRequest(_) => 43,
            Error::InvalidPrivateData(_) => 44,
            Error::SendTooLarge { .. } => 45,
            Error::RdmaCm(_) => 50,
            Error::Ibv(_) => 51,
            Error::Config(_) => 60,
            Error::Io(_) => 61,
            Error::ConnectAborted { source, .. } => source.exit_code(),
            Error::WorkerPanicked(_) => 70,
        }
    }

    /// The peer went away while a request was outstanding: its work request was flushed.
    pub fn is_flush(&self) -> bool {
        matches!(self, Error::Transport { status, .. } if status.is_flush())
    }
}
