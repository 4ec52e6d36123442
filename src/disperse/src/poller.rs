use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::fabric::{Fabric, WcStatus, WorkCompletion};
use crate::wire::WrId;
use crate::Error;

const POLL_BATCH: usize = 4;

/// A successful work completion, classified by its work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A posted receive was filled.
    Inbound { byte_len: u32 },
    /// A posted send went out.
    Outbound { byte_len: u32 },
}

impl Completion {
    #[inline]
    pub fn wr_id(&self) -> WrId {
        match self {
            Completion::Inbound { .. } => WrId::Recv,
            Completion::Outbound { .. } => WrId::Send,
        }
    }

    #[inline]
    pub fn byte_len(&self) -> u32 {
        match *self {
            Completion::Inbound { byte_len } | Completion::Outbound { byte_len } => byte_len,
        }
    }
}

/// Turns completion-channel notifications into completions, one at a time.
///
/// Each wait reads one channel event, acknowledges it, re-arms the queue and drains it.
/// Completions drained beyond the one returned are kept and handed out first next time.
#[derive(Debug)]
pub struct CompletionPoller {
    timeout: Option<Duration>,
    backlog: VecDeque<WorkCompletion>,
    scratch: Vec<WorkCompletion>,
}

impl CompletionPoller {
    pub fn new(timeout: Option<Duration>) -> Self {
        CompletionPoller {
            timeout,
            backlog: VecDeque::new(),
            scratch: Vec::with_capacity(POLL_BATCH),
        }
    }

    /// Completions already drained but not yet returned.
    #[inline]
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    pub fn wait_next<F: Fabric>(&mut self, fabric: &mut F) -> Result<Completion, Error> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(wc) = self.backlog.pop_front() {
                return classify(wc);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !fabric.get_cq_event(remaining)? {
                return Err(Error::CompletionTimeout(self.timeout.unwrap_or_default()));
            }
            fabric.ack_cq_events(1);
            fabric.req_notify_cq()?;
            self.drain(fabric)?;
        }
    }

    fn drain<F: Fabric>(&mut self, fabric: &mut F) -> Result<(), Error> {
        loop {
            let n = fabric.poll_cq(&mut self.scratch, POLL_BATCH)?;
            self.backlog.extend(self.scratch.drain(..));
            if n < POLL_BATCH {
                return Ok(());
            }
        }
    }
}

fn classify(wc: WorkCompletion) -> Result<Completion, Error> {
    if wc.status != WcStatus::Success {
        return Err(Error::Transport {
            wr_id: wc.wr_id,
            status: wc.status,
        });
    }
    match WrId::from_raw(wc.wr_id) {
        Some(WrId::Recv) => Ok(Completion::Inbound {
            byte_len: wc.byte_len,
        }),
        Some(WrId::Send) => Ok(Completion::Outbound {
            byte_len: wc.byte_len,
        }),
        None => Err(Error::UnknownWorkRequest(wc.wr_id)),
    }
}
