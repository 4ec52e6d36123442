//! The exchange between the coordinator and a peer over an established connection.
//!
//! The coordinator pushes its share and keeps a receive posted for the reply; later it pulls
//! by sending a one-byte trigger and waiting for that receive to complete. The peer waits for
//! a message, reposts its receive, and if the message was a share it encodes it and sends the
//! fragments back.
use std::time::{Duration, Instant};

use crate::config::DisperseConfig;
use crate::encode::Encode;
use crate::endpoint::ConnectionEndpoint;
use crate::fabric::Fabric;
use crate::wire::WrId;
use crate::Error;

/// Length of the message that asks a peer for its fragments.
pub const PULL_TRIGGER_LEN: usize = 1;

/// Sends the whole send buffer. The receive for the peer's reply is posted first.
///
/// Returns the number of bytes sent.
pub fn push<F: Fabric>(endpoint: &mut ConnectionEndpoint<F>) -> Result<usize, Error> {
    endpoint.post_recv()?;
    let len = endpoint.send_capacity();
    endpoint.post_send(len)?;
    endpoint.wait_for(WrId::Send)?;
    Ok(len)
}

/// Sends the trigger and waits for the receive posted by [`push`] to complete.
///
/// Returns the number of bytes received.
pub fn pull<F: Fabric>(endpoint: &mut ConnectionEndpoint<F>) -> Result<usize, Error> {
    if !endpoint.is_outstanding(WrId::Recv) {
        return Err(Error::InvalidTransition {
            from: endpoint.state(),
            step: "pull without a posted receive",
        });
    }
    endpoint.post_send(PULL_TRIGGER_LEN)?;
    let inbound = endpoint.wait_for(WrId::Recv)?;
    if endpoint.is_outstanding(WrId::Send) {
        endpoint.wait_for(WrId::Send)?;
    }
    Ok(inbound.byte_len() as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStep {
    /// A share arrived and its fragments were sent back.
    Encoded {
        input_len: usize,
        reply_len: usize,
        encode_time: Duration,
    },
    /// A message shorter than a stripe: nothing to encode, nothing to send.
    Triggered { len: usize },
}

/// One iteration of the peer side.
pub fn serve_once<F: Fabric, E: Encode + ?Sized>(
    endpoint: &mut ConnectionEndpoint<F>,
    encoder: &E,
    shape: &DisperseConfig,
    parallelism: usize,
) -> Result<ServeStep, Error> {
    let inbound = endpoint.wait_for(WrId::Recv)?;
    let input_len = inbound.byte_len() as usize;
    endpoint.post_recv()?;

    let (columns, rows) = (shape.column_count, shape.row_count);
    if input_len < columns {
        log::debug!("{} byte trigger from {}", input_len, endpoint.peer());
        return Ok(ServeStep::Triggered { len: input_len });
    }

    let stripe = input_len / columns;
    let reply_len = stripe * rows;
    if reply_len > endpoint.send_capacity() {
        return Err(Error::Config(format!(
            "{} bytes of fragments do not fit a {} byte send buffer",
            reply_len,
            endpoint.send_capacity()
        )));
    }

    let start = Instant::now();
    {
        let (input, output) = endpoint.buffers_mut()?;
        let mut fragments: Vec<&mut [u8]> = output[..reply_len].chunks_mut(stripe).collect();
        encoder.encode(&input[..input_len], columns, rows, &mut fragments, parallelism);
    }
    let encode_time = start.elapsed();
    log::debug!(
        "encoded {} bytes into {} fragments in {:?}",
        input_len,
        rows,
        encode_time
    );

    endpoint.post_send(reply_len)?;
    endpoint.wait_for(WrId::Send)?;
    Ok(ServeStep::Encoded {
        input_len,
        reply_len,
        encode_time,
    })
}
