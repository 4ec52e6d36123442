//! The peer side: accept one connection and encode every share it receives.
use std::time::Duration;

use crate::config::ServerConfig;
use crate::encode::Encode;
use crate::endpoint::{BufferSizes, ConnectionEndpoint, EndpointOptions};
use crate::fabric::Provider;
use crate::protocol::{self, ServeStep};
use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub encoded: u64,
    pub triggers: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub encode_time: Duration,
}

impl ServeSummary {
    fn record(&mut self, step: &ServeStep) {
        match *step {
            ServeStep::Encoded {
                input_len,
                reply_len,
                encode_time,
            } => {
                self.encoded += 1;
                self.bytes_in += input_len as u64;
                self.bytes_out += reply_len as u64;
                self.encode_time += encode_time;
            }
            ServeStep::Triggered { .. } => self.triggers += 1,
        }
    }
}

/// Why [`EncodeServeLoop::run`] stopped, with what was served until then.
#[derive(Debug, thiserror::Error)]
#[error("{error} (after {} encoded requests)", .summary.encoded)]
pub struct ServeError {
    pub summary: ServeSummary,
    #[source]
    pub error: Error,
}

pub struct EncodeServeLoop<P: Provider, E: Encode> {
    provider: P,
    config: ServerConfig,
    encoder: E,
}

impl<P: Provider, E: Encode> EncodeServeLoop<P, E> {
    pub fn new(provider: P, config: ServerConfig, encoder: E) -> Result<Self, Error> {
        config.validate()?;
        Ok(EncodeServeLoop {
            provider,
            config,
            encoder,
        })
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts one connection and serves it until it fails, or until `max_iterations` shares
    /// have been encoded. The connection is torn down before returning either way.
    pub fn run(&self) -> Result<ServeSummary, ServeError> {
        let options = EndpointOptions::from_timeouts(&self.config.timeouts);
        let sizes = BufferSizes::server(&self.config.disperse);
        let mut summary = ServeSummary::default();

        let mut endpoint = self
            .provider
            .open()
            .and_then(|fabric| ConnectionEndpoint::accept(fabric, self.config.listen, sizes, options))
            .map_err(|error| ServeError { summary, error })?;
        log::info!(
            "serving {} with {} encoder threads",
            endpoint.peer(),
            self.config.parallelism
        );

        loop {
            let step = match protocol::serve_once(
                &mut endpoint,
                &self.encoder,
                &self.config.disperse,
                self.config.parallelism,
            ) {
                Ok(step) => step,
                Err(error) => {
                    if error.is_flush() {
                        log::info!("connection closed by peer: {}", error);
                    } else {
                        log::error!("serving failed: {}", error);
                    }
                    return Err(ServeError { summary, error });
                }
            };
            summary.record(&step);
            if let ServeStep::Encoded {
                input_len,
                reply_len,
                encode_time,
            } = step
            {
                log::info!(
                    "request {}: {} bytes in, {} bytes out, encoded in {:?}",
                    summary.encoded,
                    input_len,
                    reply_len,
                    encode_time
                );
            }
            if self
                .config
                .max_iterations
                .map_or(false, |max| summary.encoded >= max)
            {
                log::info!("served {} requests, stopping", summary.encoded);
                return Ok(summary);
            }
        }
    }
}
