// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP transport feeding envelopes into a [`SolrOutput`].
//!
//! Every connection carries exactly one envelope: the sender writes the msgpack chunk and closes
//! its side of the connection. At most `max_connections` envelopes are read at once, each bounded
//! in size and in time.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::OutputError;
use crate::output::{FlushStatus, SolrOutput};
use crate::processor::DataProcessor;

pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 24240;
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Envelopes larger than this are dropped.
    pub max_envelope_bytes: usize,
    /// Envelopes not fully received within this time are dropped.
    pub read_timeout: Duration,
    /// Connections handled concurrently. Further connections wait in the accept backlog.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            host: DEFAULT_LISTEN_HOST.to_string(),
            port: DEFAULT_LISTEN_PORT,
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Accepts envelope connections and hands them to the output.
pub struct EnvelopeListener<P> {
    listener: TcpListener,
    output: Arc<SolrOutput<P>>,
    max_envelope_bytes: usize,
    read_timeout: Duration,
    connections: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
}

impl<P> EnvelopeListener<P>
where
    P: DataProcessor + 'static,
{
    pub async fn new(
        config: &ListenerConfig,
        output: Arc<SolrOutput<P>>,
        cancel_token: CancellationToken,
    ) -> Result<Self, OutputError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(EnvelopeListener {
            listener,
            output,
            max_envelope_bytes: config.max_envelope_bytes,
            read_timeout: config.read_timeout,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            tracker: TaskTracker::new(),
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the cancellation token fires, then waits for the connections
    /// already accepted to be handed to the output.
    pub async fn spin(self) {
        match self.local_addr() {
            Ok(addr) => info!("Listening for envelopes on {addr}"),
            Err(e) => warn!("Listening for envelopes on an unknown address: {e}"),
        }

        loop {
            let permit = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => permit,
            };
            // The semaphore is never closed.
            let Ok(permit) = permit else { break };

            let accepted = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let output = Arc::clone(&self.output);
                    let max_envelope_bytes = self.max_envelope_bytes;
                    let read_timeout = self.read_timeout;
                    self.tracker.spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, peer, output, max_envelope_bytes, read_timeout)
                            .await;
                    });
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            }
        }

        self.tracker.close();
        if !self.tracker.is_empty() {
            debug!("Waiting for {} connections to finish", self.tracker.len());
        }
        self.tracker.wait().await;
        debug!("Envelope listener stopped");
    }
}

async fn handle_connection<P>(
    stream: TcpStream,
    peer: SocketAddr,
    output: Arc<SolrOutput<P>>,
    max_envelope_bytes: usize,
    read_timeout: Duration,
) where
    P: DataProcessor + 'static,
{
    let data = match read_envelope(stream, max_envelope_bytes, read_timeout).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            warn!("Dropping envelope from {peer}: larger than {max_envelope_bytes} bytes");
            return;
        }
        Err(e) => {
            error!("Failed to read envelope from {peer}: {e}");
            return;
        }
    };

    debug!("Received {} bytes from {peer}", data.len());
    let tag = peer.to_string();
    if output.flush(&data, &tag).await == FlushStatus::Error {
        warn!("Envelope from {peer} was only partially forwarded");
    }
}

/// Reads until EOF. `None` when the envelope exceeds `max_bytes`, a `TimedOut` error when EOF
/// is not reached within `read_timeout`.
async fn read_envelope<R>(
    reader: R,
    max_bytes: usize,
    read_timeout: Duration,
) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let mut data = Vec::new();
    tokio::time::timeout(read_timeout, reader.take(limit).read_to_end(&mut data))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("envelope not received within {read_timeout:?}"),
            )
        })??;
    if data.len() > max_bytes {
        return Ok(None);
    }
    Ok(Some(data))
}
