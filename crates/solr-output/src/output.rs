// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output lifecycle: init, one call per inbound envelope, exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BatchConfig;
use crate::codec::decode_all;
use crate::config::Config;
use crate::errors::OutputError;
use crate::processor::{BufferedProcessor, DataProcessor, FlushOutcome};
use crate::record::RecordOptions;
use crate::solr::{SolrClient, SolrDataProcessor};

/// Status handed back to the sender of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The whole envelope was decoded and buffered.
    Ok,
    /// Decoding stopped early. Entries before the bad one were still buffered.
    Error,
}

/// A running output instance. Shared by reference between the transport and the shutdown path.
pub struct SolrOutput<P = SolrDataProcessor> {
    engine: BufferedProcessor<P>,
    record_options: RecordOptions,
    timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SolrOutput<SolrDataProcessor> {
    /// Builds the Solr client and the batch engine, and starts the periodic flush if enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(config: &Config) -> Result<Self, OutputError> {
        let client = SolrClient::new(&config.solr)?;
        info!(
            "Solr output ready, sending to {} (max buffer size {}, {} retries every {:?})",
            client.update_url(),
            config.batch.effective_max_buffer_size(),
            config.batch.max_retries,
            config.batch.retry_interval
        );
        Ok(Self::with_processor(
            config.batch.clone(),
            config.record.clone(),
            Arc::new(SolrDataProcessor::new(client)),
            CancellationToken::new(),
        ))
    }
}

impl<P> SolrOutput<P>
where
    P: DataProcessor + 'static,
{
    pub fn with_processor(
        batch: BatchConfig,
        record_options: RecordOptions,
        processor: Arc<P>,
        cancel_token: CancellationToken,
    ) -> Self {
        let time_based_processing = batch.time_based_processing;
        let engine = BufferedProcessor::new(batch, processor, cancel_token);
        let timer = time_based_processing.then(|| engine.start_time_based_flush());
        SolrOutput {
            engine,
            record_options,
            timer: Mutex::new(timer),
            closed: AtomicBool::new(false),
        }
    }

    /// Token cancelled by [`SolrOutput::exit`]. Cancelling it also cuts retry waits short.
    pub fn cancel_token(&self) -> CancellationToken {
        self.engine.cancel_token()
    }

    pub fn engine(&self) -> &BufferedProcessor<P> {
        &self.engine
    }

    /// Decodes one envelope and appends its records in order.
    ///
    /// Returns once every appended record is buffered, or flushed when the buffer filled up.
    /// After [`SolrOutput::exit`] the records are flushed right away, so they reach either the
    /// processor or its failure handler.
    pub async fn flush(&self, data: &[u8], tag: &str) -> FlushStatus {
        let (entries, error) = decode_all(data, &self.record_options);
        let decoded = entries.len();
        debug!("Decoded {decoded} records from envelope tagged {tag}");

        if !entries.is_empty() {
            self.engine
                .append_batch(entries.into_iter().map(|entry| entry.record))
                .await;
            // exit() marks the output closed before its final flush, so records appended
            // after that flush are caught here.
            if self.is_closed() {
                warn!("Received {decoded} records tagged {tag} after exit, flushing immediately");
                self.engine.flush().await;
            }
        }

        match error {
            None => FlushStatus::Ok,
            Some(e) => {
                warn!("Failed to decode envelope tagged {tag} after {decoded} records: {e}");
                FlushStatus::Error
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the periodic flush, waits for it to finish and flushes whatever is left.
    pub async fn exit(&self) -> FlushOutcome {
        self.closed.store(true, Ordering::SeqCst);
        let cancel_token = self.engine.cancel_token();
        cancel_token.cancel();

        let timer = self.timer.lock().await.take();
        if let Some(handle) = timer {
            if let Err(e) = handle.await {
                warn!("Time based flush task failed: {e}");
            }
        }

        let outcome = self.engine.shutdown().await;
        info!("Solr output stopped: {outcome:?}");
        outcome
    }
}
