// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered batch processing of decoded records.
//!
//! Records are appended to a shared [`BatchContext`]. A batch is flushed either inline, when an
//! append fills the buffer, or by a background task every `process_interval`. Both paths go
//! through the same mutex, which is held across the whole flush (read, `process` calls, retry
//! waits and clear), so at most one flush runs at a time and an append never touches a batch
//! that is being shipped.
//!
//! A failing batch is retried `max_retries` times, `retry_interval` apart. When every attempt
//! failed the processor's `handle_error` is called once and the batch is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::{BatchConfig, BatchContext};
use crate::record::Record;

const MIN_PROCESS_INTERVAL: Duration = Duration::from_millis(1);

/// Destination of flushed batches.
///
/// `process` may be called several times with the same batch when retrying and must not keep the
/// slice past the call. `handle_error` is called once per dropped batch and must not fail.
#[async_trait]
pub trait DataProcessor: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn process(&self, batch: &[Record]) -> Result<(), Self::Error>;

    async fn handle_error(&self, batch: &[Record], error: Self::Error);
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// The batch was accepted after `attempts` calls to `process`.
    Delivered { attempts: u32 },
    /// Every attempt failed (or shutdown interrupted the retries) and the batch was dropped.
    Exhausted { attempts: u32 },
}

/// Owns the batch buffer and decides when it is flushed to a [`DataProcessor`].
pub struct BufferedProcessor<P> {
    context: Arc<Mutex<BatchContext>>,
    processor: Arc<P>,
    config: BatchConfig,
    cancel_token: CancellationToken,
}

impl<P> Clone for BufferedProcessor<P> {
    fn clone(&self) -> Self {
        BufferedProcessor {
            context: Arc::clone(&self.context),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}

impl<P> BufferedProcessor<P>
where
    P: DataProcessor + 'static,
{
    pub fn new(config: BatchConfig, processor: Arc<P>, cancel_token: CancellationToken) -> Self {
        BufferedProcessor {
            context: Arc::new(Mutex::new(BatchContext::new(&config))),
            processor,
            config,
            cancel_token,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Number of records currently waiting for a flush.
    pub async fn buffered(&self) -> usize {
        self.context.lock().await.len()
    }

    /// Appends a record, flushing inline when the buffer is full.
    ///
    /// When a flush is triggered this only returns once the batch was delivered or dropped,
    /// including every retry wait.
    pub async fn append(&self, record: Record) {
        let mut context = self.context.lock().await;
        self.push_locked(&mut context, record).await;
    }

    /// Appends records in order under a single lock acquisition.
    pub async fn append_batch<I>(&self, records: I)
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: Send,
    {
        let mut context = self.context.lock().await;
        for record in records {
            self.push_locked(&mut context, record).await;
        }
    }

    /// Flushes whatever is buffered, regardless of the size threshold.
    pub async fn flush(&self) -> FlushOutcome {
        let mut context = self.context.lock().await;
        self.flush_locked(&mut context).await
    }

    /// Spawns the periodic flush. The task stops once the cancellation token fires.
    pub fn start_time_based_flush(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_time_based_flush().await })
    }

    /// Stops the periodic flush and flushes the remainder once.
    ///
    /// The cancelled token also cuts short any retry wait, so the final flush makes a single
    /// attempt.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.cancel_token.cancel();
        self.flush().await
    }

    async fn push_locked(&self, context: &mut BatchContext, record: Record) {
        context.push(record);
        if context.is_full() {
            debug!("Buffer holds {} records, flushing", context.len());
            self.flush_locked(context).await;
        }
    }

    async fn flush_locked(&self, context: &mut BatchContext) -> FlushOutcome {
        if context.is_empty() {
            return FlushOutcome::Empty;
        }
        let outcome = self.try_flush(context.records()).await;
        // Dropped batches are not kept around either; the processor saw the failure.
        context.clear();
        outcome
    }

    async fn try_flush(&self, batch: &[Record]) -> FlushOutcome {
        let max_attempts = self.config.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                "Flushing {} records (attempt {attempts}/{max_attempts})",
                batch.len()
            );

            let error = match self.processor.process(batch).await {
                Ok(()) => {
                    debug!("Successfully flushed {} records", batch.len());
                    return FlushOutcome::Delivered { attempts };
                }
                Err(e) => e,
            };

            if attempts >= max_attempts {
                warn!(
                    "Dropping {} records after {attempts} failed attempts: {error}",
                    batch.len()
                );
                self.processor.handle_error(batch, error).await;
                return FlushOutcome::Exhausted { attempts };
            }

            warn!(
                "Failed to flush {} records (attempt {attempts}/{max_attempts}), retrying in {:?}: {error}",
                batch.len(),
                self.config.retry_interval
            );

            let cancelled = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => true,
                () = tokio::time::sleep(self.config.retry_interval) => false,
            };
            if cancelled {
                warn!(
                    "Shutdown requested, dropping {} records after {attempts} attempts: {error}",
                    batch.len()
                );
                self.processor.handle_error(batch, error).await;
                return FlushOutcome::Exhausted { attempts };
            }
        }
    }

    async fn run_time_based_flush(&self) {
        let period = self.config.process_interval.max(MIN_PROCESS_INTERVAL);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        debug!("Time based flush started, period {period:?}");
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.flush().await {
                FlushOutcome::Empty => {}
                outcome => debug!("Time based flush finished: {outcome:?}"),
            }
        }
        debug!("Time based flush stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, Instant};

    #[derive(Debug, thiserror::Error)]
    #[error("mock failure on call {0}")]
    struct MockError(usize);

    #[derive(Default)]
    struct MockProcessor {
        failures: AtomicUsize,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        call_times: StdMutex<Vec<Instant>>,
        delivered: StdMutex<Vec<Vec<Record>>>,
        dropped: StdMutex<Vec<(Vec<Record>, String)>>,
    }

    impl MockProcessor {
        fn failing(failures: usize) -> Self {
            MockProcessor {
                failures: AtomicUsize::new(failures),
                ..MockProcessor::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            MockProcessor {
                delay,
                ..MockProcessor::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn delivered(&self) -> Vec<Vec<Record>> {
            self.delivered.lock().unwrap().clone()
        }

        fn dropped(&self) -> Vec<(Vec<Record>, String)> {
            self.dropped.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataProcessor for MockProcessor {
        type Error = MockError;

        async fn process(&self, batch: &[Record]) -> Result<(), MockError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.call_times.lock().unwrap().push(Instant::now());

            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(MockError(call));
            }
            self.delivered.lock().unwrap().push(batch.to_vec());
            Ok(())
        }

        async fn handle_error(&self, batch: &[Record], error: MockError) {
            self.dropped
                .lock()
                .unwrap()
                .push((batch.to_vec(), error.to_string()));
        }
    }

    fn record(msg: &str) -> Record {
        Record::new(HashMap::from([("msg".to_string(), msg.to_string())]))
    }

    fn config(max_buffer_size: usize, max_retries: u32) -> BatchConfig {
        BatchConfig {
            max_buffer_size,
            max_retries,
            retry_interval: Duration::from_secs(10),
            time_based_processing: false,
            process_interval: Duration::from_secs(5),
        }
    }

    fn engine(
        config: BatchConfig,
        processor: MockProcessor,
    ) -> (BufferedProcessor<MockProcessor>, Arc<MockProcessor>) {
        let processor = Arc::new(processor);
        let engine = BufferedProcessor::new(
            config,
            Arc::clone(&processor),
            CancellationToken::new(),
        );
        (engine, processor)
    }

    #[tokio::test]
    async fn test_append_below_threshold_does_not_flush() {
        let (engine, processor) = engine(config(3, 0), MockProcessor::default());

        engine.append(record("a")).await;
        engine.append(record("b")).await;

        assert_eq!(processor.calls(), 0);
        assert_eq!(engine.buffered().await, 2);
    }

    #[tokio::test]
    async fn test_append_at_threshold_flushes_once() {
        let (engine, processor) = engine(config(3, 0), MockProcessor::default());

        for msg in ["a", "b", "c"] {
            engine.append(record(msg)).await;
        }

        assert_eq!(processor.calls(), 1);
        assert_eq!(
            processor.delivered(),
            vec![vec![record("a"), record("b"), record("c")]]
        );
        assert_eq!(engine.buffered().await, 0);

        engine.append(record("d")).await;
        assert_eq!(processor.calls(), 1);
        assert_eq!(engine.buffered().await, 1);
    }

    #[tokio::test]
    async fn test_append_batch_flushes_per_threshold() {
        let (engine, processor) = engine(config(2, 0), MockProcessor::default());

        engine
            .append_batch(vec![record("a"), record("b"), record("c")])
            .await;

        assert_eq!(processor.delivered(), vec![vec![record("a"), record("b")]]);
        assert_eq!(engine.buffered().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let (engine, processor) = engine(config(2, 3), MockProcessor::failing(2));

        engine.append(record("a")).await;
        engine.append(record("b")).await;

        assert_eq!(processor.calls(), 3);
        assert_eq!(processor.delivered(), vec![vec![record("a"), record("b")]]);
        assert!(processor.dropped().is_empty());

        let times = processor.call_times.lock().unwrap().clone();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch() {
        let (engine, processor) = engine(config(2, 2), MockProcessor::failing(3));

        engine.append(record("a")).await;
        engine.append(record("b")).await;

        assert_eq!(processor.calls(), 3);
        assert!(processor.delivered().is_empty());
        let dropped = processor.dropped();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, vec![record("a"), record("b")]);
        assert_eq!(dropped[0].1, "mock failure on call 3");
        assert_eq!(engine.buffered().await, 0);

        // The dropped batch is not resent with the next one.
        engine.append(record("c")).await;
        engine.append(record("d")).await;
        assert_eq!(processor.delivered(), vec![vec![record("c"), record("d")]]);
    }

    #[tokio::test]
    async fn test_flush_empty_buffer() {
        let (engine, processor) = engine(config(2, 0), MockProcessor::default());

        assert_eq!(engine.flush().await, FlushOutcome::Empty);
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn test_manual_flush_reports_attempts() {
        let (engine, _processor) = engine(config(10, 0), MockProcessor::default());

        engine.append(record("a")).await;

        assert_eq!(
            engine.flush().await,
            FlushOutcome::Delivered { attempts: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_flush() {
        let mut config = config(100, 0);
        config.time_based_processing = true;
        let (engine, processor) = engine(config, MockProcessor::default());
        let handle = engine.start_time_based_flush();

        engine.append(record("a")).await;
        engine.append(record("b")).await;

        sleep(Duration::from_secs(6)).await;
        assert_eq!(processor.delivered(), vec![vec![record("a"), record("b")]]);

        // Empty ticks never reach the processor.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(processor.calls(), 1);

        engine.cancel_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_never_overlap() {
        let mut config = config(3, 0);
        config.process_interval = Duration::from_millis(50);
        let (engine, processor) =
            engine(config, MockProcessor::slow(Duration::from_millis(120)));
        let timer = engine.start_time_based_flush();

        let mut producers = Vec::new();
        for producer in 0..4 {
            let engine = engine.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..10 {
                    engine.append(record(&format!("{producer}-{i}"))).await;
                    sleep(Duration::from_millis(30)).await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        engine.shutdown().await;
        timer.await.unwrap();

        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
        let total: usize = processor.delivered().iter().map(Vec::len).sum();
        assert_eq!(total, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_retry_wait() {
        let mut config = config(1, 5);
        config.retry_interval = Duration::from_secs(3600);
        let (engine, processor) = engine(config, MockProcessor::failing(usize::MAX));

        let appender = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.append(record("a")).await })
        };
        sleep(Duration::from_secs(1)).await;
        engine.cancel_token().cancel();
        appender.await.unwrap();

        assert_eq!(processor.calls(), 1);
        assert_eq!(processor.dropped().len(), 1);
        assert_eq!(engine.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder_and_stops_timer() {
        let mut config = config(100, 3);
        config.time_based_processing = true;
        let (engine, processor) = engine(config, MockProcessor::default());
        let timer = engine.start_time_based_flush();

        engine.append(record("a")).await;

        assert_eq!(
            engine.shutdown().await,
            FlushOutcome::Delivered { attempts: 1 }
        );
        timer.await.unwrap();
        assert_eq!(processor.delivered(), vec![vec![record("a")]]);
    }
}
