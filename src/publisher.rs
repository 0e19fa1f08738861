//! Batch publisher: drains the record queue and appends records to the sink
//! in batches.
//!
//! Each loop iteration prefers, in this order:
//!
//! 1. a record that is ready right now: buffer it, and if the buffer grew past
//!    the high-water mark publish exactly that many of the oldest records;
//! 2. a closed queue: publish whatever is left and stop;
//! 3. nothing ready: publish everything pending, and only when nothing is
//!    pending, block until a record arrives or the queue closes.
//!
//! Bursts are therefore cut into high-water-mark sized batches, and a quiet
//! source never leaves records sitting in the buffer. The buffer is FIFO and
//! partial flushes always take from the front, so the sink sees records in
//! exactly the order the source produced them.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, SinkError};
use crate::queue::{QueueReader, TryNext};
use crate::record::Record;
use crate::sink::{LogId, LogMetadata, Sink};

pub const DEFAULT_HIGH_WATER_MARK: usize = 24;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Pending length above which an eager partial flush happens.
    pub high_water_mark: usize,
    /// Extra attempts for a failed publish. Zero means a failure is fatal
    /// straight away and the batch is dropped.
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for every further one.
    pub retry_backoff: Duration,
    /// How long publishing may continue once cancellation fires.
    pub shutdown_grace: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_retries: 0,
            retry_backoff: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Counters reported when the publisher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub records: u64,
    pub batches: u64,
    pub eager_flushes: u64,
    pub idle_flushes: u64,
    pub final_flushes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushKind {
    Eager,
    Idle,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flushed {
    Published,
    /// Cancellation fired and the publish did not finish within the grace
    /// period. The batch is gone.
    Abandoned,
}

pub struct BatchPublisher<S> {
    sink: S,
    metadata: LogMetadata,
    config: PublisherConfig,
    stats: PublishStats,
}

impl<S: Sink> BatchPublisher<S> {
    pub fn new(sink: S, metadata: LogMetadata, config: PublisherConfig) -> Self {
        Self {
            sink,
            metadata,
            config,
            stats: PublishStats::default(),
        }
    }

    /// Create the target log, then publish records from `queue` until it
    /// closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut queue: QueueReader,
        cancel: CancellationToken,
    ) -> Result<PublishStats, PipelineError> {
        let log = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelled before the target log was created");
                return Ok(self.stats);
            }
            created = self.sink.create_log(&self.metadata) => {
                created.map_err(PipelineError::CreateLog)?
            }
        };
        info!(
            log_id = %log,
            source = %self.metadata.source,
            unit = %self.metadata.unit,
            "Publishing to log"
        );

        let mut pending: Vec<Record> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return self.shutdown(&log, &mut queue, &mut pending, &cancel).await;
            }

            match queue.try_next() {
                TryNext::Record(record) => {
                    pending.push(record);
                    let mark = self.config.high_water_mark;
                    if pending.len() > mark
                        && self
                            .flush(&log, &mut pending, mark, FlushKind::Eager, &cancel)
                            .await?
                            == Flushed::Abandoned
                    {
                        return Ok(self.stats);
                    }
                }
                TryNext::Closed => {
                    self.flush_all(&log, &mut pending, FlushKind::Final, &cancel)
                        .await?;
                    return Ok(self.finished());
                }
                TryNext::Empty if !pending.is_empty() => {
                    if self
                        .flush_all(&log, &mut pending, FlushKind::Idle, &cancel)
                        .await?
                        == Flushed::Abandoned
                    {
                        return Ok(self.stats);
                    }
                }
                TryNext::Empty => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return self.shutdown(&log, &mut queue, &mut pending, &cancel).await;
                        }
                        next = queue.next() => match next {
                            Some(record) => pending.push(record),
                            None => return Ok(self.finished()),
                        },
                    }
                }
            }
        }
    }

    /// Take what is already queued without waiting and publish it all.
    async fn shutdown(
        &mut self,
        log: &LogId,
        queue: &mut QueueReader,
        pending: &mut Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<PublishStats, PipelineError> {
        while let TryNext::Record(record) = queue.try_next() {
            pending.push(record);
        }
        info!(pending = pending.len(), "Cancelled, flushing remaining records");
        self.flush_all(log, pending, FlushKind::Final, cancel).await?;
        Ok(self.stats)
    }

    async fn flush_all(
        &mut self,
        log: &LogId,
        pending: &mut Vec<Record>,
        kind: FlushKind,
        cancel: &CancellationToken,
    ) -> Result<Flushed, PipelineError> {
        if pending.is_empty() {
            return Ok(Flushed::Published);
        }
        let count = pending.len();
        self.flush(log, pending, count, kind, cancel).await
    }

    /// Publish the oldest `count` pending records as one batch and remove
    /// them from the buffer, whatever the outcome.
    async fn flush(
        &mut self,
        log: &LogId,
        pending: &mut Vec<Record>,
        count: usize,
        kind: FlushKind,
        cancel: &CancellationToken,
    ) -> Result<Flushed, PipelineError> {
        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        let outcome = loop {
            match self.publish(log, &pending[..count], cancel).await {
                Some(Ok(next_offset)) => {
                    debug!(?kind, size = count, next_offset, "Batch published");
                    self.record_flush(kind, count);
                    break Ok(Flushed::Published);
                }
                None => {
                    warn!(
                        ?kind,
                        size = count,
                        "Publish abandoned after shutdown grace period"
                    );
                    break Ok(Flushed::Abandoned);
                }
                Some(Err(e)) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Publish failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!(
                                ?kind,
                                size = count,
                                "Cancelled while backing off, dropping batch"
                            );
                            break Ok(Flushed::Abandoned);
                        }
                        _ = sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Some(Err(e)) => break Err(PipelineError::Publish(e)),
            }
        };
        pending.drain(..count);
        outcome
    }

    /// One publish call. Once cancellation fires the call gets at most the
    /// shutdown grace period; `None` means it ran out.
    async fn publish(
        &self,
        log: &LogId,
        batch: &[Record],
        cancel: &CancellationToken,
    ) -> Option<Result<u64, SinkError>> {
        let call = self.sink.publish(log, batch);
        tokio::pin!(call);
        tokio::select! {
            biased;
            result = &mut call => Some(result),
            _ = cancel.cancelled() => timeout(self.config.shutdown_grace, &mut call).await.ok(),
        }
    }

    fn finished(&self) -> PublishStats {
        info!(
            records = self.stats.records,
            batches = self.stats.batches,
            "Queue closed, publisher done"
        );
        self.stats
    }

    fn record_flush(&mut self, kind: FlushKind, size: usize) {
        self.stats.records += size as u64;
        self.stats.batches += 1;
        match kind {
            FlushKind::Eager => self.stats.eager_flushes += 1,
            FlushKind::Idle => self.stats.idle_flushes += 1,
            FlushKind::Final => self.stats.final_flushes += 1,
        }
    }
}
