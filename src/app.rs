use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Config;
use crate::publisher::BatchPublisher;
use crate::signal::wait_for_shutdown;
use crate::sink::{KlevSink, LogMetadata};
use crate::supervisor;

/// Application runtime: wires the source, the sink client and the publisher,
/// and turns operator signals into cancellation.
pub async fn run(config: Config) -> Result<()> {
    let sink =
        KlevSink::new(config.sink.clone()).context("failed to build log service client")?;
    let metadata = LogMetadata::now(&config.origin, &config.unit);
    let publisher = BatchPublisher::new(sink, metadata, config.publisher.clone());

    let cancel = CancellationToken::new();
    let signals = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                received = wait_for_shutdown() => match received {
                    Ok(signal) => {
                        info!(%signal, "Shutdown signal received, stopping pipeline");
                        cancel.cancel();
                    }
                    Err(e) => warn!(error = %e, "Failed to install signal handlers"),
                },
            }
        }
    });

    let result = supervisor::run(
        config.source,
        publisher,
        config.queue_capacity,
        cancel.clone(),
    )
    .await;

    // Stop listening for signals once the pipeline is done
    cancel.cancel();
    let _ = signals.await;

    let summary = result?;
    info!(
        lines = summary.tail.lines,
        records = summary.publish.records,
        batches = summary.publish.batches,
        eager_flushes = summary.publish.eager_flushes,
        idle_flushes = summary.publish.idle_flushes,
        final_flushes = summary.publish.final_flushes,
        "Pipeline finished"
    );
    Ok(())
}
