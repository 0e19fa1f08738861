//! Runs the tailer and the batch publisher side by side.
//!
//! Both tasks share one cancellation token. The first task to fail cancels
//! the other; the supervisor always waits for both before returning and
//! reports the first failure. The tailer's error wins a tie.

use std::sync::OnceLock;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::publisher::{BatchPublisher, PublishStats};
use crate::queue;
use crate::sink::Sink;
use crate::tail::{LineSource, TailStats};

/// Final counters of a clean run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tail: TailStats,
    pub publish: PublishStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Tailer,
    Publisher,
}

fn joined<T>(
    task: &'static str,
    result: Result<Result<T, PipelineError>, JoinError>,
) -> Result<T, PipelineError> {
    match result {
        Ok(result) => result,
        Err(e) => Err(PipelineError::TaskPanicked {
            task,
            message: e.to_string(),
        }),
    }
}

/// Run `source` into `publisher` through a queue of `queue_capacity` slots
/// until the source ends, either task fails, or `cancel` fires.
pub async fn run<L, S>(
    source: L,
    publisher: BatchPublisher<S>,
    queue_capacity: usize,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineError>
where
    L: LineSource + Send + 'static,
    S: Sink + 'static,
{
    let (writer, reader) = queue::bounded(queue_capacity);

    let tailer = tokio::spawn(source.stream(writer, cancel.clone()));
    let publisher = tokio::spawn(publisher.run(reader, cancel.clone()));
    info!(queue_capacity, "Pipeline started");

    // `join!` polls the tailer first, so it also takes a same-poll tie.
    let first_failure = OnceLock::new();
    let tail = async {
        let result = joined("tailer", tailer.await);
        if let Err(e) = &result {
            let _ = first_failure.set(Task::Tailer);
            error!(error = %e, "Tailer failed, cancelling publisher");
            cancel.cancel();
        }
        result
    };
    let publish = async {
        let result = joined("publisher", publisher.await);
        if let Err(e) = &result {
            let _ = first_failure.set(Task::Publisher);
            error!(error = %e, "Publisher failed, cancelling tailer");
            cancel.cancel();
        }
        result
    };
    let (tail, publish) = tokio::join!(tail, publish);

    match (tail, publish) {
        (Ok(tail), Ok(publish)) => Ok(RunSummary { tail, publish }),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(tail), Err(publish)) => match first_failure.get() {
            Some(Task::Publisher) => Err(publish),
            _ => Err(tail),
        },
    }
}
