//! Sources: continuously read lines from a live stream and push them into the
//! record queue.
//!
//! A source owns the queue writer for its whole life and drops it on return,
//! so the queue is closed exactly once on every path (clean end, error or
//! cancellation). Writes block while the queue is full; that is the only flow
//! control between the tailer and the publisher.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::queue::{QueueWriter, ReaderGone};
use crate::record::Record;

/// How often a followed file is checked for appended data.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a source may keep running after its stdout ends.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Default source command: the system journal in follow mode, one JSON
/// object per line.
pub const DEFAULT_COMMAND: [&str; 5] = ["journalctl", "--system", "-f", "-o", "json"];

/// Counters reported by a source when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailStats {
    /// Records delivered to the queue.
    pub lines: u64,
}

/// Generic trait for line sources.
///
/// Implementors push one record per line into `queue` until the stream ends,
/// fails, or `cancel` fires. Cancellation is a clean stop, not an error.
#[async_trait::async_trait]
pub trait LineSource {
    async fn stream(
        self,
        queue: QueueWriter,
        cancel: CancellationToken,
    ) -> Result<TailStats, PipelineError>;
}

/// Why the line pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    EndOfStream,
    Cancelled,
    ReaderGone,
}

/// Read `reader` line by line into `queue`.
///
/// With `follow` set, end of data means "wait for more" and a trailing
/// partial line is held back until its newline arrives.
async fn pump<R>(
    mut reader: R,
    follow: bool,
    key: Option<&[u8]>,
    queue: &QueueWriter,
    cancel: &CancellationToken,
    stats: &mut TailStats,
) -> Result<Stop, PipelineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Stop::Cancelled),
            read = reader.read_until(b'\n', &mut buf) => read.map_err(PipelineError::SourceRead)?,
        };

        if read == 0 {
            if follow {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(Stop::Cancelled),
                    _ = sleep(FOLLOW_POLL_INTERVAL) => continue,
                }
            }
            if !buf.is_empty() {
                let record = Record::from_line(key, &buf);
                if let Some(stop) = deliver(queue, cancel, record, stats).await {
                    return Ok(stop);
                }
            }
            return Ok(Stop::EndOfStream);
        }

        if follow && !buf.ends_with(b"\n") {
            continue;
        }

        let record = Record::from_line(key, &buf);
        buf.clear();
        if let Some(stop) = deliver(queue, cancel, record, stats).await {
            return Ok(stop);
        }
    }
}

async fn deliver(
    queue: &QueueWriter,
    cancel: &CancellationToken,
    record: Record,
    stats: &mut TailStats,
) -> Option<Stop> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(Stop::Cancelled),
        sent = queue.send(record) => match sent {
            Ok(()) => {
                stats.lines += 1;
                None
            }
            Err(ReaderGone(_)) => Some(Stop::ReaderGone),
        },
    }
}

/// Tails the standard output of a subprocess.
///
/// The child is killed when the tailer is cancelled or fails, and never
/// outlives it.
#[derive(Debug, Clone)]
pub struct CommandTail {
    pub program: String,
    pub args: Vec<String>,
    pub key: Option<Vec<u8>>,
}

impl CommandTail {
    pub fn new(command: &[String], key: Option<Vec<u8>>) -> Result<Self, PipelineError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PipelineError::Config("source command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            key,
        })
    }
}

#[async_trait::async_trait]
impl LineSource for CommandTail {
    async fn stream(
        self,
        queue: QueueWriter,
        cancel: CancellationToken,
    ) -> Result<TailStats, PipelineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::SourceSpawn {
                program: self.program.clone(),
                source,
            })?;
        info!(program = %self.program, pid = ?child.id(), "Source started");

        let stdout = child.stdout.take().ok_or_else(|| PipelineError::SourceSpawn {
            program: self.program.clone(),
            source: std::io::Error::other("stdout not captured"),
        })?;

        let mut stats = TailStats::default();
        let stop = pump(
            BufReader::new(stdout),
            false,
            self.key.as_deref(),
            &queue,
            &cancel,
            &mut stats,
        )
        .await;

        match stop {
            Ok(Stop::EndOfStream) => {
                queue.close();
                let exited = tokio::select! {
                    _ = cancel.cancelled() => None,
                    exited = timeout(CHILD_EXIT_GRACE, child.wait()) => exited.ok(),
                };
                match exited {
                    Some(Ok(status)) if !status.success() => {
                        warn!(
                            program = %self.program,
                            %status,
                            "Source exited with failure status"
                        );
                    }
                    Some(Ok(_)) => debug!(program = %self.program, "Source exited"),
                    Some(Err(e)) => {
                        warn!(program = %self.program, error = %e, "Failed to reap source");
                    }
                    None => {
                        warn!(
                            program = %self.program,
                            "Source still running after closing stdout, killing it"
                        );
                        let _ = child.kill().await;
                    }
                }
                info!(lines = stats.lines, "Source reached end of stream");
                Ok(stats)
            }
            Ok(stop) => {
                if let Err(e) = child.kill().await {
                    warn!(program = %self.program, error = %e, "Failed to kill source");
                }
                info!(lines = stats.lines, reason = ?stop, "Source stopped");
                Ok(stats)
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

/// Follows a file for appended lines, like `tail -f`.
#[derive(Debug, Clone)]
pub struct FileTail {
    pub path: PathBuf,
    /// Read existing content first instead of starting at the end.
    pub from_start: bool,
    pub key: Option<Vec<u8>>,
}

#[async_trait::async_trait]
impl LineSource for FileTail {
    async fn stream(
        self,
        queue: QueueWriter,
        cancel: CancellationToken,
    ) -> Result<TailStats, PipelineError> {
        let mut file = File::open(&self.path)
            .await
            .map_err(|source| PipelineError::SourceSpawn {
                program: self.path.display().to_string(),
                source,
            })?;
        if !self.from_start {
            file.seek(SeekFrom::End(0))
                .await
                .map_err(PipelineError::SourceRead)?;
        }
        info!(path = %self.path.display(), from_start = self.from_start, "Following file");

        let mut stats = TailStats::default();
        let stop = pump(
            BufReader::new(file),
            true,
            self.key.as_deref(),
            &queue,
            &cancel,
            &mut stats,
        )
        .await?;
        info!(lines = stats.lines, reason = ?stop, "File tail stopped");
        Ok(stats)
    }
}

/// The source selected on the command line.
#[derive(Debug, Clone)]
pub enum Source {
    Command(CommandTail),
    File(FileTail),
}

#[async_trait::async_trait]
impl LineSource for Source {
    async fn stream(
        self,
        queue: QueueWriter,
        cancel: CancellationToken,
    ) -> Result<TailStats, PipelineError> {
        match self {
            Source::Command(tail) => tail.stream(queue, cancel).await,
            Source::File(tail) => tail.stream(queue, cancel).await,
        }
    }
}
