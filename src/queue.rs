//! Bounded single-producer/single-consumer record queue between the tailer
//! and the batch publisher.
//!
//! The writer half is not `Clone`, so exactly one producer exists and the
//! queue is closed exactly once: when that writer is dropped or `close`d.

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::record::Record;

/// Default number of slots, also the default for `--queue-capacity`.
pub const DEFAULT_CAPACITY: usize = 32;

/// Create a queue with `capacity` slots.
pub fn bounded(capacity: usize) -> (QueueWriter, QueueReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueWriter { tx }, QueueReader { rx })
}

/// Producer half. Dropping it closes the queue.
#[derive(Debug)]
pub struct QueueWriter {
    tx: mpsc::Sender<Record>,
}

/// The consumer is gone, so nobody will ever read this record.
#[derive(Debug)]
pub struct ReaderGone(pub Record);

impl QueueWriter {
    /// Push a record, waiting while the queue is full.
    pub async fn send(&self, record: Record) -> Result<(), ReaderGone> {
        self.tx.send(record).await.map_err(|e| ReaderGone(e.0))
    }

    /// Close the queue. Records already written stay readable.
    pub fn close(self) {}
}

/// Outcome of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum TryNext {
    Record(Record),
    Empty,
    Closed,
}

/// Consumer half.
#[derive(Debug)]
pub struct QueueReader {
    rx: mpsc::Receiver<Record>,
}

impl QueueReader {
    /// Take a record if one is ready, without waiting.
    pub fn try_next(&mut self) -> TryNext {
        match self.rx.try_recv() {
            Ok(record) => TryNext::Record(record),
            Err(TryRecvError::Empty) => TryNext::Empty,
            Err(TryRecvError::Disconnected) => TryNext::Closed,
        }
    }

    /// Wait for the next record. `None` once the queue is closed and drained.
    ///
    /// Cancel safe: a record is never lost if this future is dropped.
    pub async fn next(&mut self) -> Option<Record> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_order_after_close() {
        let (writer, mut reader) = bounded(4);
        for i in 0..3 {
            writer.send(Record::value(format!("r{i}"))).await.unwrap();
        }
        writer.close();

        assert_eq!(reader.try_next(), TryNext::Record(Record::value("r0")));
        assert_eq!(reader.next().await, Some(Record::value("r1")));
        assert_eq!(reader.try_next(), TryNext::Record(Record::value("r2")));
        assert_eq!(reader.try_next(), TryNext::Closed);
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn empty_until_written() {
        let (writer, mut reader) = bounded(1);
        assert_eq!(reader.try_next(), TryNext::Empty);
        writer.send(Record::value("a")).await.unwrap();
        assert_eq!(reader.try_next(), TryNext::Record(Record::value("a")));
        assert_eq!(reader.try_next(), TryNext::Empty);
    }

    #[tokio::test]
    async fn send_fails_once_reader_dropped() {
        let (writer, reader) = bounded(1);
        drop(reader);
        let ReaderGone(record) = writer.send(Record::value("lost")).await.unwrap_err();
        assert_eq!(record.value, b"lost");
    }
}
