// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming decoder for large JSON validator state snapshots.
//!
//! The snapshot is a single JSON object with the record array under one top-level field. An
//! async pump task owns the source reader and forwards its bytes in chunks to a blocking thread,
//! which tokenizes the document incrementally and hands elements over in fixed-size batches
//! through a bounded channel. No more than `buffered_batches + 2` batches and
//! `BUFFERED_CHUNKS + 1` chunks are alive at any time regardless of the array length.

use std::{
    fmt,
    future::Future,
    io::{self, BufReader, Read},
    marker::PhantomData,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::Stream;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer as _, IgnoredAny, MapAccess, SeqAccess,
    Visitor,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task::JoinHandle,
};

/// Number of records per batch
pub const STATE_BATCH_SIZE: usize = 1000;
/// Decoded batches queued ahead of the consumer
pub const DEFAULT_BUFFERED_BATCHES: usize = 2;
/// Top-level field of the beacon API response holding the validator array
pub const STATE_DATA_FIELD: &str = "data";

/// Bytes requested from the source per read
const READ_CHUNK_SIZE: usize = 64 * 1024;
/// Raw chunks queued between the pump and the parser
const BUFFERED_CHUNKS: usize = 4;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Stream read error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed state payload: {0}")]
    Malformed(serde_json::Error),

    #[error("State payload has no `{0}` field")]
    MissingField(String),

    #[error("Decoder task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        // A stream that ends mid-document is a transport failure, not a malformed payload.
        if err.is_io() || err.is_eof() {
            DecodeError::Io(err.into())
        } else {
            DecodeError::Malformed(err)
        }
    }
}

type BatchResult<T> = Result<Vec<T>, DecodeError>;

#[derive(Debug, Clone)]
pub struct StateDecoder {
    field: String,
    batch_size: usize,
    buffered_batches: usize,
}

impl Default for StateDecoder {
    fn default() -> Self {
        Self {
            field: STATE_DATA_FIELD.to_string(),
            batch_size: STATE_BATCH_SIZE,
            buffered_batches: DEFAULT_BUFFERED_BATCHES,
        }
    }
}

impl StateDecoder {
    pub fn new(field: impl Into<String>, batch_size: usize, buffered_batches: usize) -> Self {
        Self {
            field: field.into(),
            batch_size: batch_size.max(1),
            buffered_batches: buffered_batches.max(1),
        }
    }

    /// Start decoding `reader` and return the batch sequence.
    ///
    /// The reader is owned by an async pump task and dropped exactly once when that task ends:
    /// at end of input, on a read error, when the parser stops, or when the returned
    /// [StateBatches] is dropped. Dropping the batches aborts the pump even while a read is
    /// pending, so a stalled source is released on cancellation. Must be called from within a
    /// tokio runtime.
    pub fn decode<T, R>(&self, reader: R) -> StateBatches<T>
    where
        T: DeserializeOwned + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, chunk_rx) = mpsc::channel(BUFFERED_CHUNKS);
        let (tx, rx) = mpsc::channel(self.buffered_batches);
        let field = self.field.clone();
        let batch_size = self.batch_size;

        let pump = tokio::spawn(pump_chunks(reader, chunk_tx));
        let task = tokio::task::spawn_blocking(move || {
            let mut sink = BatchSink { tx, batch: Vec::with_capacity(batch_size), batch_size };
            let reader = ChunkReader { rx: chunk_rx, chunk: Vec::new(), pos: 0 };
            let result = decode_document(BufReader::new(reader), &field, &mut sink);
            match result {
                Ok(()) => {}
                // Consumer went away; nothing left to report to.
                Err(_) if sink.tx.is_closed() => {}
                Err(err) => {
                    tracing::debug!("State decoding failed: {err}");
                    let _ = sink.tx.blocking_send(Err(err));
                }
            }
        });

        StateBatches { rx, task: Some(task), pump }
    }
}

/// Forward `reader` to the parser until end of input, a read error, or the parser hanging up.
async fn pump_chunks<R>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = tx.closed() => return,
        };
        match read {
            Ok(0) => return,
            Ok(n) => {
                chunk.truncate(n);
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Blocking view of the chunks sent by [pump_chunks]. A closed channel reads as end of input.
struct ChunkReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.chunk.len() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn decode_document<T, R>(reader: R, field: &str, sink: &mut BatchSink<T>) -> Result<(), DecodeError>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut de = serde_json::Deserializer::from_reader(reader);
    let found = (&mut de).deserialize_map(DocumentVisitor { field, sink })?;
    de.end()?;
    if !found {
        return Err(DecodeError::MissingField(field.to_string()));
    }
    sink.finish()
}

struct BatchSink<T> {
    tx: mpsc::Sender<BatchResult<T>>,
    batch: Vec<T>,
    batch_size: usize,
}

impl<T> BatchSink<T> {
    fn push(&mut self, item: T) -> Result<(), ConsumerGone> {
        self.batch.push(item);
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ConsumerGone> {
        let batch = mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.tx.blocking_send(Ok(batch)).map_err(|_| ConsumerGone)
    }

    fn finish(&mut self) -> Result<(), DecodeError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.flush().map_err(|e| DecodeError::Task(e.to_string()))
    }
}

#[derive(Debug)]
struct ConsumerGone;

impl fmt::Display for ConsumerGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("batch consumer dropped")
    }
}

/// Visits the top-level object; returns whether the target field was present.
struct DocumentVisitor<'a, T> {
    field: &'a str,
    sink: &'a mut BatchSink<T>,
}

impl<'de, T: DeserializeOwned> Visitor<'de> for DocumentVisitor<'_, T> {
    type Value = bool;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an object with a `{}` array", self.field)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<bool, A::Error> {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if !found && key == self.field {
                map.next_value_seed(ArraySeed { sink: &mut *self.sink, _marker: PhantomData })?;
                found = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

struct ArraySeed<'a, T> {
    sink: &'a mut BatchSink<T>,
    _marker: PhantomData<T>,
}

impl<'de, T: DeserializeOwned> DeserializeSeed<'de> for ArraySeed<'_, T> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, T: DeserializeOwned> Visitor<'de> for ArraySeed<'_, T> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an array of records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(item) = seq.next_element::<T>()? {
            self.sink.push(item).map_err(de::Error::custom)?;
        }
        Ok(())
    }
}

/// Lazy, finite, non-restartable sequence of decoded batches in source order.
///
/// Yields `Ok(batch)` items until the array is exhausted; a failure is yielded once as `Err` and
/// is always the last item.
pub struct StateBatches<T> {
    rx: mpsc::Receiver<BatchResult<T>>,
    task: Option<JoinHandle<()>>,
    pump: JoinHandle<()>,
}

impl<T> Drop for StateBatches<T> {
    fn drop(&mut self) {
        // Releases the source reader even if the pump is parked on a read.
        self.pump.abort();
    }
}

impl<T> StateBatches<T> {
    pub async fn next_batch(&mut self) -> Option<BatchResult<T>> {
        if let Some(item) = self.rx.recv().await {
            return Some(item);
        }
        let task = self.task.take()?;
        match task.await {
            Ok(()) => None,
            Err(err) => Some(Err(DecodeError::Task(err.to_string()))),
        }
    }
}

impl<T> Stream for StateBatches<T> {
    type Item = BatchResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => {}
        }
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(None);
        };
        let joined = match Pin::new(task).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        self.task = None;
        Poll::Ready(joined.err().map(|err| Err(DecodeError::Task(err.to_string()))))
    }
}
