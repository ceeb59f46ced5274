use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use schema::Record;
use store::{Cursor, Projection, StoreError};

use crate::error::{DetailedError, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response sink closed")]
pub struct SinkClosed;

/// Transport side of a response. `reject` and `commit` are mutually
/// exclusive and happen at most once; `send` is only valid after `commit`.
#[async_trait]
pub trait ResponseSink: Send {
    async fn reject(&mut self, error: &DetailedError) -> Result<(), SinkClosed>;

    /// Fixes status 200 with a JSON content type.
    async fn commit(&mut self) -> Result<(), SinkClosed>;

    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;
}

#[async_trait]
impl<'a, S: ResponseSink + ?Sized> ResponseSink for &'a mut S {
    async fn reject(&mut self, error: &DetailedError) -> Result<(), SinkClosed> {
        (**self).reject(error).await
    }

    async fn commit(&mut self) -> Result<(), SinkClosed> {
        (**self).commit().await
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        (**self).send(chunk).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("client disconnected")]
    Disconnected,
}

impl From<SinkClosed> for WriteError {
    fn from(_: SinkClosed) -> Self {
        WriteError::Disconnected
    }
}

/// Writes records as one JSON array. The opening bracket is deferred until
/// the first record has been encoded, so whatever stops the stream, `finish`
/// still produces a well-formed array.
pub struct ArrayWriter<S> {
    sink: S,
    committed: bool,
    array_opened: bool,
    finished: bool,
    emitted: usize,
}

impl<S: ResponseSink> ArrayWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            committed: false,
            array_opened: false,
            finished: false,
            emitted: 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub async fn commit(&mut self) -> Result<(), SinkClosed> {
        if !self.committed {
            self.sink.commit().await?;
            self.committed = true;
        }
        Ok(())
    }

    /// Sends an error envelope. Once committed the status is fixed, so the
    /// array is closed instead and the error stays out of band.
    pub async fn reject(&mut self, error: &DetailedError) -> Result<(), SinkClosed> {
        if self.committed {
            return self.finish().await;
        }
        self.sink.reject(error).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
        let encoded = serde_json::to_vec(record)?;
        self.commit().await?;

        let prefix: &[u8] = if self.array_opened { b",\n" } else { b"[" };
        let mut chunk = Vec::with_capacity(prefix.len() + encoded.len());
        chunk.extend_from_slice(prefix);
        chunk.extend_from_slice(&encoded);
        self.sink.send(Bytes::from(chunk)).await?;

        self.array_opened = true;
        self.emitted += 1;
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<(), SinkClosed> {
        if self.finished {
            return Ok(());
        }
        self.commit().await?;
        let tail: &'static [u8] = if self.array_opened { b"]" } else { b"[]" };
        self.sink.send(Bytes::from_static(tail)).await?;
        self.finished = true;
        Ok(())
    }
}

#[derive(Debug)]
pub enum StreamFailure {
    Cursor(StoreError),
    CursorTimeout,
    Serialization(String),
    Disconnected,
}

impl StreamFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFailure::Cursor(_) => "cursor",
            StreamFailure::CursorTimeout => "cursor_timeout",
            StreamFailure::Serialization(_) => "serialization",
            StreamFailure::Disconnected => "disconnected",
        }
    }

    /// Error record for the log. A disconnect is not a server failure.
    pub fn to_detailed(&self) -> Option<DetailedError> {
        match self {
            StreamFailure::Cursor(err) => {
                Some(DetailedError::new(FailureKind::QueryExecution).with_internal(err))
            }
            StreamFailure::CursorTimeout => Some(
                DetailedError::new(FailureKind::QueryExecution)
                    .with_internal("cursor read timed out"),
            ),
            StreamFailure::Serialization(detail) => {
                Some(DetailedError::new(FailureKind::Serialization).with_internal(detail))
            }
            StreamFailure::Disconnected => None,
        }
    }
}

#[derive(Debug)]
pub struct StreamReport {
    pub emitted: usize,
    pub failure: Option<StreamFailure>,
    pub close_error: Option<StoreError>,
}

/// Drains `cursor` into `writer`, stripping `projection` fields from each
/// record. The response is committed by the first record written or, for an
/// empty result, by closing the array. A failure before that leaves the
/// writer uncommitted so the caller can still send an error envelope. Once
/// committed, the array is always closed while the client is still there.
/// The cursor is always released.
pub async fn stream_records<S: ResponseSink>(
    mut cursor: Box<dyn Cursor>,
    writer: &mut ArrayWriter<S>,
    projection: &Projection,
    op_timeout: Duration,
) -> StreamReport {
    let mut failure = None;

    while failure.is_none() {
        match tokio::time::timeout(op_timeout, cursor.next()).await {
            Err(_) => failure = Some(StreamFailure::CursorTimeout),
            Ok(Err(err)) => failure = Some(StreamFailure::Cursor(err)),
            Ok(Ok(None)) => break,
            Ok(Ok(Some(mut record))) => {
                projection.apply(&mut record);
                match writer.write_record(&record).await {
                    Ok(()) => {}
                    Err(WriteError::Serialize(err)) => {
                        failure = Some(StreamFailure::Serialization(err.to_string()));
                    }
                    Err(WriteError::Disconnected) => failure = Some(StreamFailure::Disconnected),
                }
            }
        }
    }

    let close_array = match failure {
        None => true,
        Some(StreamFailure::Disconnected) => false,
        Some(_) => writer.is_committed(),
    };
    if close_array && writer.finish().await.is_err() && failure.is_none() {
        failure = Some(StreamFailure::Disconnected);
    }

    let close_error = match tokio::time::timeout(op_timeout, cursor.close()).await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(_) => Some(StoreError::Cursor("cursor close timed out".to_string())),
    };

    StreamReport {
        emitted: writer.emitted(),
        failure,
        close_error,
    }
}
