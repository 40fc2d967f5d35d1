//! Single-owner byte sources for request and response bodies.
//!
//! A [`Payload`] wraps one byte-producing source (in-memory bytes, a file, a
//! caller-supplied stream, or a native reqwest response body) together with its
//! [`PayloadMetadata`]. Whoever holds the payload owns the underlying source:
//! it can be read at most once, and it is released exactly once, either when
//! it is fully consumed, explicitly released, or dropped.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::trace;

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Errors raised while producing or reading a payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload was already read, written, or released.
    #[error("payload already consumed or released")]
    Consumed,

    /// A file-backed payload could not be opened or read.
    #[error("failed to read payload file {path}: {source}")]
    File {
        /// The backing file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A caller-supplied stream yielded an error.
    #[error("failed to read payload stream: {source}")]
    Read {
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The native response body could not be read.
    #[error("failed to read response body: {source}")]
    Native {
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },
}

/// Metadata describing a payload's bytes.
///
/// Mapped to and from the standard content headers by [`super::metadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadMetadata {
    /// Number of bytes, when known up front.
    pub content_length: Option<u64>,
    /// MIME type of the bytes.
    pub content_type: Option<String>,
    /// Content coding applied to the bytes (e.g. `gzip`).
    pub content_encoding: Option<String>,
    /// Raw MD5 digest of the bytes.
    pub content_md5: Option<Vec<u8>>,
}

enum Source {
    Bytes(Bytes),
    File(PathBuf),
    Stream(Mutex<Option<ByteStream>>),
    Native(reqwest::Response),
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::File(_) => "file",
            Self::Stream(_) => "stream",
            Self::Native(_) => "native",
        }
    }
}

/// A single-owner, single-read body source plus its metadata.
pub struct Payload {
    source: Option<Source>,
    metadata: PayloadMetadata,
    on_release: Option<ReleaseHook>,
}

impl Payload {
    /// Creates a repeatable payload from in-memory bytes.
    ///
    /// The content length is set from the buffer size.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let metadata = PayloadMetadata {
            content_length: Some(bytes.len() as u64),
            ..PayloadMetadata::default()
        };
        Self::with_source(Source::Bytes(bytes), metadata)
    }

    /// Creates a repeatable payload from a string.
    #[must_use]
    pub fn from_string(text: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(text.into()))
    }

    /// Creates a repeatable payload backed by a file.
    ///
    /// The file is opened lazily each time the payload is written, so the
    /// same request can be sent again on retry. The content length is taken
    /// from the file's current size.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::File`] if the file metadata cannot be read.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PayloadError> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path)
            .await
            .map_err(|source| PayloadError::File {
                path: path.clone(),
                source,
            })?
            .len();
        let metadata = PayloadMetadata {
            content_length: Some(len),
            ..PayloadMetadata::default()
        };
        Ok(Self::with_source(Source::File(path), metadata))
    }

    /// Creates a single-use payload from a byte stream.
    ///
    /// Pass `None` for `content_length` when the size is unknown; such a
    /// payload can only be sent with chunked transfer encoding.
    #[must_use]
    pub fn from_stream(stream: ByteStream, content_length: Option<u64>) -> Self {
        let metadata = PayloadMetadata {
            content_length,
            ..PayloadMetadata::default()
        };
        Self::with_source(Source::Stream(Mutex::new(Some(stream))), metadata)
    }

    /// Wraps a native response body. Dropping the payload closes the response.
    pub(crate) fn from_native(response: reqwest::Response, metadata: PayloadMetadata) -> Self {
        Self::with_source(Source::Native(response), metadata)
    }

    fn with_source(source: Source, metadata: PayloadMetadata) -> Self {
        Self {
            source: Some(source),
            metadata,
            on_release: None,
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata.content_type = Some(content_type.into());
        self
    }

    /// Sets the raw MD5 digest of the content.
    #[must_use]
    pub fn with_content_md5(mut self, digest: impl Into<Vec<u8>>) -> Self {
        self.metadata.content_md5 = Some(digest.into());
        self
    }

    /// Overrides the content length.
    #[must_use]
    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.metadata.content_length = content_length;
        self
    }

    /// Returns the payload metadata.
    #[must_use]
    pub fn metadata(&self) -> &PayloadMetadata {
        &self.metadata
    }

    /// Returns the payload metadata for in-place edits.
    pub fn metadata_mut(&mut self) -> &mut PayloadMetadata {
        &mut self.metadata
    }

    /// Returns `true` if the bytes can be produced again for another attempt.
    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        matches!(self.source, Some(Source::Bytes(_) | Source::File(_)))
    }

    /// Returns `true` once the underlying source has been consumed or released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }

    /// Registers a hook that runs exactly once when the payload is released.
    ///
    /// Replaces any previously registered hook.
    pub(crate) fn on_release(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_release = Some(Box::new(hook));
    }

    /// Releases the underlying source.
    ///
    /// Returns `true` if this call performed the release, `false` if the
    /// payload had already been released.
    ///
    /// The release hook also runs when a read was abandoned midway and left
    /// the source already gone.
    pub fn release(&mut self) -> bool {
        let released = match self.source.take() {
            Some(source) => {
                trace!(kind = source.kind(), "releasing payload");
                drop(source);
                true
            }
            None => false,
        };
        self.run_release_hook();
        released
    }

    fn run_release_hook(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }

    /// Reads the whole payload into memory and releases it.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Consumed`] on a second read, or the read error
    /// from the underlying source. The payload is released either way.
    pub async fn bytes(&mut self) -> Result<Bytes, PayloadError> {
        let source = self.source.take().ok_or(PayloadError::Consumed)?;
        let result = read_source(source).await;
        self.run_release_hook();
        result
    }

    /// Reads the whole payload as UTF-8 text (lossy) and releases it.
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(&mut self) -> Result<String, PayloadError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Hands the payload over as a chunk stream.
    ///
    /// The release hook moves into the stream and runs when the stream is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Consumed`] if the payload was already read.
    pub fn into_stream(mut self) -> Result<ByteStream, PayloadError> {
        let source = self.source.take().ok_or(PayloadError::Consumed)?;
        let inner = source_stream(source)?;
        Ok(Box::pin(ReleasingStream {
            inner,
            hook: self.on_release.take(),
        }))
    }

    /// Reads at most `limit` bytes and releases the payload.
    ///
    /// Anything past `limit` is left unread and dropped with the source.
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub async fn bytes_limited(&mut self, limit: usize) -> Result<Bytes, PayloadError> {
        let source = self.source.take().ok_or(PayloadError::Consumed)?;
        let result = read_prefix(source, limit).await;
        self.run_release_hook();
        result
    }

    /// Produces a native request body for one attempt.
    ///
    /// Repeatable sources produce a fresh body on every call; a stream source
    /// can be written once.
    pub(crate) fn body(&self) -> Result<reqwest::Body, PayloadError> {
        match &self.source {
            Some(Source::Bytes(bytes)) => Ok(reqwest::Body::from(bytes.clone())),
            Some(Source::File(path)) => Ok(reqwest::Body::wrap_stream(file_stream(path.clone()))),
            Some(Source::Stream(slot)) => {
                let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                let stream = guard.take().ok_or(PayloadError::Consumed)?;
                Ok(reqwest::Body::wrap_stream(stream))
            }
            Some(Source::Native(_)) | None => Err(PayloadError::Consumed),
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("source", &self.source.as_ref().map_or("released", Source::kind))
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn take_stream(slot: Mutex<Option<ByteStream>>) -> Option<ByteStream> {
    slot.into_inner().unwrap_or_else(PoisonError::into_inner)
}

fn file_stream(path: PathBuf) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    futures_util::stream::once(async move { tokio::fs::File::open(path).await })
        .map_ok(ReaderStream::new)
        .try_flatten()
}

fn source_stream(source: Source) -> Result<ByteStream, PayloadError> {
    Ok(match source {
        Source::Bytes(bytes) => Box::pin(futures_util::stream::once(async move {
            Ok::<_, io::Error>(bytes)
        })),
        Source::File(path) => Box::pin(file_stream(path)),
        Source::Stream(slot) => take_stream(slot).ok_or(PayloadError::Consumed)?,
        Source::Native(response) => Box::pin(response.bytes_stream().map_err(io::Error::other)),
    })
}

async fn read_prefix(source: Source, limit: usize) -> Result<Bytes, PayloadError> {
    let mut stream = source_stream(source)?;
    let mut buffer = BytesMut::new();
    while buffer.len() < limit {
        let Some(chunk) = stream.next().await else {
            break;
        };
        buffer.extend_from_slice(&chunk.map_err(|source| PayloadError::Read { source })?);
    }
    buffer.truncate(limit);
    Ok(buffer.freeze())
}

async fn read_source(source: Source) -> Result<Bytes, PayloadError> {
    match source {
        Source::Bytes(bytes) => Ok(bytes),
        Source::File(path) => tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|source| PayloadError::File { path, source }),
        Source::Stream(slot) => {
            let mut stream = take_stream(slot).ok_or(PayloadError::Consumed)?;
            let mut buffer = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buffer.extend_from_slice(&chunk.map_err(|source| PayloadError::Read { source })?);
            }
            Ok(buffer.freeze())
        }
        Source::Native(response) => response
            .bytes()
            .await
            .map_err(|source| PayloadError::Native { source }),
    }
}

/// Stream decorator that runs the payload's release hook when dropped.
struct ReleasingStream {
    inner: ByteStream,
    hook: Option<ReleaseHook>,
}

impl Stream for ReleasingStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Drop for ReleasingStream {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}
