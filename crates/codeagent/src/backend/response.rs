//! Streaming reply to one prompt.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::error::{SessionError, SessionResult};

/// Sending half used by backends to feed a [`Response`].
pub type ResponseSender = mpsc::Sender<io::Result<Bytes>>;

/// Chunk buffer between a backend's pump task and the caller.
pub const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// A single-use, forward-only byte stream holding one reply.
///
/// While alive, the response holds the backend's prompt permit: the next
/// `prompt` on the same backend waits until this stream reaches EOF, fails
/// or is dropped. Failures after the stream was handed out are delivered
/// as `io::Error`s wrapping a [`SessionError`].
pub struct Response {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Response {
    /// A complete reply that is already in memory.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        Self::from_stream(stream::iter([Ok(bytes)]).boxed())
    }

    /// A reply fed chunk by chunk through a channel. The stream ends when
    /// every sender is dropped.
    pub fn from_receiver(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self::from_stream(ReceiverStream::new(rx).boxed())
    }

    /// Create a channel-backed response.
    pub fn channel() -> (ResponseSender, Self) {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        (tx, Self::from_receiver(rx))
    }

    fn from_stream(stream: BoxStream<'static, io::Result<Bytes>>) -> Self {
        Self {
            reader: StreamReader::new(stream),
            permit: None,
        }
    }

    /// Attach the prompt permit the stream releases when finished.
    pub fn with_permit(mut self, permit: OwnedMutexGuard<()>) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Whether the prompt permit is still held.
    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    /// Drain the stream into memory.
    pub async fn bytes(mut self) -> SessionResult<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)
            .await
            .map_err(SessionError::from_io)?;
        Ok(out)
    }

    /// Drain the stream and decode it lossily as UTF-8.
    pub async fn text(self) -> SessionResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("holds_permit", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Response {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.reader).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                this.permit.take();
            }
            Poll::Ready(Err(_)) => {
                this.permit.take();
            }
            _ => {}
        }
        poll
    }
}
