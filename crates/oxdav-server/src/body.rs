//! Body bridging between hyper's async bodies and the core's blocking I/O.

use bytes::{Buf, Bytes};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use oxdav_core::{RequestBody, ResponseBody};
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Chunk size used when streaming content out of the store (64 KiB).
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the connection and the blocking side.
const CHANNEL_DEPTH: usize = 4;

type Chunk = io::Result<Bytes>;

/// Blocking reader fed by the task that polls the request body.
///
/// Must only be read from a blocking-pool thread.
struct ChannelReader {
    rx: mpsc::Receiver<Chunk>,
    chunk: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk.is_empty() {
            match self.rx.blocking_recv() {
                None => return Ok(0),
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => return Err(e),
            }
        }
        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk[..n]);
        self.chunk.advance(n);
        Ok(n)
    }
}

/// Hand the request body to the core as a blocking reader.
///
/// A pump task forwards data frames until the body ends, the connection
/// fails, or the reader is dropped.
pub(crate) fn request_body(body: Incoming) -> RequestBody {
    if body.is_end_stream() {
        return RequestBody::Empty;
    }

    let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
    tokio::spawn(async move {
        let mut body = body;
        while let Some(frame) = body.frame().await {
            let item = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => Ok(data),
                    // Trailers
                    Err(_) => continue,
                },
                Err(e) => {
                    debug!(error = %e, "request body aborted");
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, e))
                }
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    RequestBody::Reader(Box::new(ChannelReader {
        rx,
        chunk: Bytes::new(),
    }))
}

/// Response body handed to hyper.
#[derive(Debug)]
pub struct DavBody {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Full(Option<Bytes>),
    Channel {
        rx: mpsc::Receiver<Chunk>,
        remaining: u64,
    },
}

impl DavBody {
    pub fn empty() -> Self {
        Self {
            kind: Kind::Full(None),
        }
    }

    pub fn full(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            kind: Kind::Full(Some(bytes)),
        }
    }

    /// Stream a blocking reader of known length.
    ///
    /// The reader is drained on the blocking pool; dropping the body stops it.
    pub fn stream(mut reader: Box<dyn Read + Send>, len: u64) -> Self {
        if len == 0 {
            return Self::empty();
        }

        let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            debug!("response body dropped by client");
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Self {
            kind: Kind::Channel { rx, remaining: len },
        }
    }
}

impl From<ResponseBody> for DavBody {
    fn from(body: ResponseBody) -> Self {
        match body {
            ResponseBody::Empty => Self::empty(),
            ResponseBody::Bytes(bytes) => Self::full(bytes),
            ResponseBody::Reader { reader, len } => Self::stream(reader, len),
        }
    }
}

impl Body for DavBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Full(bytes) => Poll::Ready(bytes.take().map(|b| Ok(Frame::data(b)))),
            Kind::Channel { rx, remaining } => match ready!(rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    *remaining = remaining.saturating_sub(chunk.len() as u64);
                    Poll::Ready(Some(Ok(Frame::data(chunk))))
                }
                Some(Err(e)) => Poll::Ready(Some(Err(e))),
                None => Poll::Ready(None),
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Full(bytes) => bytes.is_none(),
            Kind::Channel { remaining, .. } => *remaining == 0,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Full(bytes) => SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64)),
            Kind::Channel { remaining, .. } => SizeHint::with_exact(*remaining),
        }
    }
}
