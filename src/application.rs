//! The HTTP/1.1 application layer.
//!
//! [`HttpConnection`] wraps an [`Encryption`] stream and yields one
//! request at a time: a [`http::Request`] carrying a streaming [`Body`],
//! paired with the [`ResponsePipe`] used to answer it. The head parser
//! reads until the blank line, bounded by [`HEAD_SIZE_LIMIT`]; the body is
//! delivered chunk-wise and never reads past its `Content-Length`, keeping
//! pipelined bytes in the connection buffer.

use crate::encryption::Encryption;
use crate::prelude::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Longest accepted request head, in bytes.
pub const HEAD_SIZE_LIMIT: usize = 16 * 1024;
/// How long an idle keep-alive connection may sit between requests.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// General error for application-level logic.
#[derive(Debug)]
pub enum Error {
    /// Failed to create a [`http`] type.
    Http(http::Error),
    /// An input-output error was encountered while reading or writing.
    Io(io::Error),
    /// Done reading; the peer closed an idle connection.
    Done,
    /// The data before the blank line exceeds [`HEAD_SIZE_LIMIT`].
    HeaderTooLong,
    /// No request-target was supplied, or it is not origin-form.
    NoPath,
    /// The method contains illegal bytes.
    InvalidMethod,
    /// The HTTP version is unknown.
    InvalidVersion,
    /// A header name contains illegal bytes.
    IllegalName,
    /// A header value contains illegal bytes.
    IllegalValue,
    /// The data is not an HTTP/1 request; possibly TLS sent to a plaintext
    /// port.
    Syntax,
}

impl Error {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http(_) => "http library error",
            Self::Io(_) => "io error",
            Self::Done => "stream is exhausted",
            Self::HeaderTooLong => "header is too long",
            Self::NoPath => "no path was supplied in the request",
            Self::InvalidMethod => "method is invalid",
            Self::InvalidVersion => "version is invalid",
            Self::IllegalName => "header name invalid",
            Self::IllegalValue => "header value invalid",
            Self::Syntax => "invalid request syntax",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "{}: {err}", self.as_str()),
            Self::Io(err) => write!(f, "{}: {err}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<http::Error> for Error {
    #[inline]
    fn from(err: http::Error) -> Self {
        Self::Http(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(io) => io,
            Error::Done => io::Error::new(io::ErrorKind::BrokenPipe, err.as_str()),
            _ => io::Error::new(io::ErrorKind::InvalidData, err.as_str()),
        }
    }
}

/// Index one past the head-terminating blank line, if present.
fn head_end(bytes: &[u8]) -> Option<usize> {
    let mut newlines = 0_u8;
    for (pos, byte) in bytes.iter().enumerate() {
        match byte {
            b'\n' => {
                newlines += 1;
                if newlines == 2 {
                    return Some(pos + 1);
                }
            }
            b'\r' => {}
            _ => newlines = 0,
        }
    }
    None
}

fn parse_version(bytes: &[u8]) -> Option<Version> {
    Some(match bytes {
        b"HTTP/0.9" => Version::HTTP_09,
        b"HTTP/1.0" => Version::HTTP_10,
        b"HTTP/1.1" => Version::HTTP_11,
        _ => return None,
    })
}

/// Parses a complete request head, excluding any body bytes.
pub(crate) fn parse_head(head: &Bytes) -> Result<Request<()>, Error> {
    let mut lines = head.split(|byte| *byte == b'\n').map(|line| {
        line.strip_suffix(b"\r").unwrap_or(line)
    });

    let request_line = lines.next().ok_or(Error::Syntax)?;
    let mut parts = request_line
        .split(|byte| *byte == b' ')
        .filter(|part| !part.is_empty());
    let method =
        Method::from_bytes(parts.next().ok_or(Error::Syntax)?).map_err(|_| Error::InvalidMethod)?;
    let target = parts.next().ok_or(Error::NoPath)?;
    if target.first() != Some(&b'/') && target != &b"*"[..] {
        return Err(Error::NoPath);
    }
    let target = str::from_utf8(target).map_err(|_| Error::NoPath)?;
    let uri = Uri::try_from(target).map_err(|_| Error::NoPath)?;
    let version = parse_version(parts.next().ok_or(Error::Syntax)?).ok_or(Error::InvalidVersion)?;

    let mut builder = Request::builder().method(method).uri(uri).version(version);
    let headers = builder.headers_mut().ok_or(Error::Syntax)?;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line
            .iter()
            .position(|byte| *byte == b':')
            .ok_or(Error::Syntax)?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| Error::IllegalName)?;
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| Error::IllegalValue)?;
        headers.append(name, value);
    }
    builder.body(()).map_err(Error::Http)
}

/// A streaming request body.
///
/// Yields at most `Content-Length` bytes; everything beyond stays in the
/// connection for the next request head.
#[derive(Debug)]
pub struct Body {
    stream: Arc<Mutex<Encryption>>,
    // Body bytes that arrived buffered together with the head.
    pending: Bytes,
    remaining: u64,
}

impl Body {
    /// Bytes this body has yet to yield.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether every declared byte was yielded.
    #[inline]
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.remaining == 0
    }

    /// The next chunk, or [`None`] once the body is consumed.
    ///
    /// An unexpected end of stream surfaces as
    /// [`io::ErrorKind::UnexpectedEof`]: the client aborted mid-body.
    pub async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.remaining == 0 {
            return None;
        }
        if !self.pending.is_empty() {
            let take = self.pending.len().min(self.remaining as usize);
            let bytes = self.pending.split_to(take);
            self.remaining -= take as u64;
            return Some(Ok(bytes));
        }
        let want = self.remaining.min(8 * 1024) as usize;
        let mut buffer = BytesMut::zeroed(want);
        let mut stream = self.stream.lock().await;
        match stream.read(&mut buffer).await {
            Ok(0) => Some(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client aborted mid-body",
            ))),
            Ok(read) => {
                drop(stream);
                buffer.truncate(read);
                self.remaining -= read as u64;
                Some(Ok(buffer.freeze()))
            }
            Err(err) => Some(Err(err)),
        }
    }

    /// Reads and discards the rest of the body.
    pub async fn drain(&mut self) -> io::Result<()> {
        while let Some(chunk) = self.chunk().await {
            chunk?;
        }
        Ok(())
    }
}

/// A pipe to send one response through.
#[derive(Debug)]
#[must_use]
pub struct ResponsePipe {
    stream: Arc<Mutex<Encryption>>,
    head_only: bool,
}

impl ResponsePipe {
    /// Whether this answers a `HEAD` request; bodies are then suppressed
    /// while headers, including `Content-Length`, stay.
    #[inline]
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.head_only
    }

    fn format_head(response: &Response<()>, buffer: &mut BytesMut) {
        buffer.extend_from_slice(b"HTTP/1.1 ");
        buffer.extend_from_slice(response.status().as_str().as_bytes());
        buffer.extend_from_slice(b" ");
        buffer.extend_from_slice(
            response
                .status()
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(crate::SERVER_HEADER);
        for (name, value) in response.headers() {
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
    }

    /// Writes the head and the complete `body`.
    ///
    /// # Errors
    ///
    /// Any error writing to the peer.
    pub async fn send(&self, head: &Response<()>, body: &[u8]) -> io::Result<()> {
        let mut buffer = BytesMut::with_capacity(
            512 + if self.head_only { 0 } else { body.len() },
        );
        Self::format_head(head, &mut buffer);
        if !self.head_only {
            buffer.extend_from_slice(body);
        }
        let mut stream = self.stream.lock().await;
        stream.write_all(&buffer).await?;
        stream.flush().await
    }

    /// Writes the head and pipes `reader` as the body.
    ///
    /// Returns the number of body bytes written.
    ///
    /// # Errors
    ///
    /// Any error reading the source or writing to the peer.
    pub async fn send_streamed(
        &self,
        head: &Response<()>,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let mut buffer = BytesMut::with_capacity(512);
        Self::format_head(head, &mut buffer);
        let mut stream = self.stream.lock().await;
        stream.write_all(&buffer).await?;
        let written = if self.head_only {
            0
        } else {
            tokio::io::copy(reader, &mut *stream).await?
        };
        stream.flush().await?;
        Ok(written)
    }
}

/// A single HTTP/1.1 connection, yielding requests until the peer leaves.
#[derive(Debug)]
pub struct HttpConnection {
    stream: Arc<Mutex<Encryption>>,
    buffer: BytesMut,
    peer: SocketAddr,
}

impl HttpConnection {
    #[must_use]
    pub fn new(encryption: Encryption, peer: SocketAddr) -> Self {
        Self {
            stream: Arc::new(Mutex::new(encryption)),
            buffer: BytesMut::with_capacity(1024),
            peer,
        }
    }

    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn read_head(&mut self) -> Result<usize, Error> {
        loop {
            if let Some(end) = head_end(&self.buffer) {
                return Ok(end);
            }
            if self.buffer.len() >= HEAD_SIZE_LIMIT {
                return Err(Error::HeaderTooLong);
            }
            let mut chunk = [0_u8; 2048];
            let idle = self.buffer.is_empty();
            let read = {
                let mut stream = self.stream.lock().await;
                if idle {
                    tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.read(&mut chunk))
                        .await
                        .map_err(|_| Error::Done)??
                } else {
                    stream.read(&mut chunk).await?
                }
            };
            if read == 0 {
                return Err(if self.buffer.is_empty() {
                    Error::Done
                } else {
                    Error::Syntax
                });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Accepts the next request.
    ///
    /// # Errors
    ///
    /// [`Error::Done`] when the peer has hung up between requests; any
    /// parse error otherwise.
    pub async fn accept(&mut self) -> Result<(Request<Body>, ResponsePipe), Error> {
        let end = self.read_head().await?;
        let head = self.buffer.split_to(end).freeze();
        let request = parse_head(&head)?;

        let content_length = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let buffered = (content_length as usize).min(self.buffer.len());
        let pending = self.buffer.split_to(buffered).freeze();

        let body = Body {
            stream: Arc::clone(&self.stream),
            pending,
            remaining: content_length,
        };
        let pipe = ResponsePipe {
            stream: Arc::clone(&self.stream),
            head_only: request.method() == Method::HEAD,
        };
        Ok((request.map(move |()| body), pipe))
    }
}
