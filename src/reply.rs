//! The value object hooks hand back to the server.
//!
//! A [`Descriptor`] carries everything the dispatcher needs to render an
//! HTTP response: status, body payload, MIME type, extra headers, entity
//! tag, cache lifetime, an optional delegation target, and a fatal-error
//! marker. The body is a tagged [`Payload`] instead of a loosely typed
//! blob; streaming sources are single-shot and therefore never cached.

use crate::prelude::*;
use std::sync::Mutex;

/// Reader type accepted for streaming payloads.
pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;

/// Default cache lifetime of a descriptor, in seconds.
pub const DEFAULT_MAX_AGE: u32 = 300;

/// A streaming body source.
///
/// The reader sits behind a take-once cell so a [`Descriptor`] can be shared
/// (`Arc`) between the executor, renderer, and cache while the body is still
/// consumable exactly once.
pub struct StreamSource {
    reader: Mutex<Option<StreamReader>>,
    length: Option<u64>,
}

impl StreamSource {
    #[must_use]
    pub fn new(reader: StreamReader, length: Option<u64>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            length,
        }
    }

    /// The advertised body length, if the hook knew it.
    #[inline]
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Takes the reader out. Subsequent calls return [`None`].
    pub fn take(&self) -> Option<StreamReader> {
        self.reader.lock().expect("stream source poisoned").take()
    }
}

impl Debug for StreamSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("length", &self.length)
            .finish()
    }
}

/// The body of a [`Descriptor`].
#[derive(Debug)]
pub enum Payload {
    /// Raw bytes, sent verbatim.
    Bytes(Bytes),
    /// Text, sent UTF-8 encoded.
    Text(String),
    /// A streaming source; never cached.
    Stream(StreamSource),
    /// No body. The renderer substitutes a plain status page.
    None,
}

impl Payload {
    /// Byte length of bodies the cache can hold.
    ///
    /// [`None`](Self::None) for streams and absent bodies.
    #[must_use]
    pub fn cacheable_len(&self) -> Option<usize> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len()),
            Self::Text(text) => Some(text.len()),
            Self::Stream(_) | Self::None => None,
        }
    }

    /// The body bytes, for payload kinds which are fully buffered.
    #[must_use]
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes.clone()),
            Self::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Self::Stream(_) | Self::None => None,
        }
    }
}

/// What a hook tells the server to send.
///
/// Constructed with [`Descriptor::new`] and refined through the builder
/// methods. `max_age` defaults to [`DEFAULT_MAX_AGE`]; clear it with
/// [`Descriptor::no_store`] to keep a response out of every cache.
#[derive(Debug)]
#[must_use]
pub struct Descriptor {
    /// HTTP status code. Values outside `100..600` are rejected at render
    /// time and reported as a server error.
    pub status: u16,
    /// The response body.
    pub payload: Payload,
    /// MIME type of the payload. Invalid values fall back to
    /// `application/octet-stream`.
    pub data_type: Option<String>,
    /// Extra headers, applied one at a time; invalid entries are skipped.
    pub headers: Vec<(String, String)>,
    /// Entity tag. Required for the response to enter the server cache.
    pub entity_tag: Option<String>,
    /// Cache lifetime in seconds. [`None`] marks the response non-cacheable.
    pub max_age: Option<u32>,
    /// Name of a hook to hand the raw connection to instead of rendering.
    pub manual: Option<String>,
    /// Fatal-error marker; rendering becomes a logged 500.
    pub error: bool,
}

impl Descriptor {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            payload: Payload::None,
            data_type: None,
            headers: Vec::new(),
            entity_tag: None,
            max_age: Some(DEFAULT_MAX_AGE),
            manual: None,
            error: false,
        }
    }

    /// A descriptor with the fatal-error marker set.
    pub fn internal_error() -> Self {
        let mut descriptor = Self::new(500);
        descriptor.error = true;
        descriptor
    }

    pub fn with_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.payload = Payload::Bytes(bytes.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload = Payload::Text(text.into());
        self
    }

    pub fn with_stream(mut self, reader: StreamReader, length: Option<u64>) -> Self {
        self.payload = Payload::Stream(StreamSource::new(reader, length));
        self
    }

    pub fn mime(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn entity_tag(mut self, tag: impl Into<String>) -> Self {
        self.entity_tag = Some(tag.into());
        self
    }

    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Marks the response non-cacheable.
    pub fn no_store(mut self) -> Self {
        self.max_age = None;
        self
    }

    /// Delegates response writing to the hook chain named `target`.
    pub fn manual(mut self, target: impl Into<String>) -> Self {
        self.manual = Some(target.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let descriptor = Descriptor::new(200);
        assert_eq!(descriptor.status, 200);
        assert_eq!(descriptor.max_age, Some(DEFAULT_MAX_AGE));
        assert!(matches!(descriptor.payload, Payload::None));
        assert!(!descriptor.error);
    }

    #[test]
    fn payload_lengths() {
        assert_eq!(Payload::Text("hèllo".into()).cacheable_len(), Some(6));
        assert_eq!(
            Payload::Bytes(Bytes::from_static(b"abc")).cacheable_len(),
            Some(3)
        );
        assert_eq!(Payload::None.cacheable_len(), None);
        let stream = Payload::Stream(StreamSource::new(Box::new(tokio::io::empty()), Some(9)));
        assert_eq!(stream.cacheable_len(), None);
    }

    #[test]
    fn stream_takes_once() {
        let source = StreamSource::new(Box::new(tokio::io::empty()), None);
        assert!(source.take().is_some());
        assert!(source.take().is_none());
    }
}
