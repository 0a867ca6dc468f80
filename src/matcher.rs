//! Protocol signatures, and the ordered registry used to classify connections.
//!
//! A [`Detect`] implementation looks at the first bytes read from a connection and
//! answers with a [`Verdict`]. Detectors never consume anything: they see a borrowed
//! prefix, and may answer [`Verdict::Incomplete`] when the prefix is too short to decide.
//!
//! [`Protocols`] holds detectors in registration order. The first detector to match wins,
//! but only once every detector registered before it has rejected the prefix, so an
//! earlier registration always takes precedence over a later one.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// The HTTP/2 client connection preface, which also opens every gRPC connection.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// The answer a detector gives for a connection prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The prefix belongs to this protocol.
    Match,

    /// The prefix can never belong to this protocol.
    Reject,

    /// The prefix is consistent with this protocol, but too short to be sure.
    Incomplete,
}

/// A protocol signature detector.
pub trait Detect: Send + Sync + 'static {
    /// Inspect the bytes read so far from a connection.
    fn detect(&self, prefix: &[u8]) -> Verdict;

    /// The number of bytes this detector needs to reach a final verdict.
    fn max_prefix_len(&self) -> usize;
}

impl<D> Detect for Box<D>
where
    D: Detect + ?Sized,
{
    fn detect(&self, prefix: &[u8]) -> Verdict {
        (**self).detect(prefix)
    }

    fn max_prefix_len(&self) -> usize {
        (**self).max_prefix_len()
    }
}

/// Matches connections which start with a fixed byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    bytes: Bytes,
}

impl Prefix {
    /// Create a detector for connections starting with `bytes`.
    pub fn new<B: Into<Bytes>>(bytes: B) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl Detect for Prefix {
    fn detect(&self, prefix: &[u8]) -> Verdict {
        compare(&self.bytes, prefix)
    }

    fn max_prefix_len(&self) -> usize {
        self.bytes.len()
    }
}

fn compare(expected: &[u8], prefix: &[u8]) -> Verdict {
    let n = expected.len().min(prefix.len());
    if expected[..n] != prefix[..n] {
        Verdict::Reject
    } else if n < expected.len() {
        Verdict::Incomplete
    } else {
        Verdict::Match
    }
}

/// Matches connections which start with a fixed byte sequence.
pub fn prefix<B: Into<Bytes>>(bytes: B) -> Prefix {
    Prefix::new(bytes)
}

/// Matches HTTP/2 connections with prior knowledge, which includes gRPC.
pub fn http2() -> Prefix {
    Prefix::new(HTTP2_PREFACE)
}

/// Matches HTTP/1.x request lines by their method token.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1;

impl Detect for Http1 {
    fn detect(&self, prefix: &[u8]) -> Verdict {
        let mut verdict = Verdict::Reject;
        for method in HTTP1_METHODS {
            match compare(method, prefix) {
                Verdict::Match => return Verdict::Match,
                Verdict::Incomplete => verdict = Verdict::Incomplete,
                Verdict::Reject => {}
            }
        }
        verdict
    }

    fn max_prefix_len(&self) -> usize {
        HTTP1_METHODS.iter().map(|m| m.len()).max().unwrap_or(0)
    }
}

/// Matches HTTP/1.x request lines by their method token.
pub fn http1() -> Http1 {
    Http1
}

/// Matches every connection. Register it last, as a fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Detect for Any {
    fn detect(&self, _: &[u8]) -> Verdict {
        Verdict::Match
    }

    fn max_prefix_len(&self) -> usize {
        0
    }
}

/// Matches every connection. Register it last, as a fallback.
pub fn any() -> Any {
    Any
}

/// A detector built from a closure.
#[derive(Clone)]
pub struct Custom<F> {
    max_len: usize,
    detect: F,
}

impl<F> fmt::Debug for Custom<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Custom")
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl<F> Detect for Custom<F>
where
    F: Fn(&[u8]) -> Verdict + Send + Sync + 'static,
{
    fn detect(&self, prefix: &[u8]) -> Verdict {
        (self.detect)(prefix)
    }

    fn max_prefix_len(&self) -> usize {
        self.max_len
    }
}

/// A detector built from a closure which needs at most `max_len` bytes to decide.
pub fn custom<F>(max_len: usize, detect: F) -> Custom<F>
where
    F: Fn(&[u8]) -> Verdict + Send + Sync + 'static,
{
    Custom { max_len, detect }
}

/// The outcome of running every registered detector over a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The protocol at this registration index matched.
    Matched(usize),

    /// Every detector rejected the prefix.
    Rejected,

    /// A detector with higher precedence than any match needs more bytes.
    Undecided,
}

/// Error returned when a protocol name is registered twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol {0:?} is already registered")]
pub struct DuplicateProtocol(pub String);

struct Entry {
    name: Arc<str>,
    detector: Box<dyn Detect>,
}

/// An ordered, named set of protocol detectors.
///
/// Build it before multiplexing starts; the demultiplexer takes it by value and never
/// changes it afterwards.
#[derive(Default)]
pub struct Protocols {
    entries: Vec<Entry>,
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.name))
            .finish()
    }
}

impl Protocols {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol, returning its index.
    ///
    /// Protocols registered earlier take precedence over protocols registered later.
    pub fn register<D>(
        &mut self,
        name: impl Into<String>,
        detector: D,
    ) -> Result<usize, DuplicateProtocol>
    where
        D: Detect,
    {
        let name = name.into();
        if self.index_of(&name).is_some() {
            return Err(DuplicateProtocol(name));
        }

        self.entries.push(Entry {
            name: name.into(),
            detector: Box::new(detector),
        });
        Ok(self.entries.len() - 1)
    }

    /// Builder-style [`Protocols::register`].
    pub fn with<D>(
        mut self,
        name: impl Into<String>,
        detector: D,
    ) -> Result<Self, DuplicateProtocol>
    where
        D: Detect,
    {
        self.register(name, detector)?;
        Ok(self)
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any protocol is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The registration index of a protocol name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| &*e.name == name)
    }

    /// The protocol name at a registration index.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| &*e.name)
    }

    pub(crate) fn shared_name(&self, index: usize) -> Option<Arc<str>> {
        self.entries.get(index).map(|e| e.name.clone())
    }

    pub(crate) fn shared_names(&self) -> impl Iterator<Item = Arc<str>> + '_ {
        self.entries.iter().map(|e| e.name.clone())
    }

    /// Protocol names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| &*e.name)
    }

    /// The longest prefix any registered detector needs.
    pub fn max_prefix_len(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.detector.max_prefix_len())
            .max()
            .unwrap_or(0)
    }

    /// Run the detectors over `prefix` in registration order.
    pub fn decide(&self, prefix: &[u8]) -> Decision {
        for (index, entry) in self.entries.iter().enumerate() {
            match entry.detector.detect(prefix) {
                Verdict::Match => return Decision::Matched(index),
                Verdict::Incomplete => return Decision::Undecided,
                Verdict::Reject => {}
            }
        }
        Decision::Rejected
    }

    /// The name of the protocol `prefix` belongs to.
    ///
    /// Returns `None` when nothing matches, and also when the prefix is too short
    /// to rule out a protocol with higher precedence than the first match.
    pub fn classify(&self, prefix: &[u8]) -> Option<&str> {
        match self.decide(prefix) {
            Decision::Matched(index) => self.name(index),
            Decision::Rejected | Decision::Undecided => None,
        }
    }
}
