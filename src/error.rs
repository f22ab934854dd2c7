//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have squall `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// A malformed request was received.
    Parse(Parse),
    /// Error creating a listening socket.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// An `io::Error` from the operating system.
    Io,
}

#[derive(Debug)]
pub(super) enum Parse {
    RequestLine,
    Version,
    Header,
    ContentLength,
    TooLarge,
    BodyTooLarge,
}

impl Error {
    /// Returns true if this was caused by a malformed request.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error occurred while binding a listening socket.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    /// Returns true if this error occurred while accepting a connection.
    pub fn is_accept(&self) -> bool {
        matches!(self.inner.kind, Kind::Accept)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(super) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(super) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(super) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::RequestLine) => "malformed HTTP request line",
            Kind::Parse(Parse::Version) => "malformed HTTP version in request line",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::BodyTooLarge) => "Content-Length too long",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Io => "connection error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("squall::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Status
            | httparse::Error::Token => Parse::Header,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::header::InvalidHeaderName> for Parse {
    fn from(_: http::header::InvalidHeaderName) -> Parse {
        Parse::Header
    }
}

impl From<http::header::InvalidHeaderValue> for Parse {
    fn from(_: http::header::InvalidHeaderValue) -> Parse {
        Parse::Header
    }
}
