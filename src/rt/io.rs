//! The byte-stream contract the server drives.
//!
//! A [`Stream`] is a buffered, non-blocking transport over one TCP
//! (optionally TLS) socket, owned by the reactor thread. Reads are
//! callback-based and at most one may be outstanding at a time; writes are
//! queued and flushed as the socket allows. squall ships no implementation
//! of this trait; the listener obtains streams through a [`StreamFactory`]
//! supplied at construction.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::rc::Rc;

use bytes::Bytes;

use crate::rt::Handle;
use crate::server::TlsOptions;

/// Callback receiving the bytes of a completed read.
pub type ReadCallback = Box<dyn FnOnce(Bytes)>;

/// Callback invoked when a queued write has fully drained.
pub type WriteCallback = Box<dyn FnOnce()>;

/// Callback invoked once when the stream transitions to closed.
pub type CloseCallback = Box<dyn FnOnce()>;

/// A buffered non-blocking byte stream over one socket.
///
/// All methods take `&self`: implementations use interior mutability so
/// that callbacks delivered by the stream may re-enter it (for example, a
/// read callback scheduling the next read).
///
/// When the stream closes (by [`close`](Stream::close), remote EOF, or a
/// transport error) it must drop any pending read and write callbacks and
/// then invoke the close callback exactly once.
pub trait Stream {
    /// Reads until `delimiter` is seen, delivering everything up to and
    /// including the delimiter.
    fn read_until(&self, delimiter: &'static [u8], callback: ReadCallback);

    /// Reads exactly `n` bytes.
    fn read_exactly(&self, n: usize, callback: ReadCallback);

    /// Queues `chunk` for writing. If `callback` is supplied it runs once
    /// the chunk has drained. Writes are delivered in call order.
    fn write(&self, chunk: Bytes, callback: Option<WriteCallback>);

    /// Registers the callback run when the stream closes.
    fn set_close_callback(&self, callback: CloseCallback);

    /// Closes the stream, dropping pending callbacks.
    fn close(&self);

    /// Whether the stream has closed.
    fn closed(&self) -> bool;

    /// Whether a write is currently draining.
    fn writing(&self) -> bool;

    /// The most bytes the stream is willing to buffer for a single read.
    fn max_buffer_size(&self) -> usize;

    /// Whether this stream is TLS-wrapped.
    fn is_tls(&self) -> bool {
        false
    }

    /// The DER-encoded certificate presented by the peer, if this is a TLS
    /// stream whose handshake produced one. TLS failures yield `None`.
    fn peer_certificate(&self) -> Option<Bytes> {
        None
    }
}

/// Why a TLS wrap of an accepted socket failed.
///
/// [`Eof`](TlsError::Eof) and [`Aborted`](TlsError::Aborted) mean the peer
/// went away mid-handshake; the listener closes those silently. Anything
/// else surfaces through the accept path's error sink.
pub enum TlsError {
    /// The peer closed the connection during the handshake.
    Eof,
    /// The connection was aborted before the handshake completed.
    Aborted,
    /// Any other handshake or configuration failure.
    Other(Box<dyn StdError + Send + Sync>),
}

impl fmt::Debug for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Eof => f.write_str("TlsError::Eof"),
            TlsError::Aborted => f.write_str("TlsError::Aborted"),
            TlsError::Other(cause) => f.debug_tuple("TlsError::Other").field(cause).finish(),
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Eof => f.write_str("EOF during TLS handshake"),
            TlsError::Aborted => f.write_str("connection aborted during TLS handshake"),
            TlsError::Other(cause) => write!(f, "TLS handshake failed: {}", cause),
        }
    }
}

impl StdError for TlsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TlsError::Other(cause) => Some(&**cause),
            _ => None,
        }
    }
}

/// Builds [`Stream`]s for sockets the listener accepts.
pub trait StreamFactory {
    /// Wraps an accepted socket in a plain stream.
    fn plain(&self, socket: TcpStream, reactor: &Handle) -> io::Result<Rc<dyn Stream>>;

    /// Wraps an accepted socket in a TLS stream with a deferred handshake.
    fn tls(
        &self,
        socket: TcpStream,
        options: &TlsOptions,
        reactor: &Handle,
    ) -> Result<Rc<dyn Stream>, TlsError>;
}
