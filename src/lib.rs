#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # squall
//!
//! squall is a non-blocking, single-threaded HTTP/1.x **server front-end**:
//! a listener plus a per-connection protocol state machine, driven entirely
//! by callbacks from a reactor you bring along.
//!
//! A server is defined by a request callback that takes a [`Request`] and
//! writes a valid HTTP response with [`Request::write`], then calls
//! [`Request::finish`]. Beyond parsing request heads and bodies, the only
//! HTTP semantics implemented here are HTTP/1.1 keep-alive connections;
//! response framing is entirely the handler's business, and chunked
//! transfer encoding is not supported in either direction.
//!
//! ## Bring your own runtime
//!
//! The event loop and the buffered socket transport are deliberately not
//! part of this crate. squall consumes two small contracts:
//!
//! - [`rt::Reactor`]: readable-fd callbacks plus one-shot timers, all on
//!   one thread;
//! - [`rt::io::Stream`]: a buffered non-blocking byte stream with
//!   `read_until`/`read_exactly`/`write` callback semantics, created per
//!   accepted socket by a [`rt::io::StreamFactory`].
//!
//! Everything observable about the server (keep-alive behavior, idle
//! timeouts, 100-continue handling, form decoding) is implemented against
//! those traits alone, which is also how the crate tests itself without
//! touching a socket.
//!
//! ## Features
//!
//! - HTTP/1.0 and HTTP/1.1 request parsing with bounded buffering
//! - Keep-alive connection management with idle-timeout reaping
//! - `Expect: 100-continue` interim responses
//! - Query-string, `application/x-www-form-urlencoded`, and
//!   `multipart/form-data` argument decoding
//! - Reverse-proxy (`X-Real-Ip` / `X-Forwarded-For` / `X-Scheme` /
//!   `X-Forwarded-Proto`) support behind the `xheaders` switch
//! - TLS via an opaque option bag handed to your stream factory
//! - Single-process (`listen`) and multi-process (`bind` + `start(n)`)
//!   start-up patterns

#[doc(no_inline)]
pub use http::{header, HeaderMap};

pub use crate::error::{Error, Result};
pub use crate::request::{Request, RequestInit, UploadedFile};
pub use crate::server::{Builder, CertReqs, Connection, Family, Server, TlsOptions};

mod error;
pub mod form;
mod headers;
#[cfg(test)]
mod mock;
pub mod process;
mod request;
pub mod rt;
pub mod server;
