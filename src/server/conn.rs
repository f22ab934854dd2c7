//! Per-connection HTTP/1.x state machine.
//!
//! A connection drives one client socket through repeated request/response
//! cycles: read a request head, optionally read its body, hand a
//! [`Request`] to the server's callback, and once the handler finishes,
//! either close or schedule the next head read. Every step is a stream or
//! timer callback; nothing blocks.

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::error::Parse;
use crate::form;
use crate::headers;
use crate::request::{Request, RequestInit};
use crate::rt::io::Stream;
use crate::rt::{Handle, Timeout};

/// The server's request callback.
pub(crate) type RequestCallback = Rc<dyn Fn(Request)>;

/// Handle to a live HTTP connection.
///
/// Requests hold one of these so `write`/`finish` can reach the stream.
/// The connection itself stays alive through the open stream's close
/// callback; once the stream closes, only outstanding [`Request`] values
/// keep the handle valid (writes become no-ops).
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    stream: Rc<dyn Stream>,
    address: SocketAddr,
    request_callback: RequestCallback,
    no_keep_alive: bool,
    xheaders: bool,
    connection_timeout: Option<Duration>,
    reactor: Handle,
    /// Head-line facts of the dispatched request, kept for the keep-alive
    /// decision. `Some` from dispatch until the finish procedure runs.
    request: Option<InflightRequest>,
    /// A request whose body is still being read.
    reading_body: Option<Request>,
    request_finished: bool,
    timeout: Option<Timeout>,
    span: tracing::Span,
}

/// What the finish procedure needs to know about the dispatched request.
struct InflightRequest {
    http_11: bool,
    head_or_get: bool,
    has_content_length: bool,
    connection_header: Option<String>,
}

impl Connection {
    /// Creates a connection over `stream` and starts reading the first
    /// request head.
    pub(crate) fn spawn(
        stream: Rc<dyn Stream>,
        address: SocketAddr,
        request_callback: RequestCallback,
        no_keep_alive: bool,
        xheaders: bool,
        connection_timeout: Option<Duration>,
        reactor: Handle,
    ) -> Connection {
        // The span snapshots whatever diagnostic context is ambient right
        // now; later requests on this connection re-enter it rather than
        // whatever context the previous handler left behind.
        let span = tracing::debug_span!("connection", peer = %address);
        let connection = Connection {
            inner: Rc::new(RefCell::new(Inner {
                stream: stream.clone(),
                address,
                request_callback,
                no_keep_alive,
                xheaders,
                connection_timeout,
                reactor,
                request: None,
                reading_body: None,
                request_finished: false,
                timeout: None,
                span,
            })),
        };

        // The open stream owns the only permanent strong handle; when it
        // closes (remote EOF included) the connection unwinds.
        let strong = connection.clone();
        stream.set_close_callback(Box::new(move || strong.on_close()));

        connection.reset_connection_timeout();
        connection.read_next_request();
        connection
    }

    /// Writes a chunk of response output to the stream.
    ///
    /// # Panics
    ///
    /// Panics if no request is in flight; a handler writing after
    /// `finish` is a bug that should fail loudly.
    pub fn write(&self, chunk: Bytes) {
        let stream = {
            let inner = self.inner.borrow();
            assert!(
                inner.request.is_some() || inner.reading_body.is_some(),
                "request closed"
            );
            inner.stream.clone()
        };
        if !stream.closed() {
            let weak = Rc::downgrade(&self.inner);
            stream.write(
                chunk,
                Some(Box::new(move || {
                    if let Some(connection) = upgrade(&weak) {
                        connection.on_write_complete();
                    }
                })),
            );
        }
    }

    /// Finishes the in-flight request.
    ///
    /// # Panics
    ///
    /// Panics if no request is in flight.
    pub fn finish(&self) {
        let stream = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.request.is_some() || inner.reading_body.is_some(),
                "request closed"
            );
            inner.request_finished = true;
            inner.stream.clone()
        };
        if !stream.writing() {
            self.finish_request();
        }
    }

    pub(crate) fn xheaders(&self) -> bool {
        self.inner.borrow().xheaders
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.inner.borrow().stream.is_tls()
    }

    pub(crate) fn peer_certificate(&self) -> Option<Bytes> {
        self.inner.borrow().stream.peer_certificate()
    }

    fn read_next_request(&self) {
        let stream = self.inner.borrow().stream.clone();
        let weak = Rc::downgrade(&self.inner);
        stream.read_until(
            b"\r\n\r\n",
            Box::new(move |data| {
                if let Some(connection) = upgrade(&weak) {
                    connection.on_headers(data);
                }
            }),
        );
    }

    fn on_headers(&self, data: Bytes) {
        let span = self.inner.borrow().span.clone();
        let _enter = span.enter();
        self.reset_connection_timeout();
        if let Err(err) = self.process_headers(data) {
            let (address, stream) = {
                let inner = self.inner.borrow();
                (inner.address, inner.stream.clone())
            };
            info!("malformed HTTP request from {}: {}", address.ip(), err);
            stream.close();
        }
    }

    fn process_headers(&self, data: Bytes) -> crate::Result<()> {
        let head = headers::parse_request_head(&data)?;
        trace!(method = %head.method, uri = %head.uri, version = %head.version, "request head");

        let (address, stream) = {
            let inner = self.inner.borrow();
            (inner.address, inner.stream.clone())
        };
        let request = Request::new(RequestInit {
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            remote_ip: address.ip().to_string(),
            connection: Some(self.clone()),
            ..RequestInit::default()
        });

        let content_length = headers::value_string(&request.headers, "content-length");
        if let Some(content_length) = content_length.filter(|v| !v.is_empty()) {
            let content_length: usize = content_length
                .trim()
                .parse()
                .map_err(|_| Parse::ContentLength)?;
            if content_length > stream.max_buffer_size() {
                return Err(Parse::BodyTooLarge.into());
            }
            if headers::value_string(&request.headers, "expect").as_deref()
                == Some("100-continue")
            {
                stream.write(Bytes::from_static(b"HTTP/1.1 100 (Continue)\r\n\r\n"), None);
            }
            self.inner.borrow_mut().reading_body = Some(request);
            let weak = Rc::downgrade(&self.inner);
            stream.read_exactly(
                content_length,
                Box::new(move |data| {
                    if let Some(connection) = upgrade(&weak) {
                        connection.on_request_body(data);
                    }
                }),
            );
            return Ok(());
        }

        self.dispatch(request);
        Ok(())
    }

    fn on_request_body(&self, data: Bytes) {
        let span = self.inner.borrow().span.clone();
        let _enter = span.enter();
        self.reset_connection_timeout();

        let mut request = match self.inner.borrow_mut().reading_body.take() {
            Some(request) => request,
            None => return,
        };
        request.body = data;

        if matches!(request.method.as_str(), "POST" | "PUT") {
            let content_type =
                headers::value_string(&request.headers, "content-type").unwrap_or_default();
            if content_type.starts_with("application/x-www-form-urlencoded") {
                let body = request.body.clone();
                form::add_form_arguments(&body, &mut request.arguments);
            } else if content_type.starts_with("multipart/form-data") {
                let boundary = content_type.split(';').find_map(|field| {
                    match form::split_once(field.trim(), '=') {
                        Some(("boundary", value)) if !value.is_empty() => {
                            Some(value.to_string())
                        }
                        _ => None,
                    }
                });
                match boundary {
                    Some(boundary) => {
                        let body = request.body.clone();
                        form::parse_multipart_form_data(
                            boundary.as_bytes(),
                            &body,
                            &mut request.arguments,
                            &mut request.files,
                        );
                    }
                    None => warn!("invalid multipart/form-data"),
                }
            }
        }

        self.dispatch(request);
    }

    fn dispatch(&self, request: Request) {
        let request_callback = {
            let mut inner = self.inner.borrow_mut();
            inner.request = Some(InflightRequest {
                http_11: request.version == "HTTP/1.1",
                head_or_get: matches!(request.method.as_str(), "HEAD" | "GET"),
                has_content_length: request.headers.contains_key(http::header::CONTENT_LENGTH),
                connection_header: headers::value_string(&request.headers, "connection"),
            });
            inner.request_finished = false;
            inner.request_callback.clone()
        };
        request_callback(request);
    }

    fn on_write_complete(&self) {
        let (span, request_finished) = {
            let inner = self.inner.borrow();
            (inner.span.clone(), inner.request_finished)
        };
        let _enter = span.enter();
        self.reset_connection_timeout();
        if request_finished {
            self.finish_request();
        }
    }

    fn finish_request(&self) {
        let (disconnect, stream) = {
            let mut inner = self.inner.borrow_mut();
            let disconnect = match inner.request.take() {
                _ if inner.no_keep_alive => true,
                Some(request) => should_disconnect(&request),
                None => true,
            };
            inner.request_finished = false;
            (disconnect, inner.stream.clone())
        };
        if disconnect {
            debug!("closing connection after request");
            stream.close();
            return;
        }
        self.reset_connection_timeout();
        self.read_next_request();
    }

    fn reset_connection_timeout(&self) {
        let (reactor, delay, old) = {
            let mut inner = self.inner.borrow_mut();
            let delay = match inner.connection_timeout {
                Some(delay) => delay,
                None => return,
            };
            (inner.reactor.clone(), delay, inner.timeout.take())
        };
        if let Some(old) = old {
            reactor.remove_timeout(&old);
        }
        let weak = Rc::downgrade(&self.inner);
        let timeout = reactor.add_timeout(
            reactor.now() + delay,
            Box::new(move || {
                if let Some(connection) = upgrade(&weak) {
                    connection.handle_timeout();
                }
            }),
        );
        self.inner.borrow_mut().timeout = Some(timeout);
    }

    fn handle_timeout(&self) {
        let (span, stream) = {
            let mut inner = self.inner.borrow_mut();
            inner.timeout = None;
            (inner.span.clone(), inner.stream.clone())
        };
        let _enter = span.enter();
        if stream.closed() {
            return;
        }
        if stream.writing() {
            // A response is still draining; reap on a later tick.
            self.reset_connection_timeout();
        } else {
            debug!("closing idle connection");
            stream.close();
        }
    }

    fn on_close(&self) {
        let (reactor, timeout, span) = {
            let mut inner = self.inner.borrow_mut();
            (inner.reactor.clone(), inner.timeout.take(), inner.span.clone())
        };
        let _enter = span.enter();
        trace!("connection closed");
        if let Some(timeout) = timeout {
            reactor.remove_timeout(&timeout);
        }
        // Drop a half-parsed request so no strong cycle outlives the
        // stream. A dispatched request stays recorded: the handler may
        // still call finish against the closed stream.
        self.inner.borrow_mut().reading_body = None;
    }
}

/// The keep-alive decision, applied once a request finishes.
///
/// HTTP/1.1 connections persist unless the client sent `Connection: close`.
/// HTTP/1.0 (and earlier) connections can only be reused when the response
/// is length-delimited without closing (the request carried a
/// Content-Length or was a HEAD/GET) and the client asked with
/// `Connection: Keep-Alive`. Both header comparisons are exact literal
/// matches.
fn should_disconnect(request: &InflightRequest) -> bool {
    if request.http_11 {
        request.connection_header.as_deref() == Some("close")
    } else if request.has_content_length || request.head_or_get {
        request.connection_header.as_deref() != Some("Keep-Alive")
    } else {
        true
    }
}

fn upgrade(weak: &Weak<RefCell<Inner>>) -> Option<Connection> {
    weak.upgrade().map(|inner| Connection { inner })
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Connection")
            .field("peer", &inner.address)
            .field("closed", &inner.stream.closed())
            .finish()
    }
}
