//! The HTTP/1.x server front-end.
//!
//! A [`Server`] is defined by a request callback taking a
//! [`Request`](crate::Request) and writing a complete HTTP response with
//! `request.write(..)` followed by `request.finish()`. Beyond parsing
//! request heads and bodies, the only HTTP semantics implemented here are
//! HTTP/1.1 keep-alive connections; chunked transfer encoding is not
//! supported, so handlers must provide a Content-Length (or close the
//! connection) for HTTP/1.1 clients to work correctly.
//!
//! Start-up follows one of three patterns:
//!
//! 1. `listen` (single-process): build the server, call
//!    [`listen`](Server::listen), run the reactor.
//! 2. `bind`/`start` (multi-process): [`bind`](Server::bind) the ports,
//!    then [`start(n)`](Server::start) to fork workers that each accept on
//!    their own reactor.
//! 3. `add_sockets`: sockets created elsewhere (for example around an
//!    explicit [`fork_processes`](crate::process::fork_processes)) are
//!    handed straight to [`add_sockets`](Server::add_sockets).

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error};

pub(crate) mod conn;
mod tcp;

pub use self::conn::Connection;
pub use self::tcp::Family;

use self::conn::RequestCallback;
use crate::process;
use crate::request::Request;
use crate::rt;
use crate::rt::io::{StreamFactory, TlsError};

/// How client certificates are requested during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertReqs {
    /// Do not request a client certificate.
    None,
    /// Request one but accept its absence.
    Optional,
    /// Require a valid client certificate.
    Required,
}

impl Default for CertReqs {
    fn default() -> CertReqs {
        CertReqs::None
    }
}

/// TLS configuration handed through to the [`StreamFactory`].
///
/// The server core never opens these files itself; the factory's TLS
/// implementation interprets them.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsOptions {
    /// Path to the server certificate (chain) in PEM form.
    pub certfile: PathBuf,
    /// Path to the private key in PEM form.
    pub keyfile: PathBuf,
    /// Client-certificate policy.
    pub cert_reqs: CertReqs,
    /// Trust roots used to verify client certificates.
    pub ca_certs: Option<PathBuf>,
}

impl TlsOptions {
    /// Options for plain server-side TLS with `certfile` and `keyfile`.
    pub fn new(certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> TlsOptions {
        TlsOptions {
            certfile: certfile.into(),
            keyfile: keyfile.into(),
            cert_reqs: CertReqs::None,
            ca_certs: None,
        }
    }
}

pub(crate) struct ServerConfig {
    request_callback: RequestCallback,
    stream_factory: Box<dyn StreamFactory>,
    no_keep_alive: bool,
    xheaders: bool,
    tls_options: Option<TlsOptions>,
    connection_timeout: Option<Duration>,
}

/// A builder for a [`Server`].
pub struct Builder {
    stream_factory: Box<dyn StreamFactory>,
    no_keep_alive: bool,
    xheaders: bool,
    tls_options: Option<TlsOptions>,
    connection_timeout: Option<Duration>,
    io_loop: Option<rt::Handle>,
}

impl Builder {
    /// Forces every connection to close after one request, regardless of
    /// HTTP version. Useful when handlers cannot emit Content-Length.
    pub fn no_keep_alive(mut self, enabled: bool) -> Builder {
        self.no_keep_alive = enabled;
        self
    }

    /// Honors the reverse-proxy headers `X-Real-Ip`/`X-Forwarded-For` and
    /// `X-Scheme`/`X-Forwarded-Proto` on incoming requests.
    pub fn xheaders(mut self, enabled: bool) -> Builder {
        self.xheaders = enabled;
        self
    }

    /// Serves TLS on every accepted connection using `options`.
    pub fn tls(mut self, options: TlsOptions) -> Builder {
        self.tls_options = Some(options);
        self
    }

    /// Closes keep-alive connections idle for longer than `timeout`.
    /// Disabled by default.
    pub fn connection_timeout(mut self, timeout: Duration) -> Builder {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Runs the server on `reactor` instead of the thread default.
    ///
    /// Must not be used together with multi-process
    /// [`start`](Server::start).
    pub fn io_loop(mut self, reactor: rt::Handle) -> Builder {
        self.io_loop = Some(reactor);
        self
    }

    /// Finishes the builder with the request callback, producing a
    /// [`Server`].
    pub fn serve<F>(self, request_callback: F) -> Server
    where
        F: Fn(Request) + 'static,
    {
        Server {
            config: Rc::new(ServerConfig {
                request_callback: Rc::new(request_callback),
                stream_factory: self.stream_factory,
                no_keep_alive: self.no_keep_alive,
                xheaders: self.xheaders,
                tls_options: self.tls_options,
                connection_timeout: self.connection_timeout,
            }),
            io_loop: self.io_loop,
            sockets: HashMap::new(),
            pending_sockets: Vec::new(),
            started: false,
        }
    }
}

/// A non-blocking, single-threaded HTTP/1.x server.
pub struct Server {
    config: Rc<ServerConfig>,
    io_loop: Option<rt::Handle>,
    sockets: HashMap<RawFd, Rc<TcpListener>>,
    pending_sockets: Vec<TcpListener>,
    started: bool,
}

impl Server {
    /// Starts building a server over `factory`, which supplies the
    /// buffered stream for each accepted socket.
    pub fn builder<F>(factory: F) -> Builder
    where
        F: StreamFactory + 'static,
    {
        Builder {
            stream_factory: Box::new(factory),
            no_keep_alive: false,
            xheaders: false,
            tls_options: None,
            connection_timeout: None,
            io_loop: None,
        }
    }

    /// Binds to `port` and starts accepting immediately.
    ///
    /// May be called more than once to listen on multiple ports. An empty
    /// `address` listens on all interfaces. The reactor still has to run
    /// for connections to be served.
    pub fn listen(&mut self, port: u16, address: &str) -> crate::Result<()> {
        let sockets = tcp::bind_sockets(port, address, None, 128)?;
        self.add_sockets(sockets);
        Ok(())
    }

    /// Binds to `port` without accepting yet; [`start`](Server::start)
    /// activates the socket. Called after `start`, the socket is activated
    /// immediately. May be called multiple times for multiple ports.
    pub fn bind(
        &mut self,
        port: u16,
        address: &str,
        family: Option<Family>,
        backlog: i32,
    ) -> crate::Result<()> {
        let sockets = tcp::bind_sockets(port, address, family, backlog)?;
        if self.started {
            self.add_sockets(sockets);
        } else {
            self.pending_sockets.extend(sockets);
        }
        Ok(())
    }

    /// Activates the sockets bound so far, optionally forking worker
    /// processes first.
    ///
    /// `num_processes` of 1 serves from this process. 0 forks one worker
    /// per detected CPU core; any other count forks exactly that many.
    /// Forked workers each resolve their own default reactor, so no
    /// reactor may be created or referenced before this call, and an
    /// explicit `io_loop` is incompatible with forking.
    ///
    /// # Panics
    ///
    /// Panics if the server was already started.
    pub fn start(&mut self, num_processes: usize) -> crate::Result<()> {
        assert!(!self.started, "server already started");
        self.started = true;
        if num_processes != 1 {
            assert!(
                self.io_loop.is_none(),
                "multi-process start requires the default reactor"
            );
            process::fork_processes(num_processes).map_err(crate::Error::new_io)?;
        }
        let sockets = mem::take(&mut self.pending_sockets);
        self.add_sockets(sockets);
        Ok(())
    }

    /// Starts accepting connections on externally created listening
    /// sockets. The sockets should already be non-blocking.
    pub fn add_sockets(&mut self, sockets: Vec<TcpListener>) {
        let io_loop = self.io_loop.get_or_insert_with(rt::default).clone();
        for socket in sockets {
            let socket = Rc::new(socket);
            self.sockets.insert(socket.as_raw_fd(), socket.clone());
            let config = self.config.clone();
            let reactor = io_loop.clone();
            tcp::add_accept_handler(socket, &io_loop, move |stream, address| {
                if let Err(err) = handle_connection(&config, &reactor, stream, address) {
                    error!("error in connection callback: {}", err);
                }
            });
        }
    }

    /// Singular form of [`add_sockets`](Server::add_sockets).
    pub fn add_socket(&mut self, socket: TcpListener) {
        self.add_sockets(vec![socket]);
    }

    /// Stops listening for new connections. Requests in progress continue
    /// undisturbed.
    pub fn stop(&mut self) {
        let io_loop = match self.io_loop {
            Some(ref io_loop) => io_loop.clone(),
            None => {
                self.sockets.clear();
                return;
            }
        };
        for (fd, _socket) in self.sockets.drain() {
            io_loop.remove_handler(fd);
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listening", &self.sockets.len())
            .field("pending", &self.pending_sockets.len())
            .field("started", &self.started)
            .finish()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("no_keep_alive", &self.no_keep_alive)
            .field("xheaders", &self.xheaders)
            .field("tls", &self.tls_options.is_some())
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

/// Wraps one accepted socket in a stream and spawns its connection.
pub(crate) fn handle_connection(
    config: &Rc<ServerConfig>,
    reactor: &rt::Handle,
    socket: TcpStream,
    address: SocketAddr,
) -> crate::Result<()> {
    let stream = if let Some(ref tls_options) = config.tls_options {
        match config.stream_factory.tls(socket, tls_options, reactor) {
            Ok(stream) => stream,
            Err(TlsError::Eof) | Err(TlsError::Aborted) => {
                // The peer gave up mid-handshake; nothing to report.
                debug!("TLS handshake abandoned by {}", address);
                return Ok(());
            }
            Err(TlsError::Other(cause)) => return Err(crate::Error::new_accept(cause)),
        }
    } else {
        config
            .stream_factory
            .plain(socket, reactor)
            .map_err(crate::Error::new_accept)?
    };
    Connection::spawn(
        stream,
        address,
        config.request_callback.clone(),
        config.no_keep_alive,
        config.xheaders,
        config.connection_timeout,
        reactor.clone(),
    );
    Ok(())
}
