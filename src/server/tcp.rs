//! Listening-socket plumbing: binding and accept-handler registration.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::error;

use crate::rt::Handle;

/// Address family restriction for [`Server::bind`](crate::Server::bind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

/// Creates listening sockets bound to `port` on `address`.
///
/// An empty `address` listens on all interfaces, both IPv4 and IPv6 where
/// available (the IPv6 socket is v6-only so the pair can coexist). A
/// hostname resolves to every address associated with the name. `family`
/// restricts the result to one address family.
pub(crate) fn bind_sockets(
    port: u16,
    address: &str,
    family: Option<Family>,
    backlog: i32,
) -> crate::Result<Vec<TcpListener>> {
    let mut addrs: Vec<SocketAddr> = if address.is_empty() {
        vec![
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
        ]
    } else {
        (address, port)
            .to_socket_addrs()
            .map_err(crate::Error::new_listen)?
            .collect()
    };
    if let Some(family) = family {
        addrs.retain(|addr| match family {
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        });
    }

    let mut sockets = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(crate::Error::new_listen)?;
        socket
            .set_reuse_address(true)
            .map_err(crate::Error::new_listen)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true).map_err(crate::Error::new_listen)?;
        }
        socket
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        socket.bind(&addr.into()).map_err(crate::Error::new_listen)?;
        socket.listen(backlog).map_err(crate::Error::new_listen)?;
        sockets.push(socket.into());
    }
    Ok(sockets)
}

/// Registers `callback` to run for every connection accepted on `socket`.
///
/// The handler drains the accept queue each time the socket polls
/// readable. Accepted sockets are switched to non-blocking before the
/// callback sees them.
pub(crate) fn add_accept_handler<F>(socket: Rc<TcpListener>, reactor: &Handle, mut callback: F)
where
    F: FnMut(TcpStream, SocketAddr) + 'static,
{
    let fd = socket.as_raw_fd();
    reactor.add_handler(
        fd,
        Box::new(move || loop {
            let (stream, _) = match socket.accept() {
                Ok(accepted) => accepted,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if is_connection_error(err) => continue,
                Err(err) => {
                    // Resource exhaustion (EMFILE/ENFILE and friends);
                    // give up until the socket polls readable again.
                    error!("accept failed: {}", err);
                    return;
                }
            };
            if let Err(err) = stream.set_nonblocking(true) {
                error!("could not prepare accepted socket: {}", err);
                continue;
            }
            // Peers without a usable IP endpoint get a synthetic address.
            let address = stream
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
            callback(stream, address);
        }),
    );
}

/// Errors that are scoped to one failed connection: the next connection in
/// the accept queue may still be ready.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
