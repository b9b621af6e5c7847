//! Stream listeners the proxy accepts connections from

use crate::config::ListenAddr;
use std::future::Future;
use std::io;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A source of inbound byte streams
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener for `network` ("tcp", "tcp4" or "tcp6") on `addr`.
///
/// An empty host binds every interface of the requested family, so overlay
/// traffic routed to this machine by the overlay daemon reaches it. For
/// "tcp" that is a dual-stack IPv6 socket, or IPv4 only on hosts without
/// IPv6.
pub async fn listen(network: &str, addr: &ListenAddr) -> io::Result<TcpListener> {
    let host = match (network, addr.host.as_str()) {
        ("tcp", "") => {
            return match bind_unspecified_v6(addr.port, false) {
                Ok(listener) => Ok(listener),
                Err(e) => {
                    debug!(error = %e, "Dual-stack bind failed, listening on IPv4 only");
                    TcpListener::bind((Ipv4Addr::UNSPECIFIED, addr.port)).await
                }
            };
        }
        ("tcp4", "") => "0.0.0.0",
        ("tcp6", "") => return bind_unspecified_v6(addr.port, true),
        ("tcp" | "tcp4" | "tcp6", host) => host,
        (other, _) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", other),
            ))
        }
    };

    TcpListener::bind((host, addr.port)).await
}

fn bind_unspecified_v6(port: u16, only_v6: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(only_v6)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accept errors that only affect one connection or clear up on their own
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOBUFS || code == libc::ENOMEM;
    }

    false
}
