use std::net::{SocketAddr, TcpListener};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// TCP listening socket.
///
/// Provides bind/accept/connect over loopback or network TCP. `shutdown`
/// unblocks a blocked `accept` so the owning accept loop can observe its
/// stop flag and exit cleanly.
pub struct TcpSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocket {
    /// Bind and listen on a TCP address.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr,
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr,
            source: e,
        })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<RpcStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok(RpcStream::from_tcp(stream))
    }

    /// Connect to a listening TCP socket (blocking).
    pub fn connect(addr: SocketAddr) -> Result<RpcStream> {
        let stream =
            std::net::TcpStream::connect(addr).map_err(|e| TransportError::Connect {
                addr,
                source: e,
            })?;
        debug!(%addr, "connected to tcp socket");
        Ok(RpcStream::from_tcp(stream))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut down the listening socket, unblocking any blocked `accept`.
    ///
    /// The wakeup surfaces as an `Accept` error on the blocked call; the
    /// accept loop's own stop flag decides whether that wakeup means
    /// "shutdown requested" or a genuine transport failure. The result of
    /// the underlying shutdown call is ignored: on some platforms it
    /// reports NotConnected for listening sockets even when the wakeup
    /// succeeds.
    #[cfg(unix)]
    pub fn shutdown(&self) {
        use std::os::fd::AsRawFd;

        debug!(local_addr = %self.local_addr, "shutting down tcp listener");
        // SAFETY: the fd is an open listening socket owned by this struct
        // for the duration of the call.
        unsafe {
            let _ = libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// Shut down the listening socket, unblocking any blocked `accept`.
    ///
    /// Fallback for platforms without raw-fd shutdown: a throwaway
    /// self-connection wakes the acceptor, which then checks its stop flag.
    #[cfg(not(unix))]
    pub fn shutdown(&self) {
        debug!(local_addr = %self.local_addr, "shutting down tcp listener");
        let _ = std::net::TcpStream::connect(self.local_addr);
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
