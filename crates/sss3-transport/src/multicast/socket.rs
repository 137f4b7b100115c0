//! Multicast socket setup

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

/// Open a UDP socket bound to `group:port` and joined to `group`
///
/// Address reuse is enabled so several local clients can share the session
/// ports. The socket stays blocking and reads give up after `read_timeout`.
pub fn open_multicast(group: Ipv4Addr, port: u16, read_timeout: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(group, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(read_timeout))?;

    debug!(%group, port, ?read_timeout, "Multicast socket ready");
    Ok(socket.into())
}

/// Shut down both directions of a socket, tolerating unconnected sockets
pub fn shutdown(socket: &UdpSocket) {
    if let Err(e) = SockRef::from(socket).shutdown(Shutdown::Both) {
        // Unconnected UDP sockets report ENOTCONN but are still shut down
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}
