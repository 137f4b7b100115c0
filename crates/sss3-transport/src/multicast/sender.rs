//! Outbound (CARLA side) socket handling

use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use sss3_core::{Frame, FRAME_SIZE};
use tracing::{debug, error, trace};

use super::stats::DataPlaneStats;
use crate::error::DataPlaneResult;
use crate::reactor::{EventHandler, Handle, Interest, Reactor, Readiness};

/// Sends frames to the simulator's multicast endpoint
///
/// The socket is joined to the group as well, so it also sees its own
/// looped-back datagrams; those are drained and ignored.
pub struct CarlaSender {
    socket: UdpSocket,
    target: SocketAddrV4,
    send_lock: Mutex<()>,
    reactor: Arc<Reactor>,
    stats: Arc<DataPlaneStats>,
}

impl CarlaSender {
    pub fn new(
        socket: UdpSocket,
        target: SocketAddrV4,
        reactor: Arc<Reactor>,
        stats: Arc<DataPlaneStats>,
    ) -> Self {
        Self {
            socket,
            target,
            send_lock: Mutex::new(()),
            reactor,
            stats,
        }
    }

    pub fn handle(&self) -> Handle {
        self.socket.as_raw_fd()
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Encode and transmit one frame
    ///
    /// Returns `Ok(false)` when the datagram was dropped because of a
    /// transient failure. Dropped frames are never resent.
    pub fn send(&self, frame: &Frame) -> DataPlaneResult<bool> {
        let _guard = self.send_lock.lock();
        let bytes = frame.encode();

        let sent = match self.socket.send_to(&bytes, self.target) {
            Ok(_) => {
                self.stats.record_sent();
                true
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                error!(id = frame.id, "Message was interrupted while sending");
                self.stats.record_send_dropped();
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                error!(id = frame.id, "Socket is blocked and cannot send messages");
                self.stats.record_send_dropped();
                false
            }
            Err(e) => return Err(e.into()),
        };

        // Send and read paths share the handle
        if let Err(e) = self.reactor.set_interest(self.handle(), Interest::READABLE) {
            debug!(error = %e, "Could not restore read interest on CARLA socket");
        }

        Ok(sent)
    }

    fn drain_one(&self) {
        let mut buf = [0u8; FRAME_SIZE + 1];
        match self.socket.recv(&mut buf) {
            Ok(len) => trace!(len, "Ignoring datagram on CARLA socket"),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => debug!(error = %e, "Receive failed on CARLA socket"),
        }
    }
}

impl EventHandler for CarlaSender {
    fn on_ready(&self, _handle: Handle, readiness: Readiness) {
        if readiness.readable {
            self.drain_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    #[test]
    fn test_send_encodes_frame_to_target() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let reactor = Arc::new(Reactor::new().unwrap());
        let stats = Arc::new(DataPlaneStats::new());
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let sender = CarlaSender::new(socket, target, reactor.clone(), stats.clone());
        reactor
            .register(sender.handle(), Interest::READABLE, None)
            .unwrap();

        let frame = Frame {
            id: 9,
            steer: 0.1,
            reverse: true,
            ..Default::default()
        };
        assert!(sender.send(&frame).unwrap());

        let mut buf = [0u8; 64];
        let len = listener.recv(&mut buf).unwrap();
        assert_eq!(len, FRAME_SIZE);
        assert_eq!(Frame::decode(&buf[..len]).unwrap(), frame);
        assert_eq!(stats.snapshot().frames_sent, 1);
        assert!(reactor.is_registered(sender.handle()));
    }
}
