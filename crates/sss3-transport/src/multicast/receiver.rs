//! Inbound (CAN side) socket handling

use std::io;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sss3_core::{ClockSource, Frame, ReceivedFrame, FRAME_SIZE};
use tracing::{debug, info, trace, warn};

use super::consumer::FrameConsumer;
use super::stats::DataPlaneStats;
use super::timeout::ReceiveTimeout;
use crate::reactor::{EventHandler, Handle, Readiness};

/// Reads frames from the inbound multicast socket
pub struct CanReceiver {
    socket: UdpSocket,
    consumer: Arc<dyn FrameConsumer>,
    stats: Arc<DataPlaneStats>,
    clock: Arc<dyn ClockSource>,
    timeout: Mutex<ReceiveTimeout>,
    /// Last datagram or counted timeout; the next deadline runs from here
    last_activity: Mutex<Instant>,
}

impl CanReceiver {
    /// Wrap a bound socket; its read timeout is set to `timeout.current()`
    pub fn new(
        socket: UdpSocket,
        timeout: ReceiveTimeout,
        consumer: Arc<dyn FrameConsumer>,
        stats: Arc<DataPlaneStats>,
        clock: Arc<dyn ClockSource>,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(timeout.current()))?;
        Ok(Self {
            socket,
            consumer,
            stats,
            clock,
            timeout: Mutex::new(timeout),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn handle(&self) -> Handle {
        self.socket.as_raw_fd()
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Current receive timeout
    pub fn current_timeout(&self) -> Duration {
        self.timeout.lock().current()
    }

    /// Time left at `now` before silence on the socket counts as a timeout
    pub fn time_to_deadline(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(*self.last_activity.lock());
        self.current_timeout().saturating_sub(elapsed)
    }

    /// Count a timeout if nothing arrived within the current timeout
    ///
    /// Readiness of other handles sharing the reactor does not postpone
    /// the deadline. Returns whether a timeout was counted.
    pub fn check_deadline(&self, now: Instant) -> bool {
        if !self.time_to_deadline(now).is_zero() {
            return false;
        }
        self.on_timeout_at(now);
        true
    }

    /// Read exactly one datagram
    ///
    /// Datagrams that are not [`FRAME_SIZE`] bytes long are discarded without
    /// decoding. A receive timeout is counted and tightens the timeout.
    pub fn on_readable(&self) {
        // One spare byte so oversized datagrams show up as a size mismatch
        let mut buf = [0u8; FRAME_SIZE + 1];

        match self.socket.recv(&mut buf) {
            Ok(len) if len == FRAME_SIZE => match Frame::decode(&buf[..len]) {
                Ok(frame) => self.deliver(frame),
                Err(e) => debug!(error = %e, "Frame decode failed"),
            },
            Ok(len) => {
                self.touch(Instant::now());
                trace!(len, "Discarding datagram of unexpected size");
                self.stats.record_discard();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.on_timeout();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("Receive interrupted");
            }
            Err(e) => warn!(error = %e, "Receive failed on CAN socket"),
        }
    }

    /// Account for a receive timeout and tighten the timeout for later reads
    pub fn on_timeout(&self) {
        self.on_timeout_at(Instant::now());
    }

    fn on_timeout_at(&self, at: Instant) {
        self.touch(at);
        let total = self.stats.record_timeout();
        let now = self.clock.now_ms();

        let mut timeout = self.timeout.lock();
        let previous = timeout.current();
        if let Some(next) = timeout.tighten() {
            self.apply_timeout(next);
            info!(
                timestamp_ms = now,
                from_ms = previous.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                "Tightened CAN receive timeout"
            );
        }
        warn!(timestamp_ms = now, total, "Socket timeout");
    }

    fn touch(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }

    fn deliver(&self, frame: Frame) {
        self.touch(Instant::now());
        let received_at_ms = self.clock.now_ms();
        if self.stats.record_frame(frame.id) {
            debug!(id = frame.id, "Frame sequence gap");
        }

        {
            let mut timeout = self.timeout.lock();
            let previous = timeout.current();
            if let Some(next) = timeout.reset() {
                self.apply_timeout(next);
                info!(
                    timestamp_ms = received_at_ms,
                    from_ms = previous.as_millis() as u64,
                    to_ms = next.as_millis() as u64,
                    "Restored CAN receive timeout"
                );
            }
        }

        self.consumer.consume(ReceivedFrame {
            frame,
            received_at_ms,
        });
    }

    fn apply_timeout(&self, timeout: Duration) {
        if let Err(e) = self.socket.set_read_timeout(Some(timeout)) {
            warn!(error = %e, "Failed to update receive timeout");
        }
    }
}

impl EventHandler for CanReceiver {
    fn on_ready(&self, _handle: Handle, readiness: Readiness) {
        if readiness.readable {
            self.on_readable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use pretty_assertions::assert_eq;
    use sss3_core::SystemClock;

    use crate::multicast::ChannelConsumer;

    fn receiver(
        timeout: ReceiveTimeout,
    ) -> (
        CanReceiver,
        UdpSocket,
        crossbeam_channel::Receiver<ReceivedFrame>,
        Arc<DataPlaneStats>,
    ) {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.connect(rx.local_addr().unwrap()).unwrap();

        let (frames_tx, frames_rx) = unbounded();
        let stats = Arc::new(DataPlaneStats::new());
        let receiver = CanReceiver::new(
            rx,
            timeout,
            Arc::new(ChannelConsumer::new(frames_tx)),
            stats.clone(),
            Arc::new(SystemClock),
        )
        .unwrap();
        (receiver, tx, frames_rx, stats)
    }

    fn short_timeout() -> ReceiveTimeout {
        ReceiveTimeout::new(Duration::from_millis(40), Duration::from_millis(10))
    }

    #[test]
    fn test_valid_frame_is_forwarded() {
        let (receiver, tx, frames, stats) = receiver(short_timeout());
        let frame = Frame {
            id: 42,
            throttle: 0.5,
            gear: 2,
            ..Default::default()
        };

        tx.send(&frame.encode()).unwrap();
        receiver.on_readable();

        let received = frames.try_recv().unwrap();
        assert_eq!(received.frame, frame);
        assert!(received.received_at_ms > 0);
        assert_eq!(stats.snapshot().frames_received, 1);
    }

    #[test]
    fn test_short_datagram_is_discarded() {
        let (receiver, tx, frames, stats) = receiver(short_timeout());

        tx.send(&[0u8; 18]).unwrap();
        receiver.on_readable();

        assert!(frames.try_recv().is_err());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.discarded, 1);
        assert_eq!(snapshot.dropped_messages, 0);
        assert_eq!(snapshot.timeouts, 0);
    }

    #[test]
    fn test_oversized_datagram_is_discarded() {
        let (receiver, tx, frames, stats) = receiver(short_timeout());

        tx.send(&[0u8; 32]).unwrap();
        receiver.on_readable();

        assert!(frames.try_recv().is_err());
        assert_eq!(stats.snapshot().discarded, 1);
    }

    #[test]
    fn test_three_timeouts_counted() {
        let (receiver, _tx, _frames, stats) = receiver(short_timeout());

        receiver.on_readable();
        receiver.on_readable();
        receiver.on_readable();

        assert_eq!(stats.timeouts(), 3);
        assert_eq!(stats.snapshot().dropped_messages, 3);
        assert_eq!(receiver.current_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_deadline_counts_silence_without_reads() {
        let (receiver, _tx, _frames, stats) = receiver(short_timeout());
        let start = Instant::now() + Duration::from_millis(40);

        assert!(receiver.check_deadline(start));
        assert_eq!(stats.timeouts(), 1);
        assert_eq!(receiver.current_timeout(), Duration::from_millis(20));

        // The next deadline runs from the counted timeout with the tightened value
        assert!(!receiver.check_deadline(start + Duration::from_millis(19)));
        assert_eq!(
            receiver.time_to_deadline(start + Duration::from_millis(15)),
            Duration::from_millis(5)
        );
        assert!(receiver.check_deadline(start + Duration::from_millis(20)));
        assert!(receiver.check_deadline(start + Duration::from_millis(30)));
        assert!(!receiver.check_deadline(start + Duration::from_millis(35)));

        assert_eq!(stats.timeouts(), 3);
        assert_eq!(receiver.current_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_received_frame_pushes_deadline_back() {
        let (receiver, tx, _frames, stats) = receiver(short_timeout());

        tx.send(&Frame::default().encode()).unwrap();
        receiver.on_readable();
        let after_read = Instant::now();

        assert!(!receiver.check_deadline(after_read));
        assert!(receiver.time_to_deadline(after_read) > Duration::ZERO);
        assert!(receiver.check_deadline(after_read + Duration::from_millis(40)));
        assert_eq!(stats.timeouts(), 1);
    }

    #[test]
    fn test_frame_after_timeout_restores_base() {
        let (receiver, tx, _frames, _stats) = receiver(short_timeout());

        receiver.on_readable();
        assert_eq!(receiver.current_timeout(), Duration::from_millis(20));

        tx.send(&Frame::default().encode()).unwrap();
        receiver.on_readable();
        assert_eq!(receiver.current_timeout(), Duration::from_millis(40));
        assert_eq!(
            receiver.socket().read_timeout().unwrap(),
            Some(Duration::from_millis(40))
        );
    }
}
