//! Readiness reactor
//!
//! A thin layer over `mio` that keeps its own registration table so that
//! handles can be registered, modified and unregistered from any thread
//! while another thread blocks in [`Reactor::poll`].
//!
//! Locking: the registration table mutex is only held around table
//! mutation and lookups; the blocking wait holds a separate poll mutex.
//! Lock order is always poll, then table.
//!
//! `mio` is edge-triggered. After a callback has run, the reactor re-arms
//! the handle so that data still queued on the socket is reported again
//! on the next poll.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{ReactorError, ReactorResult};

pub use mio::Interest;

/// Socket handle as seen by the reactor
pub type Handle = RawFd;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 64;

fn token(handle: Handle) -> Token {
    Token(handle as usize)
}

/// What a handle became ready for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed its side or the socket reported an error
    pub closed: bool,
}

/// A ready handle reported by [`Reactor::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub handle: Handle,
    pub readiness: Readiness,
}

/// Callback invoked when a registered handle becomes ready
///
/// Implementations own whatever per-registration data they need and must
/// handle their own I/O errors; nothing returned from a callback can stop
/// the dispatch loop.
pub trait EventHandler: Send + Sync {
    fn on_ready(&self, handle: Handle, readiness: Readiness);
}

struct Registration {
    interest: Interest,
    handler: Option<Arc<dyn EventHandler>>,
}

struct PollState {
    poll: Poll,
    events: Events,
}

/// Readiness-based dispatcher shared between the control and data-plane threads
pub struct Reactor {
    poll: Mutex<PollState>,
    registry: Registry,
    table: Mutex<HashMap<Handle, Registration>>,
    waker: Waker,
    cancelled: AtomicBool,
}

impl Reactor {
    pub fn new() -> ReactorResult<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            poll: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
            }),
            registry,
            table: Mutex::new(HashMap::new()),
            waker,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Add a handle with its interest set and optional callback
    pub fn register(
        &self,
        handle: Handle,
        interest: Interest,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> ReactorResult<()> {
        let mut table = self.table.lock();
        if table.contains_key(&handle) {
            return Err(ReactorError::DuplicateRegistration(handle));
        }

        self.registry
            .register(&mut SourceFd(&handle), token(handle), interest)?;
        table.insert(handle, Registration { interest, handler });
        debug!(handle, ?interest, "Registered handle");
        Ok(())
    }

    /// Replace the interest and callback of a registered handle
    pub fn modify(
        &self,
        handle: Handle,
        interest: Interest,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> ReactorResult<()> {
        let mut table = self.table.lock();
        let registration = table
            .get_mut(&handle)
            .ok_or(ReactorError::NotRegistered(handle))?;

        self.registry
            .reregister(&mut SourceFd(&handle), token(handle), interest)?;
        registration.interest = interest;
        registration.handler = handler;
        trace!(handle, ?interest, "Modified handle");
        Ok(())
    }

    /// Change the interest of a registered handle, keeping its callback
    pub fn set_interest(&self, handle: Handle, interest: Interest) -> ReactorResult<()> {
        let mut table = self.table.lock();
        let registration = table
            .get_mut(&handle)
            .ok_or(ReactorError::NotRegistered(handle))?;

        self.registry
            .reregister(&mut SourceFd(&handle), token(handle), interest)?;
        registration.interest = interest;
        Ok(())
    }

    /// Remove a handle; a no-op when it is not registered
    pub fn unregister(&self, handle: Handle) {
        let mut table = self.table.lock();
        if table.remove(&handle).is_none() {
            trace!(handle, "Unregister of unknown handle ignored");
            return;
        }

        // The descriptor may already be closed, in which case the kernel
        // has dropped it from the interest list on its own.
        if let Err(e) = self.registry.deregister(&mut SourceFd(&handle)) {
            debug!(handle, error = %e, "Deregister failed");
        }
        debug!(handle, "Unregistered handle");
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.table.lock().contains_key(&handle)
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Wake a thread blocked in [`poll`](Self::poll) without cancelling
    pub fn interrupt(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Failed to wake reactor");
        }
    }

    /// Operator-level abort: any in-progress or future poll returns empty
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    /// Re-enable polling after a cancellation has been handled
    pub fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` (forever when `None`) for ready handles
    ///
    /// Returns an empty set on timeout, interruption or cancellation.
    /// Handles unregistered while the wait was in progress are filtered out.
    pub fn poll(&self, timeout: Option<Duration>) -> ReactorResult<Vec<ReadyEvent>> {
        if self.is_cancelled() {
            return Ok(Vec::new());
        }

        let mut state = self.poll.lock();
        let PollState { poll, events } = &mut *state;

        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        if self.is_cancelled() {
            return Ok(Vec::new());
        }

        let table = self.table.lock();
        let ready = events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| ReadyEvent {
                handle: event.token().0 as Handle,
                readiness: Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_read_closed() || event.is_error(),
                },
            })
            .filter(|event| table.contains_key(&event.handle))
            .collect();

        Ok(ready)
    }

    /// Poll once and invoke the callback of every ready handle
    ///
    /// Returns the number of ready handles.
    pub fn dispatch(&self, timeout: Option<Duration>) -> ReactorResult<usize> {
        let ready = self.poll(timeout)?;
        for event in &ready {
            self.dispatch_event(event);
        }
        Ok(ready.len())
    }

    /// Dispatch until `keep_running` is cleared or the reactor is cancelled
    ///
    /// Sockets are left open on return; closing them is the owner's job.
    pub fn run_loop(&self, timeout: Option<Duration>, keep_running: &AtomicBool) -> ReactorResult<()> {
        while keep_running.load(Ordering::SeqCst) && !self.is_cancelled() {
            self.dispatch(timeout)?;
        }
        debug!(cancelled = self.is_cancelled(), "Reactor loop finished");
        Ok(())
    }

    /// Block until `handle` is ready, dispatching any other ready handles meanwhile
    ///
    /// The callback of `handle` itself is not invoked; the caller performs the
    /// read. Returns `false` when the timeout elapses or the reactor is cancelled.
    pub fn wait_for(&self, handle: Handle, timeout: Option<Duration>) -> ReactorResult<bool> {
        if !self.is_registered(handle) {
            return Err(ReactorError::NotRegistered(handle));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_cancelled() {
                return Ok(false);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let mut found = false;
            for event in self.poll(remaining)? {
                if event.handle == handle {
                    found = true;
                } else {
                    self.dispatch_event(&event);
                }
            }

            if found {
                return Ok(true);
            }
        }
    }

    fn dispatch_event(&self, event: &ReadyEvent) {
        let handler = match self.table.lock().get(&event.handle) {
            Some(registration) => registration.handler.clone(),
            None => return,
        };

        match handler {
            Some(handler) => {
                handler.on_ready(event.handle, event.readiness);
                self.rearm(event.handle);
            }
            None => trace!(handle = event.handle, "Ready handle has no callback"),
        }
    }

    fn rearm(&self, handle: Handle) {
        let table = self.table.lock();
        if let Some(registration) = table.get(&handle) {
            if let Err(e) =
                self.registry
                    .reregister(&mut SourceFd(&handle), token(handle), registration.interest)
            {
                debug!(handle, error = %e, "Re-arm failed");
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered", &self.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Counter(AtomicUsize, UdpSocket);

    impl EventHandler for Counter {
        fn on_ready(&self, _handle: Handle, readiness: Readiness) {
            assert!(readiness.readable);
            let mut buf = [0u8; 64];
            let _ = self.1.recv(&mut buf);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn socket_pair() -> (UdpSocket, UdpSocket) {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.connect(rx.local_addr().unwrap()).unwrap();
        (rx, tx)
    }

    #[test]
    fn test_duplicate_registration_leaves_table_unchanged() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let fd = rx.as_raw_fd();

        reactor.register(fd, Interest::READABLE, None).unwrap();
        let err = reactor
            .register(fd, Interest::WRITABLE, None)
            .unwrap_err();

        assert!(matches!(err, ReactorError::DuplicateRegistration(h) if h == fd));
        assert_eq!(reactor.len(), 1);
        assert_eq!(reactor.table.lock()[&fd].interest, Interest::READABLE);
    }

    #[test]
    fn test_modify_unknown_handle() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();

        let err = reactor
            .modify(rx.as_raw_fd(), Interest::READABLE, None)
            .unwrap_err();
        assert!(matches!(err, ReactorError::NotRegistered(_)));
    }

    #[test]
    fn test_double_unregister_is_noop() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let fd = rx.as_raw_fd();

        reactor.register(fd, Interest::READABLE, None).unwrap();
        reactor.unregister(fd);
        reactor.unregister(fd);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_dispatch_invokes_callback() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let fd = rx.as_raw_fd();
        let counter = Arc::new(Counter(AtomicUsize::new(0), rx));

        reactor
            .register(fd, Interest::READABLE, Some(counter.clone()))
            .unwrap();
        tx.send(b"hello").unwrap();

        let ready = reactor.dispatch(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready, 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_reports_queued_datagrams() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let fd = rx.as_raw_fd();
        let counter = Arc::new(Counter(AtomicUsize::new(0), rx));

        reactor
            .register(fd, Interest::READABLE, Some(counter.clone()))
            .unwrap();
        tx.send(b"one").unwrap();
        tx.send(b"two").unwrap();
        thread::sleep(Duration::from_millis(20));

        // Each callback reads a single datagram
        reactor.dispatch(Some(Duration::from_secs(2))).unwrap();
        reactor.dispatch(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_handle_not_delivered() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let fd = rx.as_raw_fd();

        reactor.register(fd, Interest::READABLE, None).unwrap();
        tx.send(b"x").unwrap();
        reactor.unregister(fd);

        let ready = reactor.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_cancel_interrupts_blocking_poll() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let canceller = reactor.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let ready = reactor.poll(None).unwrap();
        handle.join().unwrap();

        assert!(ready.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(reactor.is_cancelled());

        // Cancelled reactors return immediately until cleared
        assert!(reactor.poll(None).unwrap().is_empty());
    }

    #[test]
    fn test_register_while_other_thread_polls() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let poller = reactor.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::spawn(move || poller.run_loop(None, &flag));
        thread::sleep(Duration::from_millis(20));

        let (rx, _tx) = socket_pair();
        let started = Instant::now();
        reactor
            .register(rx.as_raw_fd(), Interest::READABLE, None)
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        running.store(false, Ordering::SeqCst);
        reactor.interrupt();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let fd = rx.as_raw_fd();
        reactor.register(fd, Interest::READABLE, None).unwrap();

        assert!(!reactor
            .wait_for(fd, Some(Duration::from_millis(20)))
            .unwrap());

        tx.send(b"ready").unwrap();
        assert!(reactor.wait_for(fd, Some(Duration::from_secs(2))).unwrap());
    }
}
