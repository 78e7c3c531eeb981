//! The engine context: connection ownership, the engine thread's event
//! loop, and cross-thread marshalling.
//!
//! A [`Base`] owns every [`Connection`] registered with it, keyed by
//! [`ConnId`]. All protocol work happens on the thread that drives the
//! base — the engine thread — by calling [`Base::service`] (one batch) or
//! [`Base::service_blocking`] (until quit).
//!
//! Transport glue and other threads talk to the engine through messages:
//! a [`Mailbox`] delivers `(ConnId, TransportEvent)` envelopes, and a
//! [`RemoteHandle`] exposes the operations that are safe to call from any
//! thread — sending a message and requesting a close. Both enqueue onto
//! the same channel the engine thread drains, so the engine state itself
//! is never shared between threads.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::conn::{Connection, Handler, TransportEvent};

/// Identifies a connection within its [`Base`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

enum Envelope {
    Event(ConnId, TransportEvent),
    SendMsg {
        id: ConnId,
        payload: Bytes,
        binary: bool,
    },
    Close(ConnId),
    Quit,
}

/// Cloneable sender that marshals transport events onto the engine
/// thread.
///
/// In external-loop setups the reactor thread holds a mailbox and posts
/// each socket/timer event here instead of touching engine state; the
/// engine thread picks them up in `service`.
#[derive(Clone)]
pub struct Mailbox {
    tx: Sender<Envelope>,
}

impl Mailbox {
    /// Posts a transport event for `id`. Silently dropped when the engine
    /// is gone.
    pub fn post(&self, id: ConnId, event: TransportEvent) {
        let _ = self.tx.send(Envelope::Event(id, event));
    }

    /// Asks the engine thread to stop `service_blocking`.
    pub fn quit(&self) {
        let _ = self.tx.send(Envelope::Quit);
    }
}

/// Thread-safe operations on one connection.
///
/// The calls enqueue onto the engine thread and run there; results are
/// reported through the connection's handler as usual.
#[derive(Clone)]
pub struct RemoteHandle {
    id: ConnId,
    tx: Sender<Envelope>,
}

impl RemoteHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Sends a text message from any thread.
    pub fn send_msg(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(Envelope::SendMsg {
                id: self.id,
                payload: Bytes::from(text.into()),
                binary: false,
            })
            .is_ok()
    }

    /// Sends a message from any thread.
    pub fn send_msg_ex(&self, payload: impl Into<Bytes>, binary: bool) -> bool {
        self.tx
            .send(Envelope::SendMsg {
                id: self.id,
                payload: payload.into(),
                binary,
            })
            .is_ok()
    }

    /// Requests a clean close from any thread.
    pub fn close(&self) -> bool {
        self.tx.send(Envelope::Close(self.id)).is_ok()
    }
}

struct Entry {
    conn: Connection,
    handler: Box<dyn Handler>,
}

/// Owns connections and runs the engine thread's loop.
pub struct Base {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    entries: HashMap<ConnId, Entry>,
    next_id: u64,
    quit: bool,
    quit_at: Option<Instant>,
}

impl Base {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            entries: HashMap::new(),
            next_id: 1,
            quit: false,
            quit_at: None,
        }
    }

    /// The mailbox transport glue posts events through.
    pub fn mailbox(&self) -> Mailbox {
        Mailbox {
            tx: self.tx.clone(),
        }
    }

    /// Takes ownership of a connection and its handler, returning the id
    /// used to address events at it.
    pub fn register(&mut self, conn: Connection, handler: Box<dyn Handler>) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry { conn, handler });
        tracing::debug!(%id, "connection registered");
        id
    }

    /// Removes a connection, returning it. Typically done once the
    /// connection reached `Closed`.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let entry = self.entries.remove(&id);
        if entry.is_some() {
            tracing::debug!(%id, "connection removed");
        }
        entry.map(|e| e.conn)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.entries.get(&id).map(|e| &e.conn)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.entries.get_mut(&id).map(|e| &mut e.conn)
    }

    /// A thread-safe handle for one connection.
    pub fn remote(&self, id: ConnId) -> RemoteHandle {
        RemoteHandle {
            id,
            tx: self.tx.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops `service_blocking` at its next iteration.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Stops `service_blocking` once `delay` has elapsed.
    pub fn quit_delay(&mut self, delay: Duration) {
        self.quit_at = Some(Instant::now() + delay);
    }

    /// Runs one service iteration: drains every envelope currently
    /// queued, dispatching each to its connection. Returns how many were
    /// handled.
    pub fn service(&mut self) -> usize {
        self.check_deadline();
        let mut handled = 0;
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    self.dispatch(envelope);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Services envelopes until [`quit`](Self::quit) is called, a
    /// [`Mailbox::quit`] arrives, or a [`quit_delay`](Self::quit_delay)
    /// deadline passes.
    pub fn service_blocking(&mut self) {
        while !self.quit {
            let envelope = match self.quit_at {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(envelope) => envelope,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };
            self.dispatch(envelope);
        }
        self.quit = false;
    }

    fn check_deadline(&mut self) {
        if let Some(deadline) = self.quit_at {
            if Instant::now() >= deadline {
                self.quit = true;
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Event(id, event) => match self.entries.get_mut(&id) {
                Some(entry) => entry.conn.handle_event(entry.handler.as_mut(), event),
                None => tracing::debug!(%id, "event for unknown connection"),
            },
            Envelope::SendMsg {
                id,
                payload,
                binary,
            } => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    if let Err(err) = entry.conn.send_msg_ex(payload, binary) {
                        tracing::warn!(%id, error = %err, "marshalled send failed");
                    }
                }
            }
            Envelope::Close(id) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    if let Err(err) = entry.conn.close() {
                        tracing::warn!(%id, error = %err, "marshalled close failed");
                    }
                }
            }
            Envelope::Quit => self.quit = true,
        }
    }
}

impl Default for Base {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Options, TlsMode};
    use crate::conn::{TimerKind, Transport};
    use bytes::BytesMut;
    use std::io;

    /// A transport that swallows everything; enough to exercise the base
    /// plumbing without a protocol round-trip.
    struct NullTransport;

    impl Transport for NullTransport {
        fn connect(&mut self, _host: &str, _port: u16, _tls: TlsMode) -> io::Result<()> {
            Ok(())
        }
        fn read_available(&mut self, _buf: &mut BytesMut, _max: usize) -> io::Result<usize> {
            Ok(0)
        }
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }
        fn close(&mut self) {}
        fn set_timer(&mut self, _kind: TimerKind, _after: Duration) {}
        fn cancel_timer(&mut self, _kind: TimerKind) {}
        fn now(&self) -> Instant {
            Instant::now()
        }
    }

    struct NullHandler;
    impl Handler for NullHandler {}

    fn connection() -> Connection {
        Connection::new(Box::new(NullTransport), Options::default())
    }

    #[test]
    fn register_and_remove() {
        let mut base = Base::new();
        let id = base.register(connection(), Box::new(NullHandler));
        assert_eq!(base.len(), 1);
        assert!(base.connection(id).is_some());
        assert!(base.remove(id).is_some());
        assert!(base.is_empty());
        assert!(base.remove(id).is_none());
    }

    #[test]
    fn ids_are_unique() {
        let mut base = Base::new();
        let a = base.register(connection(), Box::new(NullHandler));
        let b = base.register(connection(), Box::new(NullHandler));
        assert_ne!(a, b);
    }

    #[test]
    fn service_drains_queued_envelopes() {
        let mut base = Base::new();
        let id = base.register(connection(), Box::new(NullHandler));
        let mailbox = base.mailbox();

        mailbox.post(id, TransportEvent::Writable);
        mailbox.post(id, TransportEvent::Writable);
        assert_eq!(base.service(), 2);
        assert_eq!(base.service(), 0);
    }

    #[test]
    fn events_for_unknown_connections_are_dropped() {
        let mut base = Base::new();
        let id = base.register(connection(), Box::new(NullHandler));
        base.remove(id);

        base.mailbox().post(id, TransportEvent::Writable);
        assert_eq!(base.service(), 1);
    }

    #[test]
    fn remote_send_from_another_thread() {
        let mut base = Base::new();
        let id = base.register(connection(), Box::new(NullHandler));
        let remote = base.remote(id);

        let thread = std::thread::spawn(move || {
            assert!(remote.send_msg("hello from afar"));
            assert!(remote.close());
        });
        thread.join().expect("sender thread");

        // Both envelopes run on the engine thread. The connection is idle
        // so the send fails internally, which is fine here; the point is
        // that the marshalling itself works.
        assert_eq!(base.service(), 2);
    }

    #[test]
    fn mailbox_quit_stops_blocking_service() {
        let mut base = Base::new();
        let mailbox = base.mailbox();

        let poker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            mailbox.quit();
        });

        base.service_blocking();
        poker.join().expect("poker thread");
    }

    #[test]
    fn quit_delay_bounds_blocking_service() {
        let mut base = Base::new();
        base.quit_delay(Duration::from_millis(30));

        let started = Instant::now();
        base.service_blocking();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
