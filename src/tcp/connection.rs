//! Blocking connections

use core::time::Duration;
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time,
};

use log::debug;

use crate::ipv6;

use super::{ring::CAPACITY, Config, Error, Instant, PacketSink, Repr, State, Tcb};

/// Application callbacks
///
/// Callbacks run on the thread that fed the segment (or called `tick` / `close`) with the
/// connection unlocked, so they may call back into the connection.
pub trait Listener: Send + Sync {
    /// The handshake completed
    fn new_connection(&self, _connection: &Connection) {}

    /// In-order data arrived
    fn data_received(&self, connection: &Connection, data: &[u8]);

    /// The connection reached the CLOSED state
    fn connection_closed(&self, _connection: &Connection) {}
}

/// Source of timestamps for the connection timers
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Instant;
}

/// Milliseconds since the clock was created
pub struct SystemClock {
    origin: time::Instant,
}

impl SystemClock {
    /// Starts a new clock
    pub fn new() -> Self {
        SystemClock {
            origin: time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.origin.elapsed();
        Instant::from_millis(elapsed.as_secs() * 1_000 + u64::from(elapsed.subsec_millis()))
    }
}

/// A `Tcb` that can be shared between threads
///
/// `send` blocks until the send buffer has room for the data. Outgoing segments are handed to the
/// `PacketSink` with the connection locked: the sink must not call back into the connection.
pub struct Connection {
    tcb: Mutex<Tcb>,
    /// Signaled whenever buffer space may have been freed or the state changed
    space: Condvar,
    sink: Arc<dyn PacketSink + Send + Sync>,
    listener: Option<Arc<dyn Listener>>,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Creates a closed connection
    pub fn new(
        local_addr: Option<ipv6::Addr>,
        local_port: u16,
        config: Config,
        sink: Arc<dyn PacketSink + Send + Sync>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Connection {
            tcb: Mutex::new(Tcb::new(local_addr, local_port, config)),
            space: Condvar::new(),
            sink,
            listener: None,
            clock,
        }
    }

    /// Registers the application callbacks
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Current state
    pub fn state(&self) -> State {
        self.lock().state()
    }

    /// Local port
    pub fn local_port(&self) -> u16 {
        self.lock().local_port()
    }

    /// Number of sent but unacknowledged bytes
    pub fn buffered(&self) -> usize {
        self.lock().buffered()
    }

    /// See [`Tcb::matches`]
    pub fn matches(&self, ip: &ipv6::Repr, segment: &Repr) -> bool {
        self.lock().matches(ip, segment)
    }

    /// See [`Tcb::is_connected`]
    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    /// Active open
    pub fn open(&self, remote_addr: ipv6::Addr, remote_port: u16) -> Result<(), Error> {
        let now = self.clock.now();
        self.lock().open(remote_addr, remote_port, now, &*self.sink)
    }

    /// Passive open
    pub fn listen(&self) -> Result<(), Error> {
        self.lock().listen()
    }

    /// Sends `data`, blocking for at most `Config.send_timeout`
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let timeout = self.lock().config().send_timeout;
        self.send_timeout(data, timeout)
    }

    /// Sends `data`, blocking until the send buffer has room for it
    ///
    /// Data larger than the send buffer is split into buffer sized segments. On error the
    /// segments that already went out stay queued. `timeout = None` waits forever
    pub fn send_timeout(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| time::Instant::now() + timeout);

        let mut tcb = self.lock();
        for chunk in data.chunks(CAPACITY) {
            loop {
                let now = self.clock.now();
                match tcb.send(chunk, now, &*self.sink) {
                    Ok(()) => break,
                    Err(Error::BufferFull) => {}
                    Err(e) => return Err(e),
                }

                tcb = match deadline {
                    None => self
                        .space
                        .wait(tcb)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(deadline) => {
                        let now = time::Instant::now();
                        if now >= deadline {
                            debug!("tcp:{}: send timed out", tcb.local_port());
                            return Err(Error::TimedOut);
                        }

                        self.space
                            .wait_timeout(tcb, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
            }
        }

        Ok(())
    }

    /// Feeds an inbound segment to the connection
    ///
    /// Returns `Err(UnexpectedAck)` if the segment acknowledged data that was never sent. The rest
    /// of the segment is processed regardless
    pub fn receive(&self, ip: &ipv6::Repr, segment: &Repr, payload: &[u8]) -> Result<(), Error> {
        let now = self.clock.now();
        let (before, after, outcome) = {
            let mut tcb = self.lock();
            let before = tcb.state();
            let outcome = tcb.receive(now, ip, segment, payload, &*self.sink);
            (before, tcb.state(), outcome)
        };

        self.space.notify_all();
        self.notify(before, after, outcome.data);

        if outcome.unexpected_ack {
            Err(Error::UnexpectedAck)
        } else {
            Ok(())
        }
    }

    /// Drives the retransmission and TIME-WAIT timers
    pub fn tick(&self) {
        let now = self.clock.now();
        self.transition(|tcb, sink| tcb.tick(now, sink));
    }

    /// Closes our side once the queued data has been acknowledged
    pub fn close(&self) {
        let now = self.clock.now();
        self.transition(|tcb, sink| tcb.close(now, sink));
    }

    /// Aborts the connection
    pub fn reset(&self) {
        let now = self.clock.now();
        self.transition(|tcb, sink| tcb.reset(now, sink));
    }

    fn transition<F>(&self, f: F)
    where
        F: FnOnce(&mut Tcb, &(dyn PacketSink + Send + Sync)),
    {
        let (before, after) = {
            let mut tcb = self.lock();
            let before = tcb.state();
            f(&mut *tcb, &*self.sink);
            (before, tcb.state())
        };

        self.space.notify_all();
        self.notify(before, after, None);
    }

    fn notify(&self, before: State, after: State, data: Option<&[u8]>) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };

        if !before.is_synchronized() && after.is_synchronized() {
            listener.new_connection(self);
        }

        if let Some(data) = data {
            listener.data_received(self, data);
        }

        if before != State::Closed && after == State::Closed {
            listener.connection_closed(self);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
