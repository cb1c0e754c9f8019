//! Transmission control block: the per-connection state machine

use log::{debug, trace, warn};

use crate::ipv6;

use super::{
    fill_checksum,
    ring::{Ring, CAPACITY},
    seq_le, Config, Error, Flags, Instant, PacketSink, Repr, HEADER_SIZE,
};

/// Connection state (RFC 793 Section 3.2)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// No connection
    Closed,
    /// Waiting for a SYN
    Listen,
    /// SYN sent, waiting for SYN-ACK
    SynSent,
    /// SYN received and answered, waiting for the ACK
    SynReceived,
    /// Data flows both ways
    Established,
    /// The peer closed its side
    CloseWait,
    /// Both sides closed, our FIN is not acknowledged yet
    LastAck,
    /// We closed our side, our FIN is not acknowledged yet
    FinWait1,
    /// We closed our side and the peer acknowledged it
    FinWait2,
    /// Both sides closed at the same time, our FIN is not acknowledged yet
    Closing,
    /// Lingering to acknowledge retransmitted FINs
    TimeWait,
}

impl State {
    /// Returns `true` once both ends have exchanged sequence numbers
    pub fn is_synchronized(self) -> bool {
        match self {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }

    // our FIN is in flight
    fn fin_unacked(self) -> bool {
        match self {
            State::FinWait1 | State::Closing | State::LastAck => true,
            _ => false,
        }
    }
}

/// What an inbound segment produced
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Outcome<'a> {
    /// In-order data for the application
    pub data: Option<&'a [u8]>,
    /// The segment acknowledged data that was never sent; it was otherwise processed
    pub unexpected_ack: bool,
}

/// Transmission control block
///
/// Sequence number bookkeeping follows RFC 793: `SND.UNA` is the oldest unacknowledged sequence
/// number, `SND.NXT` the next one to send and `RCV.NXT` the next one expected from the peer. The
/// bytes in `SND.UNA..SND.NXT` (minus a SYN or FIN) are kept in the ring until acknowledged.
pub struct Tcb {
    config: Config,
    state: State,

    /// Address this block was created with; `None` accepts any
    bind_addr: Option<ipv6::Addr>,
    local_addr: Option<ipv6::Addr>,
    local_port: u16,
    remote_addr: Option<ipv6::Addr>,
    remote_port: Option<u16>,

    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,

    ring: Ring,
    /// `close` was called while there was unacknowledged data
    closing: bool,
    /// Last time a segment that occupies sequence space was sent or acknowledged
    last_send: Instant,
    time_wait_since: Instant,
}

impl Tcb {
    /// Creates a closed connection bound to `local_port`
    ///
    /// With `local_addr = None` a passive open takes the address the peer sent its SYN to
    pub fn new(local_addr: Option<ipv6::Addr>, local_port: u16, config: Config) -> Self {
        Tcb {
            config,
            state: State::Closed,
            bind_addr: local_addr,
            local_addr,
            local_port,
            remote_addr: None,
            remote_port: None,
            snd_una: config.initial_sequence,
            snd_nxt: config.initial_sequence,
            snd_wnd: 0,
            rcv_nxt: 0,
            ring: Ring::new(),
            closing: false,
            last_send: Instant::default(),
            time_wait_since: Instant::default(),
        }
    }

    /* Accessors */
    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// The configuration this block was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local address, if bound
    pub fn local_addr(&self) -> Option<ipv6::Addr> {
        self.local_addr
    }

    /// Local port
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote address, if bound
    pub fn remote_addr(&self) -> Option<ipv6::Addr> {
        self.remote_addr
    }

    /// Remote port, if bound
    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    /// `SND.UNA`
    pub fn send_unacked(&self) -> u32 {
        self.snd_una
    }

    /// `SND.NXT`
    pub fn send_next(&self) -> u32 {
        self.snd_nxt
    }

    /// `RCV.NXT`
    pub fn receive_next(&self) -> u32 {
        self.rcv_nxt
    }

    /// The window last advertised by the peer
    pub fn send_window(&self) -> u16 {
        self.snd_wnd
    }

    /// Number of sent but unacknowledged data bytes
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Free space in the send buffer
    pub fn free(&self) -> usize {
        self.ring.window()
    }

    /// Returns `true` if the segment belongs to this connection
    ///
    /// Unbound addresses and ports act as wildcards
    pub fn matches(&self, ip: &ipv6::Repr, segment: &Repr) -> bool {
        segment.destination_port == self.local_port
            && self.remote_port.map_or(true, |port| port == segment.source_port)
            && self.local_addr.map_or(true, |addr| addr == ip.destination)
            && self.remote_addr.map_or(true, |addr| addr == ip.source)
    }

    /// Returns `true` if the remote end is bound, i.e. `matches` only accepts one peer
    pub fn is_connected(&self) -> bool {
        self.remote_addr.is_some() && self.remote_port.is_some()
    }

    /* Application calls */
    /// Active open: sends a SYN to `remote_addr`
    pub fn open<S>(
        &mut self,
        remote_addr: ipv6::Addr,
        remote_port: u16,
        now: Instant,
        sink: &S,
    ) -> Result<(), Error>
    where
        S: PacketSink + ?Sized,
    {
        if self.state != State::Closed {
            return Err(Error::InvalidState);
        }

        if self.bind_addr.is_none() {
            return Err(Error::Unaddressable);
        }

        self.local_addr = self.bind_addr;
        self.remote_addr = Some(remote_addr);
        self.remote_port = Some(remote_port);
        self.restart();
        self.set_state(State::SynSent);

        self.transmit(sink, now, self.snd_nxt, Flags::SYN, 0);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);

        Ok(())
    }

    /// Passive open: waits for a SYN from any peer
    pub fn listen(&mut self) -> Result<(), Error> {
        if self.state != State::Closed {
            return Err(Error::InvalidState);
        }

        self.local_addr = self.bind_addr;
        self.remote_addr = None;
        self.remote_port = None;
        self.restart();
        self.set_state(State::Listen);

        Ok(())
    }

    /// Queues `data` and sends it right away as a single segment
    ///
    /// Fails with `BufferFull` if the ring doesn't have room for all of `data` or the handshake is
    /// not complete; nothing is queued in that case
    pub fn send<S>(&mut self, data: &[u8], now: Instant, sink: &S) -> Result<(), Error>
    where
        S: PacketSink + ?Sized,
    {
        if self.closing {
            return Err(Error::ConnectionClosed);
        }

        match self.state {
            State::Established | State::CloseWait => {}
            State::Listen | State::SynSent | State::SynReceived => return Err(Error::BufferFull),
            _ => return Err(Error::ConnectionClosed),
        }

        if data.is_empty() {
            return Ok(());
        }

        self.ring.enqueue(data)?;

        let seq = self.snd_nxt;
        self.snd_nxt = seq.wrapping_add(data.len() as u32);
        self.transmit(sink, now, seq, Flags::ACK | Flags::PSH, data.len());

        Ok(())
    }

    /// Closes our side of the connection
    ///
    /// The FIN goes out once all the queued data has been acknowledged
    pub fn close<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        match self.state {
            State::Listen | State::SynSent => self.abort(),
            State::SynReceived | State::Established | State::CloseWait => {
                self.closing = true;
                self.maybe_send_fin(now, sink);
            }
            // closed or already closing
            _ => {}
        }
    }

    /// Aborts the connection, sending a RST if the peer knows about it
    pub fn reset<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        match self.state {
            State::Closed | State::Listen => {}
            _ => self.transmit(sink, now, self.snd_nxt, Flags::RST, 0),
        }

        self.abort();
    }

    /* Network calls */
    /// Processes an inbound segment that `matches` this connection
    pub fn receive<'a, S>(
        &mut self,
        now: Instant,
        ip: &ipv6::Repr,
        segment: &Repr,
        payload: &'a [u8],
        sink: &S,
    ) -> Outcome<'a>
    where
        S: PacketSink + ?Sized,
    {
        let mut outcome = Outcome::default();

        trace!(
            "tcp:{}: rx {:?} seq={} ack={} len={}",
            self.local_port,
            segment.flags,
            segment.seq_number,
            segment.ack_number,
            payload.len()
        );

        match self.state {
            State::Closed => return outcome,
            State::Listen => {
                self.on_listen(now, ip, segment, sink);
                return outcome;
            }
            State::SynSent => {
                self.on_syn_sent(now, segment, sink, &mut outcome);
                return outcome;
            }
            _ => {}
        }

        if segment.flags.contains(Flags::RST) {
            if segment.seq_number == self.rcv_nxt {
                debug!("tcp:{}: reset by peer", self.local_port);
                self.abort();
            }

            return outcome;
        }

        if segment.flags.contains(Flags::SYN) {
            if self.state == State::SynReceived {
                // our SYN-ACK was lost
                self.transmit(sink, now, self.snd_una, Flags::SYN | Flags::ACK, 0);
            } else {
                self.send_ack(now, sink);
            }

            return outcome;
        }

        if segment.flags.contains(Flags::ACK) {
            self.on_ack(now, segment, payload, sink, &mut outcome);
        }

        match self.state {
            State::Closed | State::SynReceived => return outcome,
            _ => {}
        }

        let len = segment.segment_len(payload.len());
        if segment.seq_number != self.rcv_nxt {
            // no reordering: tell the peer where we are and let it retransmit
            trace!(
                "tcp:{}: out of order: seq={} RCV.NXT={}",
                self.local_port,
                segment.seq_number,
                self.rcv_nxt
            );
            self.send_ack(now, sink);
            return outcome;
        }

        if len == 0 {
            return outcome;
        }

        match self.state {
            State::Established | State::FinWait1 | State::FinWait2 => {}
            // the peer already sent its FIN
            _ => {
                self.send_ack(now, sink);
                return outcome;
            }
        }

        self.rcv_nxt = self.rcv_nxt.wrapping_add(len);

        if !payload.is_empty() {
            outcome.data = Some(payload);
        }

        if segment.flags.contains(Flags::FIN) {
            match self.state {
                State::Established => self.set_state(State::CloseWait),
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => self.enter_time_wait(now),
                _ => {}
            }
        }

        self.send_ack(now, sink);

        outcome
    }

    /// Drives the timers: retransmission and TIME-WAIT
    pub fn tick<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        match self.state {
            State::Closed | State::Listen => return,
            State::TimeWait => {
                if now - self.time_wait_since >= self.config.time_wait {
                    self.abort();
                }

                return;
            }
            _ => {}
        }

        if self.snd_una == self.snd_nxt
            || now - self.last_send < self.config.retransmission_interval
        {
            return;
        }

        debug!(
            "tcp:{}: retransmission timeout, SND.UNA={}",
            self.local_port, self.snd_una
        );
        self.retransmit(now, sink);
    }

    /* Private */
    fn on_listen<S>(&mut self, now: Instant, ip: &ipv6::Repr, segment: &Repr, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        if !segment.flags.contains(Flags::SYN)
            || segment.flags.contains(Flags::ACK)
            || segment.flags.contains(Flags::RST)
        {
            return;
        }

        if self.local_addr.is_none() {
            self.local_addr = Some(ip.destination);
        }
        self.remote_addr = Some(ip.source);
        self.remote_port = Some(segment.source_port);
        self.rcv_nxt = segment.seq_number.wrapping_add(1);
        self.snd_wnd = segment.window;
        self.set_state(State::SynReceived);

        self.transmit(sink, now, self.snd_nxt, Flags::SYN | Flags::ACK, 0);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
    }

    fn on_syn_sent<S>(&mut self, now: Instant, segment: &Repr, sink: &S, outcome: &mut Outcome<'_>)
    where
        S: PacketSink + ?Sized,
    {
        let has_ack = segment.flags.contains(Flags::ACK);
        if has_ack && segment.ack_number != self.snd_nxt {
            warn!(
                "tcp:{}: unexpected ACK {} in SYN-SENT",
                self.local_port, segment.ack_number
            );
            outcome.unexpected_ack = true;
            return;
        }

        if segment.flags.contains(Flags::RST) {
            if has_ack {
                debug!("tcp:{}: connection refused", self.local_port);
                self.abort();
            }

            return;
        }

        if !segment.flags.contains(Flags::SYN) {
            return;
        }

        self.rcv_nxt = segment.seq_number.wrapping_add(1);
        self.snd_wnd = segment.window;

        if has_ack {
            self.snd_una = segment.ack_number;
            self.set_state(State::Established);
            self.send_ack(now, sink);
        } else {
            // simultaneous open
            self.set_state(State::SynReceived);
            self.transmit(sink, now, self.snd_una, Flags::SYN | Flags::ACK, 0);
        }
    }

    fn on_ack<S>(
        &mut self,
        now: Instant,
        segment: &Repr,
        payload: &[u8],
        sink: &S,
        outcome: &mut Outcome<'_>,
    ) where
        S: PacketSink + ?Sized,
    {
        let ack = segment.ack_number;
        self.snd_wnd = segment.window;

        if self.state == State::SynReceived {
            if ack == self.snd_nxt {
                self.snd_una = ack;
                self.set_state(State::Established);
                self.maybe_send_fin(now, sink);
            } else {
                warn!(
                    "tcp:{}: unexpected ACK {} in SYN-RECEIVED",
                    self.local_port, ack
                );
                outcome.unexpected_ack = true;
            }

            return;
        }

        if !(seq_le(self.snd_una, ack) && seq_le(ack, self.snd_nxt)) {
            warn!(
                "tcp:{}: unexpected ACK {}, SND.UNA={} SND.NXT={}",
                self.local_port, ack, self.snd_una, self.snd_nxt
            );
            outcome.unexpected_ack = true;
            return;
        }

        let acked = ack.wrapping_sub(self.snd_una) as usize;
        if acked == 0 {
            // SYN and RST never get this far
            let bare = payload.is_empty() && !segment.flags.contains(Flags::FIN);
            if bare && !self.ring.is_empty() {
                debug!("tcp:{}: duplicate ACK {}", self.local_port, ack);
                self.retransmit(now, sink);
            }

            return;
        }

        let fin_acked = self.state.fin_unacked() && ack == self.snd_nxt;
        self.ring.release(acked - fin_acked as usize);
        self.snd_una = ack;
        self.last_send = now;

        if fin_acked {
            match self.state {
                State::FinWait1 => self.set_state(State::FinWait2),
                State::Closing => self.enter_time_wait(now),
                State::LastAck => self.abort(),
                _ => {}
            }
        }

        self.maybe_send_fin(now, sink);
    }

    fn maybe_send_fin<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        if !self.closing || !self.ring.is_empty() {
            return;
        }

        let next = match self.state {
            State::Established => State::FinWait1,
            State::CloseWait => State::LastAck,
            _ => return,
        };

        self.set_state(next);

        let seq = self.snd_nxt;
        self.snd_nxt = seq.wrapping_add(1);
        self.transmit(sink, now, seq, Flags::FIN | Flags::ACK, 0);
    }

    fn retransmit<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        match self.state {
            State::SynSent => self.transmit(sink, now, self.snd_una, Flags::SYN, 0),
            State::SynReceived => {
                self.transmit(sink, now, self.snd_una, Flags::SYN | Flags::ACK, 0)
            }
            State::FinWait1 | State::Closing | State::LastAck => {
                let seq = self.snd_nxt.wrapping_sub(1);
                self.transmit(sink, now, seq, Flags::FIN | Flags::ACK, 0)
            }
            _ => {
                let len = self.ring.len().min(self.config.max_segment_size);
                if len != 0 {
                    self.transmit(sink, now, self.snd_una, Flags::ACK | Flags::PSH, len)
                }
            }
        }
    }

    fn send_ack<S>(&mut self, now: Instant, sink: &S)
    where
        S: PacketSink + ?Sized,
    {
        self.transmit(sink, now, self.snd_nxt, Flags::ACK, 0)
    }

    // sends `len` bytes from the ring, starting at sequence number `seq`
    fn transmit<S>(&mut self, sink: &S, now: Instant, seq: u32, flags: Flags, len: usize)
    where
        S: PacketSink + ?Sized,
    {
        let (source, destination, port) = match (self.local_addr, self.remote_addr, self.remote_port)
        {
            (Some(source), Some(destination), Some(port)) => (source, destination, port),
            _ => {
                warn!("tcp:{}: unbound, dropped {:?}", self.local_port, flags);
                return;
            }
        };

        let repr = Repr {
            source_port: self.local_port,
            destination_port: port,
            seq_number: seq,
            ack_number: if flags.contains(Flags::ACK) {
                self.rcv_nxt
            } else {
                0
            },
            flags,
            window: self.config.window,
        };

        const HEADER: usize = HEADER_SIZE as usize;
        let mut segment = [0; HEADER + CAPACITY];
        let offset = seq.wrapping_sub(self.snd_una) as usize;
        let n = self
            .ring
            .peek(offset, &mut segment[HEADER..HEADER + len.min(CAPACITY)]);

        let segment = &mut segment[..HEADER + n];
        repr.emit(segment);
        fill_checksum(segment, &source, &destination);

        let header = ipv6::Repr {
            traffic_class: 0,
            flow_label: 0,
            next_header: ipv6::NextHeader::Tcp,
            hop_limit: self.config.hop_limit,
            source,
            destination,
        };

        trace!(
            "tcp:{}: tx {:?} seq={} ack={} len={}",
            self.local_port,
            flags,
            seq,
            repr.ack_number,
            n
        );
        sink.send_packet(&header, segment);

        if repr.segment_len(n) != 0 {
            self.last_send = now;
        }
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.time_wait_since = now;
        self.set_state(State::TimeWait);
    }

    // fresh sequence space for a new connection
    fn restart(&mut self) {
        self.snd_una = self.config.initial_sequence;
        self.snd_nxt = self.config.initial_sequence;
        self.rcv_nxt = 0;
        self.ring.clear();
        self.closing = false;
    }

    fn abort(&mut self) {
        self.set_state(State::Closed);
        self.ring.clear();
        self.closing = false;
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!("tcp:{}: {:?} -> {:?}", self.local_port, self.state, state);
            self.state = state;
        }
    }
}
