//! Demultiplexing of inbound segments

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    vec::Vec,
};

use as_slice::AsSlice;
use log::{debug, warn};

use crate::{ipv6, sixlowpan::iphc};

use super::{verify_checksum, Connection, Repr, State};

/// The set of open connections
///
/// A segment goes to the connection bound to its remote end, if any; otherwise to a listening
/// connection on its destination port. Connections are dropped from the table once they reach
/// CLOSED, so insert them after `open` or `listen`.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionTable {
    /// Creates an empty table
    pub fn new() -> Self {
        ConnectionTable::default()
    }

    /// Adds a connection
    pub fn insert(&self, connection: Arc<Connection>) {
        self.lock().push(connection);
    }

    /// Removes a connection; returns `false` if it wasn't in the table
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut connections = self.lock();
        let len = connections.len();
        connections.retain(|c| !Arc::ptr_eq(c, connection));
        connections.len() != len
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if the table is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Finds the connection a segment belongs to
    pub fn lookup(&self, ip: &ipv6::Repr, segment: &Repr) -> Option<Arc<Connection>> {
        let connections = self.lock();
        let open = || {
            connections
                .iter()
                .filter(|c| c.state() != State::Closed && c.matches(ip, segment))
        };

        open()
            .find(|c| c.is_connected())
            .or_else(|| open().next())
            .cloned()
    }

    /// Verifies, parses and delivers a TCP segment
    ///
    /// Returns `false` if the segment was dropped
    pub fn dispatch(&self, ip: &ipv6::Repr, segment: &[u8]) -> bool {
        if ip.next_header != ipv6::NextHeader::Tcp {
            return false;
        }

        if !verify_checksum(segment, &ip.source, &ip.destination) {
            warn!("tcp: bad checksum from {}", ip.source);
            return false;
        }

        let (repr, payload) = match Repr::parse(segment) {
            Ok(parsed) => parsed,
            Err(()) => {
                warn!("tcp: malformed segment from {}", ip.source);
                return false;
            }
        };

        let connection = match self.lookup(ip, &repr) {
            Some(connection) => connection,
            None => {
                debug!(
                    "tcp: no connection for [{}]:{}",
                    ip.destination, repr.destination_port
                );
                return false;
            }
        };

        if let Err(e) = connection.receive(ip, &repr, payload) {
            debug!("tcp:{}: {}", repr.destination_port, e);
        }

        if connection.state() == State::Closed {
            self.remove(&connection);
        }

        true
    }

    /// Delivers the TCP segment carried by a decompressed packet
    pub fn dispatch_packet<B>(&self, packet: &iphc::Packet<B>) -> bool
    where
        B: AsSlice<Element = u8>,
    {
        packet.udp().is_none() && self.dispatch(packet.header(), packet.payload())
    }

    /// Drives the timers of every connection and drops the closed ones
    pub fn tick_all(&self) {
        let connections = self.lock().clone();

        for connection in &connections {
            connection.tick();
        }

        self.lock().retain(|c| c.state() != State::Closed);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        vec::Vec,
    };

    use crate::{
        ipv6,
        tcp::{fill_checksum, Config, Connection, Flags, PacketSink, Repr, State, SystemClock},
    };

    use super::ConnectionTable;

    const PORT: u16 = 0xf0b1;

    #[derive(Default)]
    struct Sink(Mutex<Vec<Repr>>);

    impl PacketSink for Sink {
        fn send_packet(&self, _: &ipv6::Repr, segment: &[u8]) {
            self.0.lock().unwrap().push(Repr::parse(segment).unwrap().0);
        }
    }

    fn addr(last: u8) -> ipv6::Addr {
        ipv6::Addr::link_local([0, 0, 0, 0, 0, 0, 0, last])
    }

    fn ip(source: ipv6::Addr) -> ipv6::Repr {
        ipv6::Repr {
            traffic_class: 0,
            flow_label: 0,
            next_header: ipv6::NextHeader::Tcp,
            hop_limit: 64,
            source,
            destination: addr(1),
        }
    }

    fn segment(ip: &ipv6::Repr, source_port: u16, ack_number: u32, flags: Flags) -> Vec<u8> {
        let mut bytes = [0; 20];
        Repr {
            source_port,
            destination_port: PORT,
            seq_number: 1_000,
            ack_number,
            flags,
            window: 128,
        }
        .emit(&mut bytes);
        fill_checksum(&mut bytes, &ip.source, &ip.destination);
        bytes.to_vec()
    }

    fn connection(sink: &Arc<Sink>) -> Arc<Connection> {
        Arc::new(Connection::new(
            Some(addr(1)),
            PORT,
            Config::default(),
            sink.clone(),
            Arc::new(SystemClock::new()),
        ))
    }

    #[test]
    fn demux() {
        let sink = Arc::new(Sink::default());
        let table = ConnectionTable::new();

        let listener = connection(&sink);
        listener.listen().unwrap();
        table.insert(listener.clone());

        let active = connection(&sink);
        active.open(addr(2), 0xf0b2).unwrap();
        table.insert(active.clone());
        assert_eq!(table.len(), 2);

        // SYN-ACK from the peer of the active connection
        let from2 = ip(addr(2));
        assert!(table.dispatch(&from2, &segment(&from2, 0xf0b2, 1, Flags::SYN | Flags::ACK)));
        assert_eq!(active.state(), State::Established);
        assert_eq!(listener.state(), State::Listen);

        // a new peer goes to the listener
        let from3 = ip(addr(3));
        assert!(table.dispatch(&from3, &segment(&from3, 0xf0b3, 0, Flags::SYN)));
        assert_eq!(listener.state(), State::SynReceived);

        // corrupted
        let mut bytes = segment(&from3, 0xf0b3, 1, Flags::ACK);
        bytes[4] ^= 1;
        assert!(!table.dispatch(&from3, &bytes));

        // nobody listens on that port
        let mut bytes = [0; 20];
        Repr {
            source_port: 1,
            destination_port: 2,
            seq_number: 0,
            ack_number: 0,
            flags: Flags::SYN,
            window: 0,
        }
        .emit(&mut bytes);
        fill_checksum(&mut bytes, &from3.source, &from3.destination);
        assert!(!table.dispatch(&from3, &bytes));

        assert!(table.remove(&active));
        assert!(!table.remove(&active));
        assert_eq!(table.len(), 1);
        table.tick_all();
    }

    #[test]
    fn closed_connections() {
        let sink = Arc::new(Sink::default());
        let table = ConnectionTable::new();
        let from2 = ip(addr(2));

        let old = connection(&sink);
        old.listen().unwrap();
        table.insert(old.clone());

        assert!(table.dispatch(&from2, &segment(&from2, 0xf0b2, 0, Flags::SYN)));
        assert_eq!(old.state(), State::SynReceived);

        // still bound to addr(2):0xf0b2 but closed
        old.reset();
        assert_eq!(old.state(), State::Closed);

        let fresh = connection(&sink);
        fresh.listen().unwrap();
        table.insert(fresh.clone());

        // the same peer tries again
        assert!(table.dispatch(&from2, &segment(&from2, 0xf0b2, 0, Flags::SYN)));
        assert_eq!(fresh.state(), State::SynReceived);

        table.tick_all();
        assert_eq!(table.len(), 1);

        // closed by the peer: dropped right away
        let mut rst = [0; 20];
        Repr {
            source_port: 0xf0b2,
            destination_port: PORT,
            seq_number: 1_001,
            ack_number: 0,
            flags: Flags::RST,
            window: 0,
        }
        .emit(&mut rst);
        fill_checksum(&mut rst, &from2.source, &from2.destination);
        assert!(table.dispatch(&from2, &rst));
        assert_eq!(fresh.state(), State::Closed);
        assert!(table.is_empty());
    }
}
