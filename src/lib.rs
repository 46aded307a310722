//! TCP (RFC 793) in userspace, on top of raw IPv4 datagrams.
//!
//! The [`ConnectionTable`] takes the TCP payload of inbound IPv4 datagrams
//! and returns the datagrams to transmit in reply. Moving bytes to and from
//! the wire is left to the caller; see `main.rs` for a tun device transport.

use log::{debug, info, trace};
use std::collections::{HashMap, VecDeque, hash_map::Entry};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub mod config;
pub mod error;
pub mod isn;
#[cfg(feature = "options")]
pub mod options;
pub mod segment;
pub mod seq;
pub mod tcb;
pub mod tcp;

pub use config::Config;
pub use error::{Error, Result};
pub use tcb::State;

use isn::IsnGenerator;
use tcp::{Connection, Signals};

/// How many random ports `open_active` tries before giving up.
const EPHEMERAL_ATTEMPTS: usize = 64;

/// Connection identity: both endpoints, as seen from our side.
///
/// A listening endpoint has the unspecified remote `0.0.0.0:0`.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Copy)]
pub struct Quad {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl Quad {
    pub fn listening(local: SocketAddrV4) -> Self {
        Quad {
            local,
            remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.remote.ip().is_unspecified() && self.remote.port() == 0
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// A TCP segment ready to be wrapped in an IPv4 header and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
}

/// Notifications for the owner of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Established(Quad),
    /// New in-order data can be read.
    DataReceived(Quad),
    /// The peer sent its FIN, no more data will arrive.
    PeerClosed(Quad),
    Closed(Quad),
    Reset(Quad),
}

impl Event {
    pub fn quad(&self) -> Quad {
        match *self {
            Event::Established(q)
            | Event::DataReceived(q)
            | Event::PeerClosed(q)
            | Event::Closed(q)
            | Event::Reset(q) => q,
        }
    }
}

type ConnectionHandle = Arc<Mutex<Connection>>;

#[derive(Default)]
struct ConnectionManager {
    connections: HashMap<Quad, ConnectionHandle>,
}

/// All connections of one host.
///
/// The table lock is only held for lookups, inserts and removals. Each
/// connection has its own lock, held for one event, so datagrams for
/// different connections can be processed from different threads.
///
/// Lock order is table, then connection. The accept queues and the event
/// queue are only locked last, never while waiting for another lock.
pub struct ConnectionTable {
    local_addr: Ipv4Addr,
    config: Config,
    manager: Mutex<ConnectionManager>,
    /// established passive connections not yet accepted, per listener
    pending: Mutex<HashMap<Quad, VecDeque<Quad>>>,
    events: Mutex<VecDeque<Event>>,
    isn: IsnGenerator,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionTable {
    /// `local_addr` is the source address of actively opened connections.
    pub fn new(local_addr: Ipv4Addr, config: Config) -> Self {
        ConnectionTable {
            local_addr,
            config,
            manager: Mutex::default(),
            pending: Mutex::default(),
            events: Mutex::default(),
            isn: IsnGenerator::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles the TCP payload of one IPv4 datagram from `src` to `dst`.
    ///
    /// Malformed segments and checksum failures are returned as errors and
    /// must not be answered.
    pub fn on_datagram(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let seg = segment::SegmentSlice::from_slice(bytes)?;
        segment::verify_checksum(bytes, src, dst)?;
        let tcph = seg.header();
        let quad = Quad {
            local: SocketAddrV4::new(dst, tcph.dst_port),
            remote: SocketAddrV4::new(src, tcph.src_port),
        };

        #[cfg(feature = "options")]
        for option in seg.options_iter() {
            trace!("[{}] option {:?}", quad, option);
        }

        if quad.remote.ip().is_unspecified() || quad.remote.port() == 0 {
            debug!("[{}] ignoring segment from an unspecified remote", quad);
            return Ok(Vec::new());
        }

        let Some(conn) = self.lookup_or_create(quad, now) else {
            debug!("[{}] {}", quad, Error::UnknownConnection(quad));
            let reply = tcp::reset_for(tcph, seg.payload().len()).map(|rst| Datagram {
                src: dst,
                dst: src,
                payload: segment::encode(&rst, &[], dst, src),
            });
            return Ok(reply.into_iter().collect());
        };

        let mut c = lock(&conn);
        let signals = c.on_segment(tcph, seg.payload(), now);
        Ok(self.finish(&conn, c, signals))
    }

    /// Runs the timers of every connection.
    pub fn tick(&self, now: Instant) -> Vec<Datagram> {
        let connections: Vec<ConnectionHandle> =
            lock(&self.manager).connections.values().cloned().collect();
        let mut out = Vec::new();
        for conn in connections {
            let mut c = lock(&conn);
            let signals = c.on_tick(now);
            out.extend(self.finish(&conn, c, signals));
        }
        out
    }

    /// Starts listening on `local`. An unspecified address matches any local
    /// address on that port.
    pub fn open_passive(&self, local: SocketAddrV4) -> Result<Quad> {
        let quad = Quad::listening(local);
        let mut cm = lock(&self.manager);
        match cm.connections.entry(quad) {
            Entry::Occupied(_) => Err(Error::AddrInUse(quad)),
            Entry::Vacant(v) => {
                v.insert(Arc::new(Mutex::new(Connection::listen(local, self.config))));
                lock(&self.pending).insert(quad, VecDeque::new());
                info!("[{}] listening", quad);
                Ok(quad)
            }
        }
    }

    /// Connects to `remote` from a random ephemeral port.
    pub fn open_active(&self, remote: SocketAddrV4, now: Instant) -> Result<(Quad, Vec<Datagram>)> {
        let ports = self.config.ephemeral_first..=self.config.ephemeral_last;
        if ports.is_empty() {
            return Err(Error::PortsExhausted);
        }
        let (quad, conn, signals) = {
            let mut cm = lock(&self.manager);
            let quad = (0..EPHEMERAL_ATTEMPTS)
                .map(|_| {
                    let port = rand::random_range(ports.clone());
                    Quad {
                        local: SocketAddrV4::new(self.local_addr, port),
                        remote,
                    }
                })
                .find(|q| !cm.connections.contains_key(q))
                .ok_or(Error::PortsExhausted)?;

            let iss = self.isn.generate(&quad, now);
            let (c, signals) = Connection::connect(quad, iss, self.config, now);
            let conn = Arc::new(Mutex::new(c));
            cm.connections.insert(quad, conn.clone());
            (quad, conn, signals)
        };
        info!("[{}] connecting", quad);
        let c = lock(&conn);
        Ok((quad, self.finish(&conn, c, signals)))
    }

    /// Queues `data` for transmission, returns how much of it was taken.
    pub fn send(&self, quad: Quad, data: &[u8], now: Instant) -> Result<(usize, Vec<Datagram>)> {
        let conn = self.get(quad)?;
        let mut c = lock(&conn);
        let (n, signals) = c.send(data, now)?;
        Ok((n, self.finish(&conn, c, signals)))
    }

    pub fn read(&self, quad: Quad, buf: &mut [u8]) -> Result<usize> {
        let conn = self.get(quad)?;
        let n = lock(&conn).read(buf);
        Ok(n)
    }

    /// Orderly close. Closing a listener stops accepting and forgets the
    /// connections nobody accepted yet, they stay open.
    pub fn close(&self, quad: Quad, now: Instant) -> Result<Vec<Datagram>> {
        let conn = self.get(quad)?;
        let mut c = lock(&conn);
        let signals = c.close(now)?;
        Ok(self.finish(&conn, c, signals))
    }

    pub fn abort(&self, quad: Quad) -> Result<Vec<Datagram>> {
        let conn = self.get(quad)?;
        let mut c = lock(&conn);
        let signals = c.abort();
        Ok(self.finish(&conn, c, signals))
    }

    /// Next established connection on `listener`, if any.
    pub fn accept(&self, listener: Quad) -> Result<Option<Quad>> {
        loop {
            let next = lock(&self.pending)
                .get_mut(&listener)
                .ok_or(Error::UnknownConnection(listener))?
                .pop_front();
            let Some(quad) = next else {
                return Ok(None);
            };
            if self.contains(quad) {
                return Ok(Some(quad));
            }
            debug!("[{}] gone before it was accepted", quad);
        }
    }

    /// Drains the queued events.
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).drain(..).collect()
    }

    pub fn contains(&self, quad: Quad) -> bool {
        lock(&self.manager).connections.contains_key(&quad)
    }

    pub fn state(&self, quad: Quad) -> Option<State> {
        let conn = self.get(quad).ok()?;
        let state = lock(&conn).state();
        Some(state)
    }

    fn get(&self, quad: Quad) -> Result<ConnectionHandle> {
        lock(&self.manager)
            .connections
            .get(&quad)
            .cloned()
            .ok_or(Error::UnknownConnection(quad))
    }

    /// Exact match first, then a listener on the local address, then a
    /// listener on the unspecified address.
    fn lookup_or_create(&self, quad: Quad, now: Instant) -> Option<ConnectionHandle> {
        let mut cm = lock(&self.manager);
        if let Some(c) = cm.connections.get(&quad) {
            return Some(c.clone());
        }

        let wildcard = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, quad.local.port());
        let listener = [Quad::listening(quad.local), Quad::listening(wildcard)]
            .iter()
            .find_map(|l| cm.connections.get(l).cloned())?;

        let iss = self.isn.generate(&quad, now);
        let c = lock(&listener).spawn(quad, iss);
        trace!("[{}] new connection on {}", quad, c.listener().unwrap_or(quad));
        let c = Arc::new(Mutex::new(c));
        cm.connections.insert(quad, c.clone());
        Some(c)
    }

    /// Event delivery, removal and serialization after a connection handled
    /// an event. Events are queued before `c` is released, so those of one
    /// connection stay in the order it raised them.
    fn finish(
        &self,
        conn: &ConnectionHandle,
        c: MutexGuard<'_, Connection>,
        signals: Signals,
    ) -> Vec<Datagram> {
        let (quad, done) = (c.quad(), c.is_ready_for_removal());
        if let Some(listener) = c.listener() {
            let established = signals.events.iter().filter_map(|e| match e {
                Event::Established(q) => Some(*q),
                _ => None,
            });
            if let Some(pending) = lock(&self.pending).get_mut(&listener) {
                pending.extend(established);
            }
        }
        lock(&self.events).extend(signals.events);
        drop(c);

        if done {
            self.remove(quad, conn);
        }

        let (src, dst) = (*quad.local.ip(), *quad.remote.ip());
        signals
            .segments
            .into_iter()
            .map(|s| Datagram {
                src,
                dst,
                payload: segment::encode(&s.header, &s.payload, src, dst),
            })
            .collect()
    }

    fn remove(&self, quad: Quad, conn: &ConnectionHandle) {
        let mut cm = lock(&self.manager);
        if let Entry::Occupied(e) = cm.connections.entry(quad) {
            // the slot may already hold a newer incarnation
            if Arc::ptr_eq(e.get(), conn) && lock(conn).is_ready_for_removal() {
                e.remove();
                if lock(&self.pending).remove(&quad).is_some() {
                    info!("[{}] stopped listening", quad);
                } else {
                    debug!("[{}] removed", quad);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Flags, TcpHeader};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 2);

    fn syn(dst_port: u16) -> Vec<u8> {
        let mut h = TcpHeader::new(40000, dst_port, 1000, 1024);
        h.flags = Flags::SYN;
        segment::encode(&h, &[], PEER, LOCAL)
    }

    #[test]
    fn quad_display() {
        let q = Quad {
            local: SocketAddrV4::new(LOCAL, 443),
            remote: SocketAddrV4::new(PEER, 40000),
        };
        assert_eq!(q.to_string(), "192.168.9.1:443 -> 192.168.9.2:40000");
        assert!(!q.is_listening());
        assert!(Quad::listening(q.local).is_listening());
    }

    #[test]
    fn wildcard_listener_matches_any_local_address() {
        let table = ConnectionTable::new(LOCAL, Config::default());
        let now = Instant::now();
        table
            .open_passive(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 443))
            .unwrap();

        let out = table.on_datagram(PEER, LOCAL, &syn(443), now).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].src, out[0].dst), (LOCAL, PEER));

        let quad = Quad {
            local: SocketAddrV4::new(LOCAL, 443),
            remote: SocketAddrV4::new(PEER, 40000),
        };
        assert_eq!(table.state(quad), Some(State::SynRcvd));
    }

    #[test]
    fn specific_listener_wins_over_wildcard() {
        let table = ConnectionTable::new(LOCAL, Config::default());
        let now = Instant::now();
        let wildcard = table
            .open_passive(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 443))
            .unwrap();
        let specific = table.open_passive(SocketAddrV4::new(LOCAL, 443)).unwrap();
        table.on_datagram(PEER, LOCAL, &syn(443), now).unwrap();

        let conn = table
            .get(Quad {
                local: SocketAddrV4::new(LOCAL, 443),
                remote: SocketAddrV4::new(PEER, 40000),
            })
            .unwrap();
        assert_eq!(lock(&conn).listener(), Some(specific));
        assert_ne!(lock(&conn).listener(), Some(wildcard));
    }

    #[test]
    fn listen_twice_is_rejected() {
        let table = ConnectionTable::new(LOCAL, Config::default());
        let local = SocketAddrV4::new(LOCAL, 80);
        let quad = table.open_passive(local).unwrap();
        assert_eq!(table.open_passive(local), Err(Error::AddrInUse(quad)));
    }

    #[test]
    fn closing_a_listener_removes_it() {
        let table = ConnectionTable::new(LOCAL, Config::default());
        let now = Instant::now();
        let listener = table.open_passive(SocketAddrV4::new(LOCAL, 80)).unwrap();
        table.close(listener, now).unwrap();
        assert!(!table.contains(listener));
        assert_eq!(table.events(), vec![Event::Closed(listener)]);
        assert_eq!(table.accept(listener), Err(Error::UnknownConnection(listener)));
    }

    #[test]
    fn active_open_uses_an_ephemeral_port() {
        let config = Config {
            ephemeral_first: 50000,
            ephemeral_last: 50001,
            ..Config::default()
        };
        let table = ConnectionTable::new(LOCAL, config);
        let now = Instant::now();
        let remote = SocketAddrV4::new(PEER, 80);

        let (a, out) = table.open_active(remote, now).unwrap();
        assert_eq!(out.len(), 1);
        assert!((50000..=50001).contains(&a.local.port()));
        assert_eq!(*a.local.ip(), LOCAL);
        assert_eq!(table.state(a), Some(State::SynSent));

        let (b, _) = table.open_active(remote, now).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.open_active(remote, now), Err(Error::PortsExhausted));
    }

    #[test]
    fn empty_port_range_is_exhausted() {
        let config = Config {
            ephemeral_first: 50001,
            ephemeral_last: 50000,
            ..Config::default()
        };
        let table = ConnectionTable::new(LOCAL, config);
        let remote = SocketAddrV4::new(PEER, 80);
        assert_eq!(
            table.open_active(remote, Instant::now()),
            Err(Error::PortsExhausted)
        );
        assert!(lock(&table.manager).connections.is_empty());
    }

    #[test]
    fn segments_from_port_zero_are_dropped() {
        let table = ConnectionTable::new(LOCAL, Config::default());
        let mut h = TcpHeader::new(0, 443, 1, 1024);
        h.flags = Flags::SYN;
        let bytes = segment::encode(&h, &[], PEER, LOCAL);
        let out = table.on_datagram(PEER, LOCAL, &bytes, Instant::now()).unwrap();
        assert!(out.is_empty());
    }
}
