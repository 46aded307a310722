#![allow(dead_code)]

use rawtcp::segment::{self, Flags, SegmentSlice, TcpHeader};
use rawtcp::{ConnectionTable, Datagram, Quad};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

pub const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 1);
pub const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 2);

/// A remote endpoint driven by hand.
pub struct Peer {
    pub addr: SocketAddrV4,
    pub host: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
}

impl Peer {
    pub fn new(port: u16, host_port: u16, isn: u32) -> Self {
        Peer {
            addr: SocketAddrV4::new(PEER, port),
            host: SocketAddrV4::new(HOST, host_port),
            seq: isn,
            ack: 0,
            window: 8192,
        }
    }

    /// The connection identity as the host sees it.
    pub fn quad(&self) -> Quad {
        Quad {
            local: self.host,
            remote: self.addr,
        }
    }

    pub fn encode(&self, flags: Flags, payload: &[u8]) -> Vec<u8> {
        let mut h = TcpHeader::new(self.addr.port(), self.host.port(), self.seq, self.window);
        h.flags = flags;
        if flags.contains(Flags::ACK) {
            h.ack_number = self.ack;
        }
        segment::encode(&h, payload, *self.addr.ip(), *self.host.ip())
    }

    /// Sends a segment and advances our sequence number past it.
    pub fn send(
        &mut self,
        table: &ConnectionTable,
        flags: Flags,
        payload: &[u8],
        now: Instant,
    ) -> Vec<(TcpHeader, Vec<u8>)> {
        let bytes = self.encode(flags, payload);
        let mut len = payload.len() as u32;
        if flags.contains(Flags::SYN) {
            len += 1;
        }
        if flags.contains(Flags::FIN) {
            len += 1;
        }
        self.seq = self.seq.wrapping_add(len);
        let out = table
            .on_datagram(*self.addr.ip(), *self.host.ip(), &bytes, now)
            .expect("segment rejected");
        self.receive(out)
    }

    /// Decodes what the host sent us, checking addressing and checksums.
    pub fn receive(&self, out: Vec<Datagram>) -> Vec<(TcpHeader, Vec<u8>)> {
        out.into_iter()
            .map(|d| {
                assert_eq!((d.src, d.dst), (*self.host.ip(), *self.addr.ip()));
                segment::verify_checksum(&d.payload, d.src, d.dst).expect("bad checksum");
                let seg = SegmentSlice::from_slice(&d.payload).expect("bad segment");
                assert_eq!(seg.header().src_port, self.host.port());
                assert_eq!(seg.header().dst_port, self.addr.port());
                (seg.header().clone(), seg.payload().to_vec())
            })
            .collect()
    }

    /// Passive open on the host: SYN, SYN-ACK, ACK. Returns the host's ISS.
    pub fn connect(&mut self, table: &ConnectionTable, now: Instant) -> u32 {
        let out = self.send(table, Flags::SYN, &[], now);
        assert_eq!(out.len(), 1);
        let syn_ack = &out[0].0;
        assert_eq!(syn_ack.flags, Flags::SYN | Flags::ACK);
        assert_eq!(syn_ack.ack_number, self.seq);
        self.ack = syn_ack.seq_number.wrapping_add(1);

        let out = self.send(table, Flags::ACK, &[], now);
        assert!(out.is_empty());
        syn_ack.seq_number
    }
}
