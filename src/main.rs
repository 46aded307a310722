use anyhow::{Context, anyhow, bail};
use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::time::{Duration, Instant};
use tun_tap::{Iface, Mode};

use rawtcp::{Config, ConnectionTable, Datagram, Event, Quad};

const INTERFACE: &str = "tun0";
const VIRTUAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 1);
const CIDR_MASK: u8 = 24;
const ROUTE: &str = "192.168.8.0/24";
const PORT: u16 = 443;
const GREETING: &[u8] = b"hello from rawtcp\n";

const TICK: Duration = Duration::from_millis(10);
const TTL: u8 = 64;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut nic = Iface::without_packet_info(INTERFACE, Mode::Tun)
        .with_context(|| format!("failed to create {}", INTERFACE))?;
    configure_interface()?;

    let table = ConnectionTable::new(VIRTUAL_IP, Config::default());
    let listener = table.open_passive(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT))?;
    info!("listening on port {}", PORT);

    packet_loop(&mut nic, &table, listener)
}

/// Runs `cmd`. `ip` exits with 2 when an address or route already exists,
/// which is fine when restarting.
fn run_command(cmd: &str, args: &[&str]) -> anyhow::Result<()> {
    let line = format!("{} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("failed to run `{}`", line))?;
    match status.code() {
        Some(0) => Ok(()),
        Some(2) => {
            warn!("`{}` exited with 2, assuming it is already configured", line);
            Ok(())
        }
        _ => bail!("`{}` failed with {}", line, status),
    }
}

fn configure_interface() -> anyhow::Result<()> {
    let addr = format!("{}/{}", VIRTUAL_IP, CIDR_MASK);
    let src = VIRTUAL_IP.to_string();
    run_command("ip", &["addr", "add", &addr, "dev", INTERFACE])?;
    run_command("ip", &["link", "set", "dev", INTERFACE, "up"])?;
    run_command("ip", &["route", "add", ROUTE, "dev", INTERFACE, "src", &src])?;
    info!("{} configured with {}", INTERFACE, addr);
    Ok(())
}

fn packet_loop(nic: &mut Iface, table: &ConnectionTable, listener: Quad) -> anyhow::Result<()> {
    let mut buf = [0u8; 1504];
    let mut last_tick = Instant::now();
    let mut echo = Echo::default();

    loop {
        // wake up at least once per tick so timers fire while the link is idle
        let mut pfd = [nix::poll::PollFd::new(
            nic.as_raw_fd(),
            nix::poll::EventFlags::POLLIN,
        )];
        let n = nix::poll::poll(&mut pfd[..], TICK.as_millis() as i32)
            .map_err(|e| anyhow!("poll on {} failed: {}", INTERFACE, e))?;

        let now = Instant::now();
        if n > 0 {
            let nbytes = nic.recv(&mut buf[..])?;
            let out = on_packet(table, &buf[..nbytes], now);
            transmit(nic, out)?;
        }
        if now.duration_since(last_tick) >= TICK {
            last_tick = now;
            let out = table.tick(now);
            transmit(nic, out)?;
        }

        let out = echo.serve(table, listener, now)?;
        transmit(nic, out)?;
    }
}

fn on_packet(table: &ConnectionTable, packet: &[u8], now: Instant) -> Vec<Datagram> {
    let iph = match Ipv4HeaderSlice::from_slice(packet) {
        Ok(iph) => iph,
        Err(e) => {
            debug!("ignoring weird packet {:?}", e);
            return Vec::new();
        }
    };
    if iph.protocol() != IpNumber::TCP {
        trace!("ignoring protocol {:?}", iph.protocol());
        return Vec::new();
    }

    let start = iph.slice().len();
    let end = std::cmp::min(iph.total_len() as usize, packet.len());
    if end < start {
        debug!("ignoring packet with bad total length {}", iph.total_len());
        return Vec::new();
    }

    let (src, dst) = (iph.source_addr(), iph.destination_addr());
    match table.on_datagram(src, dst, &packet[start..end], now) {
        Ok(out) => out,
        Err(e) => {
            debug!("dropping segment {} -> {}: {}", src, dst, e);
            Vec::new()
        }
    }
}

fn transmit(nic: &mut Iface, datagrams: Vec<Datagram>) -> anyhow::Result<()> {
    for d in datagrams {
        let ip = Ipv4Header::new(
            d.payload.len() as u16,
            TTL,
            IpNumber::TCP,
            d.src.octets(),
            d.dst.octets(),
        )
        .map_err(|e| anyhow!("cannot build IPv4 header: {}", e))?;

        let mut packet = Vec::with_capacity(ip.header_len() as usize + d.payload.len());
        ip.write(&mut packet)?;
        packet.extend_from_slice(&d.payload);
        nic.send(&packet)?;
    }
    Ok(())
}

/// Echo server: greets new connections, sends back whatever arrives and
/// closes when the peer does.
#[derive(Default)]
struct Echo {
    /// bytes `send` has not taken yet, per connection
    backlog: HashMap<Quad, Vec<u8>>,
    /// the peer closed, we follow once the backlog is out
    closing: HashSet<Quad>,
}

impl Echo {
    fn serve(
        &mut self,
        table: &ConnectionTable,
        listener: Quad,
        now: Instant,
    ) -> anyhow::Result<Vec<Datagram>> {
        let mut out = Vec::new();

        while let Some(quad) = table.accept(listener)? {
            info!("accepted connection from {}", quad.remote);
            self.backlog.entry(quad).or_default().extend_from_slice(GREETING);
        }

        for event in table.events() {
            match event {
                Event::DataReceived(quad) => {
                    self.backlog.entry(quad).or_default();
                }
                Event::PeerClosed(quad) => {
                    self.closing.insert(quad);
                    self.backlog.entry(quad).or_default();
                }
                Event::Reset(quad) => {
                    info!("[{}] connection reset", quad);
                    self.forget(quad);
                }
                Event::Closed(quad) => {
                    debug!("[{}] closed", quad);
                    self.forget(quad);
                }
                Event::Established(quad) => debug!("[{}] established", quad),
            }
        }

        // retried on every pass, ACKs free up send buffer in between
        let busy: Vec<Quad> = self.backlog.keys().copied().collect();
        for quad in busy {
            if let Err(e) = self.pump(table, quad, now, &mut out) {
                warn!("[{}] echo failed: {}", quad, e);
                self.forget(quad);
            }
        }
        Ok(out)
    }

    /// Hands the backlog to `send` and only reads more once all of it was
    /// taken, so unread data keeps our receive window closed.
    fn pump(
        &mut self,
        table: &ConnectionTable,
        quad: Quad,
        now: Instant,
        out: &mut Vec<Datagram>,
    ) -> rawtcp::Result<()> {
        let mut buf = [0u8; 512];
        let pending = self.backlog.entry(quad).or_default();
        loop {
            if !pending.is_empty() {
                let (n, segments) = table.send(quad, pending, now)?;
                out.extend(segments);
                pending.drain(..n);
                if !pending.is_empty() {
                    trace!("[{}] {}b waiting for send buffer", quad, pending.len());
                    return Ok(());
                }
            }
            let n = table.read(quad, &mut buf)?;
            if n == 0 {
                break;
            }
            debug!("[{}] read {}b: {}", quad, n, String::from_utf8_lossy(&buf[..n]));
            pending.extend_from_slice(&buf[..n]);
        }

        self.backlog.remove(&quad);
        if self.closing.remove(&quad) {
            out.extend(table.close(quad, now)?);
        }
        Ok(())
    }

    fn forget(&mut self, quad: Quad) {
        self.backlog.remove(&quad);
        self.closing.remove(&quad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawtcp::State;
    use rawtcp::segment::{self, Flags, SegmentSlice, TcpHeader};

    const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 9, 2);

    fn from_peer(seq: u32, ack: u32, flags: Flags, payload: &[u8]) -> Vec<u8> {
        let mut h = TcpHeader::new(40000, PORT, seq, 8192);
        h.flags = flags;
        h.ack_number = ack;
        segment::encode(&h, payload, PEER, VIRTUAL_IP)
    }

    /// Appends the payloads, returns the last header seen.
    fn collect(out: Vec<Datagram>, received: &mut Vec<u8>) -> Option<TcpHeader> {
        let mut last = None;
        for d in out {
            let seg = SegmentSlice::from_slice(&d.payload).unwrap();
            received.extend_from_slice(seg.payload());
            last = Some(seg.header().clone());
        }
        last
    }

    #[test]
    fn echo_waits_for_send_buffer_space() {
        let config = Config {
            send_buffer: 16,
            ..Config::default()
        };
        let table = ConnectionTable::new(VIRTUAL_IP, config);
        let listener = table
            .open_passive(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT))
            .unwrap();
        let now = Instant::now();
        let mut echo = Echo::default();
        let deliver = |bytes: Vec<u8>| table.on_datagram(PEER, VIRTUAL_IP, &bytes, now).unwrap();

        let out = deliver(from_peer(100, 0, Flags::SYN, &[]));
        let iss = SegmentSlice::from_slice(&out[0].payload)
            .unwrap()
            .header()
            .seq_number;
        let first = iss.wrapping_add(1);
        deliver(from_peer(101, first, Flags::ACK, &[]));
        // arrives before the greeting fits into the send buffer
        deliver(from_peer(101, first, Flags::ACK | Flags::PSH, b"ping"));

        let mut received = Vec::new();
        for _ in 0..8 {
            collect(echo.serve(&table, listener, now).unwrap(), &mut received);
            let ack = first.wrapping_add(received.len() as u32);
            collect(deliver(from_peer(105, ack, Flags::ACK, &[])), &mut received);
        }
        assert_eq!(received, b"hello from rawtcp\nping");

        let quad = Quad {
            local: SocketAddrV4::new(VIRTUAL_IP, PORT),
            remote: SocketAddrV4::new(PEER, 40000),
        };
        let ack = first.wrapping_add(received.len() as u32);
        deliver(from_peer(105, ack, Flags::FIN | Flags::ACK, &[]));
        let fin = collect(echo.serve(&table, listener, now).unwrap(), &mut received);
        assert_eq!(fin.map(|h| h.flags), Some(Flags::FIN | Flags::ACK));
        assert_eq!(table.state(quad), Some(State::LastAck));
    }
}
