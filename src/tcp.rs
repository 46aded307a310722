use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::segment::{Flags, TcpHeader};
use crate::seq;
use crate::tcb::{InFlight, RecvSequenceSpace, RetransmitQueue, SendSequenceSpace, State, Timers};
use crate::{Event, Quad};

/// An outbound segment before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

/// What processing one event produced: segments to transmit and
/// notifications for the owner.
#[derive(Debug, Default)]
pub struct Signals {
    pub segments: Vec<Segment>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Active,
    Passive,
}

/// Transmission Control Block of one connection, and the state machine
/// driving it (RFC 793 S3.9).
pub struct Connection {
    quad: Quad,
    state: State,
    send: SendSequenceSpace,
    recv: RecvSequenceSpace,
    timers: Timers,
    retransmit: RetransmitQueue,

    /// in-order data not yet read by the owner
    incoming: VecDeque<u8>,
    /// data accepted by `send` and not yet transmitted
    unsent: VecDeque<u8>,

    /// the owner asked to close, a FIN follows the queued data
    closed: bool,
    /// sequence number of our FIN once it went out
    closed_at: Option<u32>,
    send_window_update_ack: bool,

    /// the listening endpoint this connection was accepted on
    listener: Option<Quad>,
    open: OpenKind,
    config: Config,
}

impl Connection {
    fn new(quad: Quad, state: State, iss: u32, config: Config, open: OpenKind) -> Self {
        Connection {
            quad,
            state,
            send: SendSequenceSpace::new(iss),
            recv: RecvSequenceSpace::new(config.max_window()),
            timers: Timers::new(config.initial_rto),
            retransmit: Default::default(),
            incoming: Default::default(),
            unsent: Default::default(),
            closed: false,
            closed_at: None,
            send_window_update_ack: false,
            listener: None,
            open,
            config,
        }
    }

    /// A passive endpoint accepting connections on `local` from anyone.
    pub fn listen(local: SocketAddrV4, config: Config) -> Self {
        Self::new(Quad::listening(local), State::Listen, 0, config, OpenKind::Passive)
    }

    /// A fresh LISTEN copy of this endpoint, bound to a concrete peer.
    pub fn spawn(&self, quad: Quad, iss: u32) -> Self {
        let mut c = Self::new(quad, State::Listen, iss, self.config, OpenKind::Passive);
        c.listener = Some(self.quad);
        c
    }

    /// Active open: sends our SYN.
    pub fn connect(quad: Quad, iss: u32, config: Config, now: Instant) -> (Self, Signals) {
        let mut c = Self::new(quad, State::SynSent, iss, config, OpenKind::Active);
        let mut signals = Signals::default();
        debug!("[{}] active open, sending SYN: CLOSED -> SYN_SENT", quad);
        c.transmit(Flags::SYN, Vec::new(), now, &mut signals);
        (c, signals)
    }

    pub fn quad(&self) -> Quad {
        self.quad
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn listener(&self) -> Option<Quad> {
        self.listener
    }

    /// Closed connections, and accepted copies that never got past LISTEN,
    /// should be dropped from the table.
    pub fn is_ready_for_removal(&self) -> bool {
        match self.state {
            State::Closed => true,
            State::Listen => self.listener.is_some(),
            _ => false,
        }
    }

    pub fn on_segment(&mut self, seg: &TcpHeader, data: &[u8], now: Instant) -> Signals {
        trace!(
            "[{}] {:?} <- seq {} ack {} flags {:?} wnd {} len {}",
            self.quad,
            self.state,
            seg.seq_number,
            seg.ack_number,
            seg.flags,
            seg.window,
            data.len()
        );
        let mut signals = Signals::default();
        match self.state {
            State::Closed => self.arrives_closed(seg, data, &mut signals),
            State::Listen => self.arrives_listen(seg, now, &mut signals),
            State::SynSent => self.arrives_syn_sent(seg, now, &mut signals),
            _ => self.arrives_synchronized(seg, data, now, &mut signals),
        }
        signals
    }

    fn arrives_closed(&self, seg: &TcpHeader, data: &[u8], signals: &mut Signals) {
        if let Some(header) = reset_for(seg, data.len()) {
            signals.segments.push(Segment {
                header,
                payload: Vec::new(),
            });
        }
    }

    fn arrives_listen(&mut self, seg: &TcpHeader, now: Instant, signals: &mut Signals) {
        if seg.rst() {
            return;
        }
        if seg.ack() {
            // nothing can be acknowledged yet, this belongs to an old connection
            debug!("[{}] (LISTEN) received ACK, sending RST", self.quad);
            signals.segments.push(self.reset(seg.ack_number));
            return;
        }
        if !seg.syn() {
            return;
        }

        self.recv.synchronize(seg.seq_number);
        self.send.wnd = seg.window;
        self.send.wl1 = seg.seq_number;
        self.send.wl2 = self.send.iss;
        self.state = State::SynRcvd;
        debug!(
            "[{}] received SYN, sending SYN_ACK: LISTEN -> SYN_RCVD",
            self.quad
        );
        self.transmit(Flags::SYN | Flags::ACK, Vec::new(), now, signals);
    }

    fn arrives_syn_sent(&mut self, seg: &TcpHeader, now: Instant, signals: &mut Signals) {
        if seg.rst() {
            info!("[{}] connection refused", self.quad);
            self.teardown(Event::Reset(self.quad), signals);
            return;
        }

        let mut ack_ok = false;
        if seg.ack() {
            if seq::le(seg.ack_number, self.send.iss) || seq::gt(seg.ack_number, self.send.nxt) {
                debug!(
                    "[{}] (SYN_SENT) {}: ack {}",
                    self.quad,
                    Error::AckOutOfRange,
                    seg.ack_number
                );
                signals.segments.push(self.reset(seg.ack_number));
                return;
            }
            ack_ok = true;
        }
        if !seg.syn() {
            return;
        }

        self.recv.synchronize(seg.seq_number);
        if ack_ok {
            self.acknowledge(seg.ack_number, now);
        }
        self.send.wnd = seg.window;
        self.send.wl1 = seg.seq_number;
        self.send.wl2 = seg.ack_number;

        if seq::gt(self.send.una, self.send.iss) {
            debug!("[{}] SYN_SENT -> ESTABLISHED", self.quad);
            self.state = State::Estab;
            signals.events.push(Event::Established(self.quad));
            if !self.flush(now, signals) {
                self.send_ack(signals);
            }
        } else {
            debug!(
                "[{}] simultaneous open, sending SYN_ACK: SYN_SENT -> SYN_RCVD",
                self.quad
            );
            self.state = State::SynRcvd;
            // our SYN is still queued, from now on it carries the ACK
            if let Some(syn) = self.retransmit.front_mut() {
                syn.flags.insert(Flags::ACK);
            }
            signals.segments.push(Segment {
                header: self.header(self.send.iss, Flags::SYN | Flags::ACK),
                payload: Vec::new(),
            });
        }
    }

    fn arrives_synchronized(
        &mut self,
        seg: &TcpHeader,
        data: &[u8],
        now: Instant,
        signals: &mut Signals,
    ) {
        // first, check that sequence numbers are valid (RFC 793 S3.3)
        let slen = seg.sequence_len(data.len());
        if let Err(e) = self.check_acceptable(seg.seq_number, slen) {
            debug!(
                "[{}] {}: seq {} len {}, expected {} wnd {}",
                self.quad, e, seg.seq_number, slen, self.recv.nxt, self.recv.wnd
            );
            if !seg.rst() {
                if self.state == State::TimeWait && seg.fin() {
                    // the peer did not get our last ACK
                    self.enter_time_wait(now);
                }
                self.send_ack(signals);
            }
            return;
        }

        if seg.rst() {
            if self.is_unaccepted() {
                debug!("[{}] (SYN_RCVD) received RST, dropping", self.quad);
                self.drop_unaccepted();
            } else {
                info!("[{}] connection reset by peer in {:?}", self.quad, self.state);
                self.teardown(Event::Reset(self.quad), signals);
            }
            return;
        }

        if seg.syn() {
            warn!("[{}] SYN inside the window, resetting", self.quad);
            signals.segments.push(self.reset(self.send.nxt));
            self.teardown(Event::Reset(self.quad), signals);
            return;
        }

        if !seg.ack() {
            return;
        }

        if self.state == State::SynRcvd {
            if seq::lt(self.send.una, seg.ack_number) && seq::le(seg.ack_number, self.send.nxt) {
                debug!("[{}] SYN_RCVD -> ESTABLISHED", self.quad);
                self.state = State::Estab;
                self.send.wnd = seg.window;
                self.send.wl1 = seg.seq_number;
                self.send.wl2 = seg.ack_number;
                signals.events.push(Event::Established(self.quad));
            } else {
                debug!(
                    "[{}] (SYN_RCVD) {}: ack {}",
                    self.quad,
                    Error::AckOutOfRange,
                    seg.ack_number
                );
                signals.segments.push(self.reset(seg.ack_number));
                return;
            }
        }

        match self.check_ack(seg.ack_number) {
            Ok(true) => self.acknowledge(seg.ack_number, now),
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "[{}] {}: ack {} nxt {}",
                    self.quad, e, seg.ack_number, self.send.nxt
                );
                self.send_ack(signals);
                return;
            }
        }
        if self.send.update_window(seg.seq_number, seg.ack_number, seg.window) {
            trace!("[{}] send window now {}", self.quad, self.send.wnd);
        }
        if self.send.wnd == 0 && seg.ack_number == self.send.una && !self.retransmit.is_empty() {
            // the peer is alive and keeps its window shut, not a lost segment
            self.timers.retries = 0;
        }

        if self.fin_acked() {
            match self.state {
                State::FinWait1 => {
                    debug!("[{}] our FIN was ACKed: FIN_WAIT_1 -> FIN_WAIT_2", self.quad);
                    self.state = State::FinWait2;
                }
                State::Closing => {
                    debug!("[{}] our FIN was ACKed: CLOSING -> TIME_WAIT", self.quad);
                    self.enter_time_wait(now);
                }
                State::LastAck => {
                    debug!("[{}] our FIN was ACKed: LAST_ACK -> CLOSED", self.quad);
                    self.state = State::Closed;
                    self.timers.cancel();
                    signals.events.push(Event::Closed(self.quad));
                    return;
                }
                _ => {}
            }
        }

        if seg.flags.contains(Flags::URG) {
            self.recv.up = seg.urgent_pointer;
        }

        let mut needs_ack = false;
        let mut in_order = true;
        if !data.is_empty() {
            if let State::Estab | State::FinWait1 | State::FinWait2 = self.state {
                if seq::gt(seg.seq_number, self.recv.nxt) {
                    // no reassembly, the peer will retransmit from rcv.nxt
                    in_order = false;
                } else {
                    let unread_data_at = self.recv.nxt.wrapping_sub(seg.seq_number) as usize;
                    if unread_data_at < data.len() {
                        let fresh = &data[unread_data_at..];
                        let take = std::cmp::min(fresh.len(), self.recv.wnd as usize);
                        self.incoming.extend(&fresh[..take]);
                        self.recv.nxt = self.recv.nxt.wrapping_add(take as u32);
                        self.update_recv_window();
                        if take > 0 {
                            signals.events.push(Event::DataReceived(self.quad));
                        }
                    }
                }
                needs_ack = true;
            }
        }

        let fin_at = seg.seq_number.wrapping_add(data.len() as u32);
        if seg.fin() {
            needs_ack = true;
            if in_order && fin_at == self.recv.nxt {
                self.recv.nxt = self.recv.nxt.wrapping_add(1);
                self.on_fin(now, signals);
            }
        }

        let sent = self.flush(now, signals);
        if needs_ack && !sent {
            self.send_ack(signals);
        }
    }

    fn on_fin(&mut self, now: Instant, signals: &mut Signals) {
        debug!("[{}] received FIN in {:?}", self.quad, self.state);
        match self.state {
            State::SynRcvd | State::Estab => {
                self.state = State::CloseWait;
                signals.events.push(Event::PeerClosed(self.quad));
            }
            State::FinWait1 => {
                if self.fin_acked() {
                    self.enter_time_wait(now);
                } else {
                    self.state = State::Closing;
                }
            }
            State::FinWait2 => self.enter_time_wait(now),
            State::TimeWait => self.enter_time_wait(now),
            _ => {}
        }
    }

    /// Timer driven work: TIME_WAIT expiry, retransmission, window updates and
    /// sending data that was held back by the window.
    pub fn on_tick(&mut self, now: Instant) -> Signals {
        let mut signals = Signals::default();
        match self.state {
            State::Closed | State::Listen => return signals,
            State::TimeWait => {
                if self.timers.time_wait_until.is_some_and(|t| now >= t) {
                    debug!("[{}] TIME_WAIT expired: TIME_WAIT -> CLOSED", self.quad);
                    self.state = State::Closed;
                    self.timers.time_wait_until = None;
                    signals.events.push(Event::Closed(self.quad));
                }
                return signals;
            }
            _ => {}
        }

        if self.timers.retransmit_at.is_some_and(|t| now >= t) {
            if self.timers.retries >= self.config.max_retransmits {
                warn!(
                    "[{}] {} in {:?}",
                    self.quad,
                    Error::RetransmissionLimitExceeded,
                    self.state
                );
                if self.state.is_synchronized() {
                    signals.segments.push(self.reset(self.send.nxt));
                }
                if self.is_unaccepted() {
                    self.drop_unaccepted();
                } else {
                    self.teardown(Event::Reset(self.quad), &mut signals);
                }
                return signals;
            }
            self.retransmit_oldest(now, &mut signals);
        }

        let sent = self.flush(now, &mut signals);
        if self.send_window_update_ack {
            self.send_window_update_ack = false;
            if !sent {
                self.send_ack(&mut signals);
            }
        }
        signals
    }

    /// Queues as much of `data` as the send buffer takes and transmits what
    /// the peer's window allows.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<(usize, Signals)> {
        match self.state {
            State::SynSent | State::SynRcvd | State::Estab | State::CloseWait => {}
            State::Closed | State::Listen => return Err(Error::NotConnected),
            _ => return Err(Error::ConnectionClosing),
        }
        let queued = self.unsent.len() + self.send.in_flight() as usize;
        let n = std::cmp::min(data.len(), self.config.send_buffer.saturating_sub(queued));
        self.unsent.extend(&data[..n]);

        let mut signals = Signals::default();
        self.flush(now, &mut signals);
        Ok((n, signals))
    }

    /// Moves received data into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let (head, tail) = self.incoming.as_slices();
        let hread = std::cmp::min(buf.len(), head.len());
        buf[..hread].copy_from_slice(&head[..hread]);
        let tread = std::cmp::min(buf.len() - hread, tail.len());
        buf[hread..(hread + tread)].copy_from_slice(&tail[..tread]);
        let nread = hread + tread;
        drop(self.incoming.drain(..nread));

        let was_zero = self.recv.wnd == 0;
        self.update_recv_window();
        if was_zero && self.recv.wnd > 0 && self.state.is_synchronized() {
            self.send_window_update_ack = true;
        }
        nread
    }

    pub fn available(&self) -> usize {
        self.incoming.len()
    }

    /// Orderly close of our sending side. The FIN goes out after queued data.
    pub fn close(&mut self, now: Instant) -> Result<Signals> {
        debug!(
            "[{}] owner requested close in {:?}",
            self.quad, self.state
        );
        let mut signals = Signals::default();
        match self.state {
            State::Listen | State::SynSent => {
                self.teardown(Event::Closed(self.quad), &mut signals);
                return Ok(signals);
            }
            State::SynRcvd | State::Estab => self.state = State::FinWait1,
            State::CloseWait => self.state = State::LastAck,
            State::Closed => return Err(Error::NotConnected),
            _ => return Err(Error::ConnectionClosing),
        }
        self.closed = true;
        self.flush(now, &mut signals);
        Ok(signals)
    }

    /// Abortive close: RST to the peer if it knows about us, everything queued
    /// is dropped.
    pub fn abort(&mut self) -> Signals {
        debug!("[{}] owner aborted in {:?}", self.quad, self.state);
        let mut signals = Signals::default();
        if matches!(
            self.state,
            State::SynRcvd | State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait
        ) {
            signals.segments.push(self.reset(self.send.nxt));
        }
        self.teardown(Event::Closed(self.quad), &mut signals);
        signals
    }

    fn check_acceptable(&self, seg_seq: u32, seg_len: u32) -> Result<()> {
        let nxt = self.recv.nxt;
        let wnd = self.recv.wnd as u32;
        let okay = match (seg_len, wnd) {
            (0, 0) => seg_seq == nxt,
            (0, _) => seq::in_window(seg_seq, nxt, wnd),
            (_, 0) => false,
            (_, _) => seq::overlaps(seg_seq, seg_len, nxt, wnd),
        };
        if okay {
            Ok(())
        } else {
            Err(Error::SequenceOutOfWindow)
        }
    }

    /// `Ok(true)` if `ack` acknowledges something new, `Ok(false)` for a
    /// duplicate.
    fn check_ack(&self, ack: u32) -> Result<bool> {
        if seq::lt(self.send.una, ack) && seq::le(ack, self.send.nxt) {
            Ok(true)
        } else if seq::gt(ack, self.send.nxt) {
            Err(Error::AckOutOfRange)
        } else {
            Ok(false)
        }
    }

    fn acknowledge(&mut self, ack: u32, now: Instant) {
        self.send.una = ack;
        for sent_at in self.retransmit.acknowledge(ack) {
            self.timers.sample(
                now.saturating_duration_since(sent_at),
                self.config.min_rto,
                self.config.max_rto,
            );
        }
        if self.retransmit.is_empty() {
            self.timers.cancel();
        } else {
            self.timers.retries = 0;
            self.timers.retransmit_at = Some(now + self.timers.rto);
        }
    }

    fn fin_acked(&self) -> bool {
        self.closed_at
            .is_some_and(|fin| seq::gt(self.send.una, fin))
    }

    /// Sends queued data within the peer's window, then the FIN if the owner
    /// closed and nothing is left. Returns whether anything was sent.
    fn flush(&mut self, now: Instant, signals: &mut Signals) -> bool {
        if !matches!(
            self.state,
            State::Estab | State::CloseWait | State::FinWait1 | State::Closing | State::LastAck
        ) {
            return false;
        }

        let mut sent = false;
        while !self.unsent.is_empty() {
            let in_flight = self.send.in_flight();
            // with a closed window and nothing outstanding, send one byte to see it reopen
            let window = if self.send.wnd == 0 && in_flight == 0 {
                1
            } else {
                self.send.wnd as u32
            };
            let allowed = window.saturating_sub(in_flight) as usize;
            if allowed == 0 {
                break;
            }
            let n = allowed.min(self.config.mss as usize).min(self.unsent.len());
            let payload: Vec<u8> = self.unsent.drain(..n).collect();
            let mut flags = Flags::ACK;
            if self.unsent.is_empty() {
                flags |= Flags::PSH;
            }
            self.transmit(flags, payload, now, signals);
            sent = true;
        }

        if self.closed && self.closed_at.is_none() && self.unsent.is_empty() {
            debug!("[{}] sending FIN in {:?}", self.quad, self.state);
            self.closed_at = Some(self.send.nxt);
            self.transmit(Flags::FIN | Flags::ACK, Vec::new(), now, signals);
            sent = true;
        }
        sent
    }

    fn transmit(&mut self, flags: Flags, payload: Vec<u8>, now: Instant, signals: &mut Signals) {
        let seq = self.send.nxt;
        let header = self.header(seq, flags);
        let segment = InFlight {
            seq,
            flags,
            payload,
            sent_at: now,
            retransmitted: false,
        };
        let len = segment.len();
        signals.segments.push(Segment {
            header,
            payload: segment.payload.clone(),
        });
        if len == 0 {
            return;
        }
        self.send.nxt = self.send.nxt.wrapping_add(len);
        self.retransmit.push(segment);
        if self.timers.retransmit_at.is_none() {
            self.timers.retransmit_at = Some(now + self.timers.rto);
        }
    }

    fn retransmit_oldest(&mut self, now: Instant, signals: &mut Signals) {
        let Some(front) = self.retransmit.front_mut() else {
            self.timers.cancel();
            return;
        };
        front.retransmitted = true;
        let (seq, flags, payload) = (front.seq, front.flags, front.payload.clone());

        self.timers.back_off(self.config.max_rto);
        self.timers.retransmit_at = Some(now + self.timers.rto);
        debug!(
            "[{}] retransmitting seq {} ({} bytes), attempt {}, next rto {:?}",
            self.quad,
            seq,
            payload.len(),
            self.timers.retries,
            self.timers.rto
        );
        signals.segments.push(Segment {
            header: self.header(seq, flags),
            payload,
        });
    }

    fn header(&self, seq: u32, flags: Flags) -> TcpHeader {
        let (src, dst) = (self.quad.local.port(), self.quad.remote.port());
        let mut h = TcpHeader::new(src, dst, seq, self.recv.wnd);
        h.flags = flags;
        if flags.contains(Flags::ACK) {
            h.ack_number = self.recv.nxt;
        }
        h
    }

    /// <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
    fn send_ack(&self, signals: &mut Signals) {
        signals.segments.push(Segment {
            header: self.header(self.send.nxt, Flags::ACK),
            payload: Vec::new(),
        });
    }

    fn reset(&self, seq: u32) -> Segment {
        let mut header = self.header(seq, Flags::RST);
        header.window = 0;
        Segment {
            header,
            payload: Vec::new(),
        }
    }

    fn update_recv_window(&mut self) {
        let room = self.config.recv_buffer.saturating_sub(self.incoming.len());
        self.recv.wnd = std::cmp::min(room, u16::MAX as usize) as u16;
    }

    fn enter_time_wait(&mut self, now: Instant) {
        debug!("[{}] entering TIME_WAIT", self.quad);
        self.state = State::TimeWait;
        self.retransmit.clear();
        self.timers.cancel();
        self.timers.time_wait_until = Some(now + self.config.time_wait());
    }

    /// A passive connection still in the handshake, the owner never heard of it.
    fn is_unaccepted(&self) -> bool {
        self.state == State::SynRcvd && self.open == OpenKind::Passive
    }

    /// Closes without telling the owner.
    fn drop_unaccepted(&mut self) {
        debug!("[{}] SYN_RCVD -> CLOSED, never accepted", self.quad);
        self.state = State::Closed;
        self.incoming.clear();
        self.unsent.clear();
        self.retransmit.clear();
        self.timers.cancel();
    }

    fn teardown(&mut self, event: Event, signals: &mut Signals) {
        debug!("[{}] {:?} -> CLOSED", self.quad, self.state);
        self.state = State::Closed;
        self.incoming.clear();
        self.unsent.clear();
        self.retransmit.clear();
        self.timers.cancel();
        self.timers.time_wait_until = None;
        signals.events.push(event);
    }
}

/// The reply to a segment that matches no connection (RFC 793 S3.4 "Reset
/// Generation", group 1). Never answers an RST.
pub fn reset_for(seg: &TcpHeader, payload_len: usize) -> Option<TcpHeader> {
    if seg.rst() {
        return None;
    }
    let mut rst = TcpHeader::new(seg.dst_port, seg.src_port, 0, 0);
    if seg.ack() {
        rst.seq_number = seg.ack_number;
        rst.flags = Flags::RST;
    } else {
        rst.ack_number = seg.seq_number.wrapping_add(seg.sequence_len(payload_len));
        rst.flags = Flags::RST | Flags::ACK;
    }
    Some(rst)
}
