//! Per-connection data: state, sequence spaces, and retransmission bookkeeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::segment::Flags;
use crate::seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    /// States past the handshake, where both initial sequence numbers are known.
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }
}

/// State of the Send Sequence Space (RFC 793 S3.2 F4)
///
/// ```text
///            1         2          3          4
///       ----------|----------|----------|----------
///              SND.UNA    SND.NXT    SND.UNA
///                                   +SND.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers of unacknowledged data
/// 3 - sequence numbers allowed for new data transmission
/// 4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Clone)]
pub struct SendSequenceSpace {
    /// send unacknowledged
    pub una: u32,
    /// send next
    pub nxt: u32,
    /// send window
    pub wnd: u16,
    /// send urgent pointer
    pub up: u16,
    /// segment sequence number used for last window update
    pub wl1: u32,
    /// segment acknowledgment number used for last window update
    pub wl2: u32,
    /// initial send sequence number
    pub iss: u32,
}

impl SendSequenceSpace {
    pub fn new(iss: u32) -> Self {
        Self {
            una: iss,
            nxt: iss,
            wnd: 0,
            up: 0,
            wl1: 0,
            wl2: 0,
            iss,
        }
    }

    /// Sequence numbers sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.nxt.wrapping_sub(self.una)
    }

    /// Applies the window advertised by a segment unless it is older than the
    /// last one taken (RFC 793 S3.9, "ESTABLISHED STATE" ACK processing).
    pub fn update_window(&mut self, seg_seq: u32, seg_ack: u32, seg_wnd: u16) -> bool {
        if !(seq::le(self.una, seg_ack) && seq::le(seg_ack, self.nxt)) {
            return false;
        }
        let fresh =
            seq::lt(self.wl1, seg_seq) || (self.wl1 == seg_seq && seq::le(self.wl2, seg_ack));
        if fresh {
            self.wnd = seg_wnd;
            self.wl1 = seg_seq;
            self.wl2 = seg_ack;
        }
        fresh
    }
}

/// State of the Receive Sequence Space (RFC 793 S3.2 F5)
///
/// ```text
///                1          2          3
///            ----------|----------|----------
///                   RCV.NXT    RCV.NXT
///                             +RCV.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers allowed for new reception
/// 3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Clone)]
pub struct RecvSequenceSpace {
    /// receive next
    pub nxt: u32,
    /// receive window
    pub wnd: u16,
    /// receive urgent pointer
    pub up: u16,
    /// initial receive sequence number
    pub irs: u32,
}

impl RecvSequenceSpace {
    pub fn new(wnd: u16) -> Self {
        Self {
            nxt: 0,
            wnd,
            up: 0,
            irs: 0,
        }
    }

    /// Learns the peer's initial sequence number from its SYN.
    pub fn synchronize(&mut self, irs: u32) {
        self.irs = irs;
        self.nxt = irs.wrapping_add(1);
    }
}

/// A segment that occupies sequence space and has not been fully acknowledged.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub seq: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
    pub sent_at: Instant,
    pub retransmitted: bool,
}

impl InFlight {
    pub fn len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.flags.contains(Flags::FIN) {
            len += 1;
        }
        len
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len())
    }
}

/// Unacknowledged segments in the order they were sent, i.e. by ascending
/// sequence range.
#[derive(Debug, Clone, Default)]
pub struct RetransmitQueue {
    segments: VecDeque<InFlight>,
}

impl RetransmitQueue {
    pub fn push(&mut self, segment: InFlight) {
        self.segments.push_back(segment);
    }

    pub fn front(&self) -> Option<&InFlight> {
        self.segments.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut InFlight> {
        self.segments.front_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Drops everything below `una` and returns the send times of segments
    /// that were acknowledged without ever being retransmitted.
    pub fn acknowledge(&mut self, una: u32) -> Vec<Instant> {
        let mut samples = Vec::new();
        while let Some(front) = self.segments.front_mut() {
            if seq::le(front.end(), una) {
                if !front.retransmitted {
                    samples.push(front.sent_at);
                }
                self.segments.pop_front();
                continue;
            }
            if seq::lt(front.seq, una) {
                // partially acknowledged, SYN goes first if it is still there
                let mut acked = una.wrapping_sub(front.seq);
                if front.flags.contains(Flags::SYN) {
                    front.flags.remove(Flags::SYN);
                    acked -= 1;
                }
                let acked = std::cmp::min(acked as usize, front.payload.len());
                front.payload.drain(..acked);
                front.seq = una;
            }
            break;
        }
        samples
    }
}

/// Retransmission and TIME_WAIT timers, as deadlines.
#[derive(Debug, Clone)]
pub struct Timers {
    pub rto: Duration,
    /// Smoothed round trip time in seconds, `None` until the first sample.
    pub srtt: Option<f64>,
    pub retransmit_at: Option<Instant>,
    pub retries: u32,
    pub time_wait_until: Option<Instant>,
}

impl Timers {
    pub fn new(rto: Duration) -> Self {
        Self {
            rto,
            srtt: None,
            retransmit_at: None,
            retries: 0,
            time_wait_until: None,
        }
    }

    pub fn cancel(&mut self) {
        self.retransmit_at = None;
        self.retries = 0;
    }

    pub fn sample(&mut self, rtt: Duration, min: Duration, max: Duration) {
        let rtt = rtt.as_secs_f64();
        let srtt = match self.srtt {
            Some(srtt) => 0.8 * srtt + (1.0 - 0.8) * rtt,
            None => rtt,
        };
        self.srtt = Some(srtt);
        self.rto = Duration::from_secs_f64(2.0 * srtt).clamp(min, max);
    }

    pub fn back_off(&mut self, max: Duration) {
        self.rto = std::cmp::min(self.rto * 2, max);
        self.retries += 1;
    }
}
