use crate::Quad;

/// Everything that can go wrong while handling a datagram or an owner request.
///
/// None of these are fatal to the process: the worst outcome is that one
/// connection is torn down or one datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("segment truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid data offset {0}")]
    InvalidDataOffset(u8),
    #[error("checksum mismatch")]
    Checksum,
    #[error("segment outside of the receive window")]
    SequenceOutOfWindow,
    #[error("acknowledgment for data that was never sent")]
    AckOutOfRange,
    #[error("no connection for {0}")]
    UnknownConnection(Quad),
    #[error("retransmission limit exceeded")]
    RetransmissionLimitExceeded,
    #[error("address {0} already in use")]
    AddrInUse(Quad),
    #[error("connection is closing")]
    ConnectionClosing,
    #[error("connection is not established")]
    NotConnected,
    #[error("no free ephemeral port")]
    PortsExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
