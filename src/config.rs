use std::time::Duration;

/// Tunables shared by every connection of a [`crate::ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Receive buffer size; the advertised window never exceeds it.
    pub recv_buffer: usize,
    /// Maximum number of bytes queued by `send` but not yet acknowledged.
    pub send_buffer: usize,
    /// Largest payload put in a single segment.
    pub mss: u16,
    /// Retransmission timeout before any round trip has been measured.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Retries of the oldest unacknowledged segment before the connection is reset.
    pub max_retransmits: u32,
    /// Maximum segment lifetime. TIME_WAIT lasts twice this long.
    pub msl: Duration,
    pub ephemeral_first: u16,
    pub ephemeral_last: u16,
}

impl Config {
    pub fn time_wait(&self) -> Duration {
        self.msl * 2
    }

    /// The advertised window for an empty receive buffer.
    pub(crate) fn max_window(&self) -> u16 {
        std::cmp::min(self.recv_buffer, u16::MAX as usize) as u16
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_buffer: 4096,
            send_buffer: 4096,
            mss: 1460,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            max_retransmits: 5,
            // 2*MSL is typically 1-4 minutes, 30s keeps TIME_WAIT short enough for testing.
            msl: Duration::from_secs(15),
            ephemeral_first: 49152,
            ephemeral_last: 65535,
        }
    }
}
