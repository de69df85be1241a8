use std::time::Duration;

/// Liveness and sizing tunables applied at connection construction. No
/// dynamic reconfiguration.
///
/// `ping_period` must stay below `pong_wait` so that, absent network loss,
/// at least one pong lands inside every read-deadline window.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Per-frame write deadline window.
    pub write_wait: Duration,
    /// Read-idle window; exceeded, the reader exits.
    pub pong_wait: Duration,
    /// Interval between outbound pings.
    pub ping_period: Duration,
    /// Upper bound on inbound WebSocket frame size in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            // 0.9 x pong_wait
            ping_period: pong_wait * 9 / 10,
            max_message_size: 512,
        }
    }
}

impl ConnectionOptions {
    pub fn with_write_wait(mut self, d: Duration) -> Self {
        self.write_wait = d;
        self
    }

    pub fn with_pong_wait(mut self, d: Duration) -> Self {
        self.pong_wait = d;
        self
    }

    pub fn with_ping_period(mut self, d: Duration) -> Self {
        self.ping_period = d;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}
