use std::time::Duration;

/// Limits of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Outgoing messages are split into frames of at most this payload size.
    pub max_frame_payload: usize,
    /// Incoming messages larger than this are refused with status 1009.
    pub max_message_size: usize,
    /// How long to wait for the peer to answer a close before dropping the connection.
    pub close_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 16384,
            max_message_size: usize::MAX,
            close_timeout: Duration::from_secs(10),
        }
    }
}

/// Keep-alive pinging of a sub-protocol's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    /// Interval between pings, zero disables pinging.
    pub ping_interval: Duration,
    /// Pings without a pong after which the connection is considered dead.
    pub max_flying_pings: u32,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            max_flying_pings: 3,
        }
    }
}

impl Liveness {
    pub fn disabled() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            max_flying_pings: 0,
        }
    }
}
