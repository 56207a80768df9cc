//! Receiver limits shared with the rest of the test session

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Upper bound on the receiver's lifetime, and on any single read
    pub max_runtime: Duration,
    /// Largest client frame accepted before reading stops
    pub max_message_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_runtime: ndt7_proto::MAX_RUNTIME,
            max_message_size: ndt7_proto::MAX_MESSAGE_SIZE,
        }
    }
}

impl ReceiverConfig {
    pub fn new(max_runtime: Duration, max_message_size: usize) -> Self {
        Self {
            max_runtime,
            max_message_size,
        }
    }

    /// Websocket settings to accept the connection with, so the transport
    /// refuses oversized frames before they are buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}
