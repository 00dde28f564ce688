use serde::Serialize;

/// Lifecycle of a [`super::Drone`]. Moves strictly forward, except that a
/// failed handshake returns the session to `Disconnected` so it can try
/// again.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}
