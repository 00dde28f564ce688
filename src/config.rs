use std::{net::SocketAddr, path::PathBuf, time::Duration};

use config::{Config, ConfigError};
use serde::Deserialize;

/// Network addresses and protocol timing for one drone. Defaults match a
/// Tello reached over its own access point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Where commands are sent, and the only address replies are accepted
    /// from.
    pub address: SocketAddr,

    /// Local address of the control socket.
    pub control_bind: SocketAddr,

    /// Local address the drone pushes telemetry to.
    pub telemetry_bind: SocketAddr,

    /// Local address the drone pushes video to.
    pub video_bind: SocketAddr,

    /// How long to wait for a reply to each send of a command
    pub command_timeout_ms: u64,

    /// How many times a command is re-sent after its first send times out
    pub retries: u32,

    /// How long to wait for a reply to each handshake attempt
    pub handshake_timeout_ms: u64,

    pub handshake_attempts: u32,

    /// How many copies of the emergency stop are sent
    pub emergency_repeat: u32,

    /// A stream that has been silent this long is reported as stale
    pub dead_channel_after_ms: u64,

    /// Ask the drone to start streaming video as soon as the session connects
    pub stream_on_connect: bool,
}

impl Default for DroneConfig {
    fn default() -> Self {
        DroneConfig {
            address: ([192, 168, 10, 1], 8889).into(),
            control_bind: ([0, 0, 0, 0], 8889).into(),
            telemetry_bind: ([0, 0, 0, 0], 8890).into(),
            video_bind: ([0, 0, 0, 0], 11111).into(),
            command_timeout_ms: 7000,
            retries: 2,
            handshake_timeout_ms: 2000,
            handshake_attempts: 5,
            emergency_repeat: 3,
            dead_channel_after_ms: 5000,
            stream_on_connect: true,
        }
    }
}

impl DroneConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dead_channel_after(&self) -> Duration {
        Duration::from_millis(self.dead_channel_after_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory the command journal is written to on close. No journal file
    /// is written if this is unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FacesConfig {
    /// Saved face encodings to load at startup
    pub store: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelloSystemConfig {
    pub drone: DroneConfig,
    pub journal: JournalConfig,
    pub faces: FacesConfig,
}

impl TelloSystemConfig {
    pub fn read_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(config::File::from(path))?;
        c.merge(config::Environment::with_prefix("TELLO_SYSTEM").separator("__"))?;

        c.try_into()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[drone]\naddress = \"127.0.0.1:9000\"\nretries = 5\n\n[journal]\ndir = \"logs\""
        )
        .unwrap();

        let config = TelloSystemConfig::read_from_path(file.path().to_owned()).unwrap();

        assert_eq!(config.drone.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.drone.retries, 5);
        assert_eq!(config.drone.handshake_attempts, 5);
        assert_eq!(config.drone.telemetry_bind.port(), 8890);
        assert_eq!(config.journal.dir, Some(PathBuf::from("logs")));
        assert!(config.faces.store.is_none());
    }
}
