use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum StreamHealth {
    /// Nothing has arrived yet.
    #[default]
    Waiting,
    Live,
    /// Nothing has arrived for longer than the dead-channel threshold.
    Stale,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct LinkHealth {
    pub telemetry: StreamHealth,
    pub video: StreamHealth,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum Stream {
    Telemetry,
    Video,
}

/// Shared writer for [`LinkHealth`]. The telemetry and video loops each
/// update their own half.
#[derive(Debug, Clone)]
pub(crate) struct HealthReporter {
    tx: Arc<watch::Sender<LinkHealth>>,
    stream: Stream,
}

impl HealthReporter {
    pub fn new(tx: Arc<watch::Sender<LinkHealth>>, stream: Stream) -> Self {
        HealthReporter { tx, stream }
    }

    /// Records a change and returns whether it was one.
    pub fn set(&self, health: StreamHealth) -> bool {
        let stream = self.stream;

        self.tx.send_if_modified(|link| {
            let slot = match stream {
                Stream::Telemetry => &mut link.telemetry,
                Stream::Video => &mut link.video,
            };

            if *slot == health {
                false
            } else {
                *slot = health;
                true
            }
        })
    }
}
