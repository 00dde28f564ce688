use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use tokio::{net::UdpSocket, select, sync::watch};
use tokio_util::sync::CancellationToken;

use super::TelemetrySnapshot;
use crate::{
    health::{HealthReporter, StreamHealth},
    task::Task,
};

pub type TelemetrySlot = Arc<watch::Sender<Option<Arc<TelemetrySnapshot>>>>;

/// Listens for state datagrams and publishes the most recent one that
/// parsed.
pub struct TelemetryTask {
    socket: UdpSocket,
    telem_tx: TelemetrySlot,
    health: HealthReporter,
    dead_after: Duration,
}

pub(crate) fn create_task(
    socket: UdpSocket,
    telem_tx: TelemetrySlot,
    health: HealthReporter,
    dead_after: Duration,
) -> TelemetryTask {
    TelemetryTask {
        socket,
        telem_tx,
        health,
        dead_after,
    }
}

#[async_trait]
impl Task for TelemetryTask {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            socket,
            telem_tx,
            health,
            dead_after,
        } = *self;

        let loop_fut = async move {
            let mut buf = vec![0; 2048];

            loop {
                let recv = tokio::time::timeout(dead_after, socket.recv_from(&mut buf)).await;

                let (n, addr) = match recv {
                    Ok(res) => res.context("failed to receive on telemetry channel")?,
                    Err(_) => {
                        if health.set(StreamHealth::Stale) {
                            warn!("no telemetry received for {:?}", dead_after);
                        }
                        continue;
                    }
                };

                trace!("read {n} bytes of telemetry from {addr:?}");

                match TelemetrySnapshot::parse(&buf[..n], Local::now()) {
                    Ok(snapshot) => {
                        if health.set(StreamHealth::Live) {
                            info!("telemetry is live");
                        }
                        telem_tx.send_replace(Some(Arc::new(snapshot)));
                    }
                    Err(err) => {
                        debug!(
                            "dropping malformed telemetry ({}): {:?}",
                            err,
                            String::from_utf8_lossy(&buf[..n])
                        );
                    }
                }
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        select! {
          _ = cancel.cancelled() => {}
          res = loop_fut => { res? }
        }

        Ok(())
    }
}
