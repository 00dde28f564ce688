use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use tokio::{net::UdpSocket, select, sync::watch};
use tokio_util::sync::CancellationToken;

use super::{h264::AccessUnitAssembler, FrameDecoder, VideoFrame};
use crate::{
    health::{HealthReporter, StreamHealth},
    task::Task,
};

pub type FrameSlot = Arc<watch::Sender<Option<Arc<VideoFrame>>>>;

/// Reassembles the video stream and publishes the most recent decoded
/// frame.
pub struct VideoTask {
    socket: UdpSocket,
    decoder: Box<dyn FrameDecoder>,
    frame_tx: FrameSlot,
    health: HealthReporter,
    dead_after: Duration,
}

pub(crate) fn create_task(
    socket: UdpSocket,
    decoder: Box<dyn FrameDecoder>,
    frame_tx: FrameSlot,
    health: HealthReporter,
    dead_after: Duration,
) -> VideoTask {
    VideoTask {
        socket,
        decoder,
        frame_tx,
        health,
        dead_after,
    }
}

#[async_trait]
impl Task for VideoTask {
    fn name(&self) -> &'static str {
        "video"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            socket,
            mut decoder,
            frame_tx,
            health,
            dead_after,
        } = *self;

        let loop_fut = async move {
            let mut assembler = AccessUnitAssembler::new();
            let mut buf = vec![0; 2048];
            let mut last_seq = None;

            loop {
                let recv = tokio::time::timeout(dead_after, socket.recv_from(&mut buf)).await;

                let (n, _) = match recv {
                    Ok(res) => res.context("failed to receive on video channel")?,
                    Err(_) => {
                        if health.set(StreamHealth::Stale) {
                            warn!("no video received for {:?}", dead_after);
                            // whatever was buffered will never be completed
                            assembler.reset();
                        }
                        continue;
                    }
                };

                if health.set(StreamHealth::Live) {
                    info!("video is live");
                }

                for unit in assembler.push(&buf[..n]) {
                    let image = match decoder.decode(&unit) {
                        Ok(Some(image)) => image,
                        Ok(None) => continue,
                        Err(err) => {
                            debug!("dropping access unit #{}: {}", unit.seq, err);
                            continue;
                        }
                    };

                    if let Some(last) = last_seq {
                        if unit.seq > last + 1 {
                            trace!("skipped {} access units", unit.seq - last - 1);
                        }
                    }
                    last_seq = Some(unit.seq);

                    frame_tx.send_replace(Some(Arc::new(VideoFrame {
                        image,
                        seq: unit.seq,
                        keyframe: unit.keyframe,
                        received_at: Local::now(),
                    })));
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
