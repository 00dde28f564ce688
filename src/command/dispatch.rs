use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use tokio::{
    net::UdpSocket,
    select,
    sync::watch,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use super::{Ack, CommandRequest, CommandResult, CommandSource};
use crate::{
    error::CommandError,
    journal::{Journal, JournalEntry},
    session::ConnectionState,
    task::Task,
    transport::recv_reply,
};

/// Timing knobs for the dispatcher, taken from [`crate::DroneConfig`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub retries: u32,
    pub emergency_repeat: u32,
}

/// Sends queued commands one at a time and waits for each reply before
/// moving on.
pub struct DispatchTask {
    socket: Arc<UdpSocket>,
    drone_addr: SocketAddr,
    source: CommandSource,
    settings: DispatchSettings,
    state_rx: watch::Receiver<ConnectionState>,
    journal: Journal,
}

pub fn create_task(
    socket: Arc<UdpSocket>,
    drone_addr: SocketAddr,
    source: CommandSource,
    settings: DispatchSettings,
    state_rx: watch::Receiver<ConnectionState>,
    journal: Journal,
) -> DispatchTask {
    DispatchTask {
        socket,
        drone_addr,
        source,
        settings,
        state_rx,
        journal,
    }
}

enum Exchange {
    Done {
        result: CommandResult,
        reply: Option<String>,
        attempts: u32,
    },
    Interrupted(CommandRequest),
    Cancelled,
}

struct Dispatcher {
    socket: Arc<UdpSocket>,
    drone_addr: SocketAddr,
    source: CommandSource,
    settings: DispatchSettings,
    journal: Journal,
    buf: Vec<u8>,
}

#[async_trait]
impl Task for DispatchTask {
    fn name(&self) -> &'static str {
        "command/dispatch"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            socket,
            drone_addr,
            source,
            settings,
            state_rx,
            journal,
        } = *self;

        let mut dispatcher = Dispatcher {
            socket,
            drone_addr,
            source,
            settings,
            journal,
            buf: vec![0; 1024],
        };

        let res = dispatcher.run(&cancel).await;

        // a session that is closing on purpose cancels; anything else means
        // the link went away underneath us
        let reason = match (&res, *state_rx.borrow()) {
            (Ok(_), ConnectionState::Closing) => CommandError::Cancelled,
            _ => CommandError::ConnectionLost,
        };

        let in_flight = match res {
            Ok(in_flight) => in_flight,
            Err(err) => {
                dispatcher.source.flush(|| Err(reason.clone()));
                return Err(err);
            }
        };
        if let Some(request) = in_flight {
            debug!("command #{} interrupted by shutdown", request.seq);
            request.resolve(Err(reason.clone()));
        }

        let flushed = dispatcher.source.flush(|| Err(reason.clone()));
        if flushed > 0 {
            debug!("dropped {flushed} queued commands on shutdown ({reason})");
        }

        Ok(())
    }
}

impl Dispatcher {
    /// Runs until cancelled. Returns the request that was in flight at that
    /// moment, if any, still unresolved.
    async fn run(
        &mut self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<CommandRequest>> {
        loop {
            let request = select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                req = self.source.emergency_rx.recv_async() => match req {
                    Ok(req) => {
                        self.emergency(req, None).await?;
                        continue;
                    }
                    Err(_) => return Ok(None),
                },
                req = self.source.queue_rx.recv_async() => match req {
                    Ok(req) => req,
                    Err(_) => return Ok(None),
                },
            };

            let sent_at = Local::now();

            let exchange = match self.exchange(&request, cancel).await {
                Ok(exchange) => exchange,
                Err(err) => {
                    request.resolve(Err(CommandError::ConnectionLost));
                    return Err(err);
                }
            };

            match exchange {
                Exchange::Done {
                    result,
                    reply,
                    attempts,
                } => {
                    self.journal.record(JournalEntry {
                        seq: Some(request.seq),
                        message: request.command.to_string(),
                        reply,
                        outcome: match &result {
                            Ok(_) => "ok".to_owned(),
                            Err(err) => err.to_string(),
                        },
                        attempts,
                        sent_at,
                        resolved_at: Local::now(),
                    });
                    request.resolve(result);
                }
                Exchange::Interrupted(emergency) => {
                    self.emergency(emergency, Some(request)).await?;
                }
                Exchange::Cancelled => return Ok(Some(request)),
            }
        }
    }

    /// Sends one command and waits for its reply, re-sending on timeout.
    async fn exchange(
        &mut self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Exchange> {
        let message = request.command.to_string();
        let attempts = self.settings.retries.saturating_add(1);

        self.discard_stale();

        for attempt in 1..=attempts {
            debug!(
                "sending command #{} '{}' (attempt {}/{})",
                request.seq, message, attempt, attempts
            );
            self.send(&message).await?;

            let deadline = Instant::now() + self.settings.timeout;

            loop {
                select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(Exchange::Cancelled),
                    req = self.source.emergency_rx.recv_async() => match req {
                        Ok(req) => return Ok(Exchange::Interrupted(req)),
                        Err(_) => return Ok(Exchange::Cancelled),
                    },
                    _ = sleep_until(deadline) => {
                        debug!("command #{} timed out waiting for reply", request.seq);
                        break;
                    }
                    reply = recv_reply(&self.socket, self.drone_addr, &mut self.buf) => {
                        let reply = match reply.context("failed to receive on control channel")? {
                            Some(reply) => reply,
                            None => continue,
                        };

                        let result = if reply.eq_ignore_ascii_case("ok") {
                            Ok(Ack { reply: reply.clone(), attempts: attempt })
                        } else {
                            warn!("drone rejected '{}': {}", message, reply);
                            Err(CommandError::Rejected(reply.clone()))
                        };

                        return Ok(Exchange::Done {
                            result,
                            reply: Some(reply),
                            attempts: attempt,
                        });
                    }
                }
            }
        }

        warn!(
            "command #{} '{}' was not acknowledged after {} attempts",
            request.seq, message, attempts
        );

        Ok(Exchange::Done {
            result: Err(CommandError::AckTimeout { attempts }),
            reply: None,
            attempts,
        })
    }

    /// Sends the emergency stop immediately and throws away everything that
    /// was waiting to be sent.
    async fn emergency(
        &mut self,
        request: CommandRequest,
        in_flight: Option<CommandRequest>,
    ) -> anyhow::Result<()> {
        let message = request.command.to_string();
        let sent_at = Local::now();
        let repeat = self.settings.emergency_repeat.max(1);

        for _ in 0..repeat {
            if let Err(err) = self.send(&message).await {
                request.resolve(Err(CommandError::ConnectionLost));
                if let Some(r) = in_flight {
                    r.resolve(Err(CommandError::ConnectionLost));
                }
                return Err(err);
            }
        }

        warn!("emergency stop sent");

        if let Some(r) = in_flight {
            r.resolve(Err(CommandError::Superseded));
        }

        let mut flushed = 0;
        for r in self.source.queue_rx.drain() {
            r.resolve(Err(CommandError::Superseded));
            flushed += 1;
        }
        if flushed > 0 {
            info!("emergency stop superseded {flushed} queued commands");
        }

        self.journal.record(JournalEntry {
            seq: Some(request.seq),
            message,
            reply: None,
            outcome: "ok".to_owned(),
            attempts: repeat,
            sent_at,
            resolved_at: Local::now(),
        });

        request.resolve(Ok(Ack {
            reply: String::new(),
            attempts: repeat,
        }));

        Ok(())
    }

    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(message.as_bytes(), self.drone_addr)
            .await
            .context("failed to send on control channel")?;

        Ok(())
    }

    /// Drops replies that arrived after their command was already resolved,
    /// so they are not mistaken for the next command's reply.
    fn discard_stale(&mut self) {
        while let Ok((n, addr)) = self.socket.try_recv_from(&mut self.buf) {
            debug!(
                "discarding stale reply {:?} from {:?}",
                String::from_utf8_lossy(&self.buf[..n]),
                addr
            );
        }
    }
}
