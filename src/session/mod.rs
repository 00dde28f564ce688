//! One connection to one drone.
//!
//! A [`Drone`] owns the three sockets and the background loops that serve
//! them. Callers issue commands and read the latest telemetry and video
//! frame through it; every method takes `&self`, so the session can be
//! shared behind an `Arc` between a control loop and a display.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    net::UdpSocket,
    select,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{
        self, command_queue, Command, CommandHandle, CommandQueue, CommandSource,
        DispatchSettings, RcVector,
    },
    config::DroneConfig,
    error::{CommandError, SessionError},
    health::{HealthReporter, LinkHealth, Stream},
    journal::Journal,
    task::Task,
    telemetry::{self, TelemetrySlot, TelemetrySnapshot},
    transport::{LocalAddrs, Sockets},
    video::{self, FrameDecoder, FrameSlot, PassthroughDecoder, VideoFrame},
};

mod state;

pub use state::*;

pub struct Drone {
    config: DroneConfig,
    journal_dir: Option<PathBuf>,

    state_tx: Arc<watch::Sender<ConnectionState>>,
    telem_tx: TelemetrySlot,
    frame_tx: FrameSlot,
    health_tx: Arc<watch::Sender<LinkHealth>>,
    journal: Journal,

    cancel: CancellationToken,
    decoder: Mutex<Option<Box<dyn FrameDecoder>>>,
    running: Mutex<Option<Running>>,
}

/// Everything that only exists while the session is up.
struct Running {
    queue: CommandQueue,
    source: CommandSource,
    control: Arc<UdpSocket>,
    drone_addr: SocketAddr,
    local_addrs: LocalAddrs,
    supervisor: Option<JoinHandle<()>>,
}

impl Drone {
    /// Creates a session that forwards video without decoding it.
    pub fn new(config: DroneConfig) -> Self {
        Self::with_decoder(config, PassthroughDecoder::default())
    }

    pub fn with_decoder(config: DroneConfig, decoder: impl FrameDecoder) -> Self {
        Drone {
            config,
            journal_dir: None,
            state_tx: Arc::new(watch::channel(ConnectionState::Disconnected).0),
            telem_tx: Arc::new(watch::channel(None).0),
            frame_tx: Arc::new(watch::channel(None).0),
            health_tx: Arc::new(watch::channel(LinkHealth::default()).0),
            journal: Journal::new(),
            cancel: CancellationToken::new(),
            decoder: Mutex::new(Some(Box::new(decoder))),
            running: Mutex::new(None),
        }
    }

    /// Writes the command journal into `dir` when the session closes.
    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Binds the sockets and performs the handshake. On success the
    /// background loops are running and commands can be issued; on failure
    /// the session is back to [`ConnectionState::Disconnected`].
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut current = ConnectionState::Disconnected;
        let started = self.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        if !started {
            return Err(SessionError::InvalidState(current));
        }

        info!("connecting to drone at {:?}", self.config.address);

        let (sockets, local_addrs) = match self.establish().await {
            Ok(established) => established,
            Err(err) => {
                warn!("failed to connect: {}", err);
                self.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                return Err(err);
            }
        };

        let (queue, source) = command_queue();
        let Sockets {
            control,
            telemetry,
            video,
        } = sockets;

        let decoder = self
            .lock_decoder()
            .take()
            .unwrap_or_else(|| Box::new(PassthroughDecoder::default()));

        let tasks: Vec<Box<dyn Task + Send>> = vec![
            Box::new(command::create_task(
                control.clone(),
                self.config.address,
                source.clone(),
                DispatchSettings {
                    timeout: self.config.command_timeout(),
                    retries: self.config.retries,
                    emergency_repeat: self.config.emergency_repeat,
                },
                self.state_tx.subscribe(),
                self.journal.clone(),
            )),
            Box::new(telemetry::create_task(
                telemetry,
                self.telem_tx.clone(),
                HealthReporter::new(self.health_tx.clone(), Stream::Telemetry),
                self.config.dead_channel_after(),
            )),
            Box::new(video::create_task(
                video,
                decoder,
                self.frame_tx.clone(),
                HealthReporter::new(self.health_tx.clone(), Stream::Video),
                self.config.dead_channel_after(),
            )),
        ];

        let supervisor = tokio::spawn(supervise(
            tasks,
            self.cancel.clone(),
            self.state_tx.clone(),
        ));

        *self.lock_running() = Some(Running {
            queue: queue.clone(),
            source,
            control,
            drone_addr: self.config.address,
            local_addrs,
            supervisor: Some(supervisor),
        });

        // close() may have run while the handshake was in progress, in which
        // case the loops were started with a cancelled token
        let connected = self.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });

        if !connected {
            let running = self.lock_running().take();
            if let Some(mut running) = running {
                if let Some(supervisor) = running.supervisor.take() {
                    let _ = supervisor.await;
                }
            }
            return Err(SessionError::InvalidState(current));
        }

        info!("connected");

        if self.config.stream_on_connect {
            match queue.enqueue(Command::StreamOn) {
                Ok(handle) => {
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(_) => info!("video stream enabled"),
                            Err(err) => warn!("failed to enable video stream: {}", err),
                        }
                    });
                }
                Err(err) => warn!("failed to enable video stream: {}", err),
            }
        }

        Ok(())
    }

    async fn establish(&self) -> Result<(Sockets, LocalAddrs), SessionError> {
        let sockets = Sockets::bind(&self.config).await?;
        let local_addrs = sockets.local_addrs()?;

        sockets
            .handshake(
                self.config.address,
                self.config.handshake_attempts,
                self.config.handshake_timeout(),
            )
            .await?;

        Ok((sockets, local_addrs))
    }

    /// Queues a command. Returns as soon as the command is queued; await the
    /// handle for the drone's answer.
    pub fn issue(&self, command: Command) -> Result<CommandHandle, CommandError> {
        command.validate()?;

        let running = self.lock_running();
        let running = match running.as_ref() {
            Some(running) if self.state().is_connected() => running,
            _ => return Err(CommandError::NotConnected),
        };

        let handle = running.queue.enqueue(command)?;

        // lost a race with close(); the dispatcher may already be gone
        if !self.state().is_connected() {
            running.source.flush(|| Err(CommandError::Cancelled));
        }

        Ok(handle)
    }

    /// Sends stick positions straight to the drone. Not queued and not
    /// acknowledged.
    pub async fn rc(&self, rc: RcVector) -> Result<(), CommandError> {
        let (control, drone_addr) = {
            let running = self.lock_running();
            match running.as_ref() {
                Some(running) if self.state().is_connected() => {
                    (running.control.clone(), running.drone_addr)
                }
                _ => return Err(CommandError::NotConnected),
            }
        };

        trace!("sending '{}'", rc);

        control
            .send_to(rc.to_string().as_bytes(), drone_addr)
            .await
            .map_err(|err| {
                warn!("failed to send rc command: {}", err);
                CommandError::ConnectionLost
            })?;

        Ok(())
    }

    /// Waits until every command issued so far has an outcome. Returns
    /// `Cancelled` if the session shuts down first.
    pub async fn complete(&self) -> Result<(), CommandError> {
        let pending = match self.lock_running().as_ref() {
            Some(running) => running.queue.pending().clone(),
            None => return Ok(()),
        };

        select! {
            biased;
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
            _ = pending.idle() => Ok(()),
        }
    }

    /// Stops the background loops and releases the sockets. Commands that
    /// have no outcome yet resolve as `Cancelled`. Calling this again, or on
    /// a session that never connected, is harmless.
    pub async fn close(&self) {
        self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connected => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                *state = ConnectionState::Closed;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });

        self.cancel.cancel();

        let running = self.lock_running().take();

        let mut running = match running {
            Some(running) => running,
            None => {
                // another caller is doing the teardown
                let mut state_rx = self.state_tx.subscribe();
                let _ = state_rx.wait_for(|s| *s == ConnectionState::Closed).await;
                return;
            }
        };

        info!("closing session");

        if let Some(supervisor) = running.supervisor.take() {
            if let Err(err) = supervisor.await {
                error!("session supervisor failed: {}", err);
            }
        }

        let flushed = running.source.flush(|| Err(CommandError::Cancelled));
        if flushed > 0 {
            debug!("cancelled {flushed} commands issued during shutdown");
        }

        if let Some(dir) = &self.journal_dir {
            match self.journal.save(dir).await {
                Ok(path) => info!("wrote command journal to {}", path.display()),
                Err(err) => warn!("failed to write command journal: {:#}", err),
            }
        }

        drop(running);

        self.state_tx.send_replace(ConnectionState::Closed);
        info!("session closed");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn latest_telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.telem_tx.borrow().clone()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.telem_tx.subscribe()
    }

    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.frame_tx.borrow().clone()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.frame_tx.subscribe()
    }

    pub fn health(&self) -> LinkHealth {
        *self.health_tx.borrow()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Addresses the sockets are bound to, while connected.
    pub fn local_addrs(&self) -> Option<LocalAddrs> {
        self.lock_running().as_ref().map(|r| r.local_addrs)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_decoder(&self) -> MutexGuard<'_, Option<Box<dyn FrameDecoder>>> {
        self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs the session's loops until they all exit. If any of them fails, the
/// connection is considered lost and the rest are cancelled.
async fn supervise(
    tasks: Vec<Box<dyn Task + Send>>,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    let mut join_set = JoinSet::new();

    for task in tasks {
        let name = task.name();
        debug!("starting {} task", name);
        join_set.spawn({
            let cancel = cancel.clone();
            async move { (name, task.run(cancel).await) }
        });
    }

    while let Some(res) = join_set.join_next().await {
        let failed = match res {
            Err(err) => {
                error!("session task panicked: {}", err);
                true
            }
            Ok((name, Err(err))) => {
                error!("{} task terminated with error: {:#}", name, err);
                true
            }
            Ok((name, Ok(()))) => {
                debug!("{} task exited", name);
                false
            }
        };

        if failed {
            state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Closed;
                    true
                } else {
                    false
                }
            });
            cancel.cancel();
        }
    }
}
