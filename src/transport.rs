use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::UdpSocket;

use crate::{command::HANDSHAKE, config::DroneConfig, error::SessionError};

/// The three UDP endpoints of one session.
pub struct Sockets {
    /// Shared between the dispatcher and fire-and-forget `rc` sends
    pub control: Arc<UdpSocket>,
    pub telemetry: UdpSocket,
    pub video: UdpSocket,
}

/// Where the session's sockets ended up. Differs from the configured
/// addresses when those use port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddrs {
    pub control: SocketAddr,
    pub telemetry: SocketAddr,
    pub video: SocketAddr,
}

impl Sockets {
    pub async fn bind(config: &DroneConfig) -> Result<Self, SessionError> {
        let control = bind("control", config.control_bind).await?;
        let telemetry = bind("telemetry", config.telemetry_bind).await?;
        let video = bind("video", config.video_bind).await?;

        debug!(
            "bound control {:?}, telemetry {:?}, video {:?}",
            control.local_addr()?,
            telemetry.local_addr()?,
            video.local_addr()?
        );

        Ok(Sockets {
            control: Arc::new(control),
            telemetry,
            video,
        })
    }

    pub fn local_addrs(&self) -> io::Result<LocalAddrs> {
        Ok(LocalAddrs {
            control: self.control.local_addr()?,
            telemetry: self.telemetry.local_addr()?,
            video: self.video.local_addr()?,
        })
    }

    /// Puts the drone into SDK mode. Each attempt sends one handshake and
    /// waits up to `timeout` for an `ok`.
    pub async fn handshake(
        &self,
        drone_addr: SocketAddr,
        attempts: u32,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let mut buf = vec![0; 1024];

        for attempt in 1..=attempts {
            debug!("sending handshake (attempt {}/{})", attempt, attempts);
            self.control
                .send_to(HANDSHAKE.as_bytes(), drone_addr)
                .await?;

            let reply = tokio::time::timeout(timeout, async {
                loop {
                    if let Some(reply) = recv_reply(&self.control, drone_addr, &mut buf).await? {
                        return Ok::<_, io::Error>(reply);
                    }
                }
            })
            .await;

            match reply {
                Ok(Ok(reply)) if reply.eq_ignore_ascii_case("ok") => {
                    info!("drone accepted handshake");
                    return Ok(());
                }
                Ok(Ok(reply)) => warn!("drone answered handshake with {:?}", reply),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => debug!("no reply to handshake within {:?}", timeout),
            }
        }

        Err(SessionError::Handshake { attempts, timeout })
    }
}

async fn bind(channel: &'static str, addr: SocketAddr) -> Result<UdpSocket, SessionError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| SessionError::Bind { channel, source })
}

/// Receives one datagram from the control socket. Returns `None` for
/// datagrams that did not come from the drone.
pub(crate) async fn recv_reply(
    socket: &UdpSocket,
    drone_addr: SocketAddr,
    buf: &mut [u8],
) -> io::Result<Option<String>> {
    let (n, addr) = socket.recv_from(buf).await?;

    if addr != drone_addr {
        trace!("ignoring {n} bytes from unexpected address {addr:?}");
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&buf[..n]).trim().to_owned()))
}
