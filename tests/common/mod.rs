#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tello_system::DroneConfig;
use tokio::{net::UdpSocket, task::JoinHandle};

/// What the simulated drone does with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// `ok`, sent after the given delay instead of the responder's default
    OkAfter(Duration),
    Text(String),
    Silent,
}

#[derive(Debug, Default)]
struct Ledger {
    log: Vec<String>,
    /// The command the drone is currently "executing"
    outstanding: Option<String>,
    /// Times a new command arrived before the previous one was answered
    overlaps: usize,
}

/// A stand-in for the drone's control endpoint. Records every datagram and
/// answers according to a responder.
pub struct FakeDrone {
    pub addr: SocketAddr,
    ledger: Arc<Mutex<Ledger>>,
    task: JoinHandle<()>,
}

impl FakeDrone {
    /// Answers everything with `ok` right away.
    pub async fn spawn() -> Self {
        Self::with_responder(Duration::ZERO, |_, _| Reply::Ok).await
    }

    /// `respond` is called with each message and the number of times that
    /// exact message has been seen before. Replies are sent after `delay`
    /// unless the responder picks its own.
    pub async fn with_responder<F>(delay: Duration, mut respond: F) -> Self
    where
        F: FnMut(&str, usize) -> Reply + Send + 'static,
    {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let ledger = Arc::new(Mutex::new(Ledger::default()));

        let task = tokio::spawn({
            let ledger = ledger.clone();
            async move {
                let mut buf = vec![0; 1024];

                loop {
                    let (n, from) = match socket.recv_from(&mut buf).await {
                        Ok(res) => res,
                        Err(_) => return,
                    };
                    let msg = String::from_utf8_lossy(&buf[..n]).to_string();

                    // neither is ever answered
                    let unanswered = msg.starts_with("rc ") || msg == "emergency";

                    let seen = {
                        let mut ledger = ledger.lock().unwrap();
                        let seen = ledger.log.iter().filter(|m| **m == msg).count();
                        ledger.log.push(msg.clone());

                        if !unanswered {
                            if let Some(prev) = &ledger.outstanding {
                                if *prev != msg {
                                    ledger.overlaps += 1;
                                }
                            }
                        }

                        seen
                    };

                    if unanswered {
                        continue;
                    }

                    let (text, wait) = match respond(&msg, seen) {
                        Reply::Ok => ("ok".to_owned(), delay),
                        Reply::OkAfter(wait) => ("ok".to_owned(), wait),
                        Reply::Text(text) => (text, delay),
                        Reply::Silent => continue,
                    };

                    ledger.lock().unwrap().outstanding = Some(msg);

                    tokio::spawn({
                        let socket = socket.clone();
                        let ledger = ledger.clone();
                        async move {
                            tokio::time::sleep(wait).await;
                            ledger.lock().unwrap().outstanding = None;
                            let _ = socket.send_to(text.as_bytes(), from).await;
                        }
                    });
                }
            }
        });

        FakeDrone { addr, ledger, task }
    }

    pub fn log(&self) -> Vec<String> {
        self.ledger.lock().unwrap().log.clone()
    }

    pub fn count(&self, msg: &str) -> usize {
        self.log().iter().filter(|m| *m == msg).count()
    }

    pub fn overlaps(&self) -> usize {
        self.ledger.lock().unwrap().overlaps
    }

    /// Polls the log until `f` holds, for up to two seconds.
    pub async fn wait_until(&self, f: impl Fn(&[String]) -> bool) -> bool {
        for _ in 0..200 {
            if f(&self.log()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for FakeDrone {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Loopback config with short timeouts. Every local socket gets an
/// ephemeral port.
pub fn config(drone: SocketAddr) -> DroneConfig {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

    DroneConfig {
        address: drone,
        control_bind: any,
        telemetry_bind: any,
        video_bind: any,
        command_timeout_ms: 200,
        retries: 2,
        handshake_timeout_ms: 200,
        handshake_attempts: 2,
        emergency_repeat: 3,
        dead_channel_after_ms: 5000,
        stream_on_connect: false,
    }
}

/// Sends one datagram from a throwaway socket.
pub async fn send_to(addr: SocketAddr, data: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(data, addr).await.unwrap();
}
