//! UDP transport to the charging station
//!
//! The wire protocol has no request id, so the transport owns the only socket
//! and keeps at most one command in flight. Commands queue FIFO on a channel;
//! a single worker task sends one, then reads datagrams until one matches the
//! command's [`Expectation`] or the deadline passes. Everything else that
//! arrives (broadcasts, late answers) is forwarded to subscribers and the wait
//! continues.

use crate::config::DeviceConfig;
use crate::error::{HeliosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::protocol::{DeviceCommand, Response, decode};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout_at};

/// Datagrams from the station are small; this leaves plenty of room
const MAX_DATAGRAM: usize = 2048;

const QUEUE_DEPTH: usize = 32;
const BROADCAST_DEPTH: usize = 64;

/// Round trip to the charging station
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Send `command` to the station at `address` (`host` or `host:port`) and
    /// wait for its answer.
    async fn request(&self, address: &str, command: DeviceCommand) -> Result<Response>;
}

/// One pending command
struct QueueEntry {
    target: SocketAddr,
    command: DeviceCommand,
    resolver: oneshot::Sender<Result<Response>>,
}

/// Queue-backed UDP transport
pub struct DeviceTransport {
    queue_tx: mpsc::Sender<QueueEntry>,
    broadcast_tx: broadcast::Sender<Response>,
    local_addr: SocketAddr,
    default_port: u16,
}

impl DeviceTransport {
    /// Bind the socket and start the worker task
    pub async fn bind(config: &DeviceConfig) -> Result<Self> {
        let logger = get_logger("transport");
        let socket = UdpSocket::bind(&config.bind_address).await.map_err(|e| {
            HeliosError::transport(format!("cannot bind {}: {}", config.bind_address, e))
        })?;
        let local_addr = socket.local_addr()?;
        logger.info(&format!("Listening for charging station datagrams on {}", local_addr));

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_DEPTH);

        let worker = Worker {
            socket,
            queue_rx,
            broadcast_tx: broadcast_tx.clone(),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            buf: vec![0u8; MAX_DATAGRAM],
            logger,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            queue_tx,
            broadcast_tx,
            local_addr,
            default_port: config.port,
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams that did not answer a pending command
    pub fn subscribe(&self) -> broadcast::Receiver<Response> {
        self.broadcast_tx.subscribe()
    }

    /// Queue `command` for `target` and wait for its answer
    pub async fn send(&self, target: SocketAddr, command: DeviceCommand) -> Result<Response> {
        let (resolver, answer) = oneshot::channel();
        self.queue_tx
            .send(QueueEntry {
                target,
                command,
                resolver,
            })
            .await
            .map_err(|_| HeliosError::transport("transport worker has stopped"))?;
        answer
            .await
            .map_err(|_| HeliosError::transport("transport worker dropped the request"))?
    }

    async fn resolve(&self, address: &str) -> Result<SocketAddr> {
        let address = address.trim();
        if address.is_empty() {
            return Err(HeliosError::DeviceNotConfigured);
        }
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let host_port = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, self.default_port)
        };
        tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| HeliosError::transport(format!("cannot resolve {}: {}", address, e)))?
            .next()
            .ok_or_else(|| HeliosError::transport(format!("{} resolved to no address", address)))
    }
}

#[async_trait]
impl DeviceLink for DeviceTransport {
    async fn request(&self, address: &str, command: DeviceCommand) -> Result<Response> {
        let target = self.resolve(address).await?;
        self.send(target, command).await
    }
}

enum Event {
    Command(Option<QueueEntry>),
    Datagram(std::io::Result<(usize, SocketAddr)>),
}

struct Worker {
    socket: UdpSocket,
    queue_rx: mpsc::Receiver<QueueEntry>,
    broadcast_tx: broadcast::Sender<Response>,
    response_timeout: Duration,
    cooldown: Duration,
    buf: Vec<u8>,
    logger: StructuredLogger,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                entry = self.queue_rx.recv() => Event::Command(entry),
                received = self.socket.recv_from(&mut self.buf) => Event::Datagram(received),
            };
            match event {
                Event::Command(Some(entry)) => self.dispatch(entry).await,
                Event::Command(None) => break,
                Event::Datagram(Ok((len, src))) => {
                    let response = decode(&self.buf[..len]);
                    self.forward(response, src);
                }
                Event::Datagram(Err(e)) => {
                    self.logger.warn(&format!("UDP receive error: {}", e));
                }
            }
        }
        self.logger.debug("Transport queue closed, worker exiting");
    }

    /// Send one command and hold the slot until it is answered or times out
    async fn dispatch(&mut self, entry: QueueEntry) {
        let QueueEntry {
            target,
            command,
            resolver,
        } = entry;
        let expectation = command.expectation();
        let wire = format!("{}\n", command.to_wire());

        self.logger.debug(&format!("-> {} {}", target, command));
        if let Err(e) = self.socket.send_to(wire.as_bytes(), target).await {
            let _ = resolver.send(Err(HeliosError::transport(format!(
                "send '{}' to {} failed: {}",
                command, target, e
            ))));
            return;
        }

        let deadline = Instant::now() + self.response_timeout;
        let outcome = loop {
            match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await {
                Err(_) => {
                    break Err(HeliosError::transport_timeout(format!(
                        "no answer to '{}' from {} within {}ms",
                        command,
                        target,
                        self.response_timeout.as_millis()
                    )));
                }
                Ok(Err(e)) => {
                    break Err(HeliosError::transport(format!("receive failed: {}", e)));
                }
                Ok(Ok((len, src))) => {
                    let response = decode(&self.buf[..len]);
                    if src.ip() == target.ip() && expectation.matches(&response) {
                        self.logger.debug(&format!("<- {} answered '{}'", src, command));
                        break match response {
                            Response::Rejected(text) => Err(HeliosError::device_rejected(format!(
                                "'{}' answered with {}",
                                command, text
                            ))),
                            other => Ok(other),
                        };
                    }
                    self.forward(response, src);
                }
            }
        };

        let timed_out = matches!(outcome, Err(HeliosError::TransportTimeout { .. }));
        if let Err(ref e) = outcome {
            self.logger.warn(&e.to_string());
        }
        let _ = resolver.send(outcome);

        if timed_out && !self.cooldown.is_zero() {
            sleep(self.cooldown).await;
        }
    }

    fn forward(&self, response: Response, src: SocketAddr) {
        self.logger.trace(&format!("Unsolicited datagram from {}: {:?}", src, response));
        // No subscribers is fine
        let _ = self.broadcast_tx.send(response);
    }
}
