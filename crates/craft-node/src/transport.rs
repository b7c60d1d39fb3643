//! UDP transport.

use std::net::SocketAddr;
use std::ops::RangeInclusive;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::codec::MAX_DATAGRAM_SIZE;
use crate::error::{NodeError, NodeResult};
use crate::peer::PeerAddr;

/// Ports tried in random-port mode.
pub const RANDOM_PORT_RANGE: RangeInclusive<u16> = 5000..=9000;

/// Bind attempts in random-port mode.
pub const MAX_BIND_ATTEMPTS: u32 = 10;

/// How the transport picks its port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindMode {
    /// Bind exactly this address; failure is fatal.
    Fixed {
        /// Host to bind.
        host: String,
        /// Port to bind.
        port: u16,
    },
    /// Try `first` (or a random port), then random ports until the attempt
    /// budget runs out.
    Random {
        /// Host to bind.
        host: String,
        /// Port for the first attempt.
        first: Option<u16>,
    },
}

/// One received datagram, or the shutdown signal.
#[derive(Debug)]
pub enum Inbound {
    /// Payload and sender.
    Datagram(Vec<u8>, SocketAddr),
    /// The node is stopping.
    Stopped,
}

/// A bound UDP socket.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    local: PeerAddr,
}

impl Transport {
    /// Binds according to `mode`.
    pub async fn bind(mode: BindMode) -> NodeResult<Self> {
        match mode {
            BindMode::Fixed { host, port } => {
                let socket = UdpSocket::bind((host.as_str(), port))
                    .await
                    .map_err(|source| NodeError::Bind {
                        addr: format!("{host}:{port}"),
                        source,
                    })?;
                info!(host = %host, port, "bound fixed address");
                Self::from_socket(socket, host)
            }
            BindMode::Random { host, first } => {
                let mut port = first.unwrap_or_else(random_port);
                for attempt in 1..=MAX_BIND_ATTEMPTS {
                    match UdpSocket::bind((host.as_str(), port)).await {
                        Ok(socket) => {
                            info!(host = %host, port, attempt, "bound UDP socket");
                            return Self::from_socket(socket, host);
                        }
                        Err(e) => {
                            debug!(host = %host, port, attempt, error = %e, "bind failed, retrying");
                            port = random_port();
                        }
                    }
                }
                Err(NodeError::BindExhausted {
                    attempts: MAX_BIND_ATTEMPTS,
                })
            }
        }
    }

    fn from_socket(socket: UdpSocket, host: String) -> NodeResult<Self> {
        let port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            local: PeerAddr::new(host, port),
        })
    }

    /// Address announced to peers: the configured host and the bound port.
    #[must_use]
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    /// Socket address the OS actually bound.
    pub fn socket_addr(&self) -> NodeResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends one datagram. Never retried.
    pub async fn send(&self, bytes: &[u8], peer: &PeerAddr) -> NodeResult<()> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NodeError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket
            .send_to(bytes, (peer.host(), peer.port()))
            .await?;
        Ok(())
    }

    /// Waits for the next datagram or for `shutdown` to turn true.
    ///
    /// Datagrams longer than [`MAX_DATAGRAM_SIZE`] arrive truncated.
    pub async fn receive(&self, shutdown: &mut watch::Receiver<bool>) -> NodeResult<Inbound> {
        if *shutdown.borrow() {
            return Ok(Inbound::Stopped);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    buf.truncate(len);
                    return Ok(Inbound::Datagram(buf, from));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(Inbound::Stopped);
                    }
                }
            }
        }
    }
}

fn random_port() -> u16 {
    rand::thread_rng().gen_range(RANDOM_PORT_RANGE)
}
