use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::errors::{Result, StreamError};
use crate::rtp::ControllerAddress;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Addresses of one session's relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    /// Port the relay socket binds to; the encode process sends its audio
    /// here and the controller talks to it.
    pub bind_port: u16,
    /// Controller audio endpoint.
    pub controller: SocketAddr,
    /// Loopback port of the encode process (RTCP).
    pub local_port1: u16,
    /// Loopback port of the decode process.
    pub local_port2: u16,
}

impl RelayEndpoint {
    pub fn new(bind_port: u16, controller: &ControllerAddress, local_port1: u16, local_port2: u16) -> Self {
        Self {
            bind_port,
            controller: SocketAddr::new(controller.ip, controller.audio_rtp_port),
            local_port1,
            local_port2,
        }
    }
}

/// UDP store-and-forward between the controller and the local pipeline.
///
/// Datagrams from the controller are copied to both loopback ports, anything
/// else is sent on to the controller. Payloads are never modified.
pub struct RtpRelay {
    socket: UdpSocket,
    endpoint: RelayEndpoint,
    controller: SocketAddr,
    local_targets: [SocketAddr; 2],
    buffer_size: usize,
}

impl RtpRelay {
    pub async fn bind(endpoint: RelayEndpoint, config: &RelayConfig) -> Result<Self> {
        let bind_ip = config.bind_address.unwrap_or(match endpoint.controller {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let bind_addr = SocketAddr::new(bind_ip, endpoint.bind_port);

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        if bind_addr.is_ipv6() {
            // the pipeline sends from IPv4 loopback
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&bind_addr.into())
            .map_err(|e| StreamError::relay(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let socket = UdpSocket::from_std(socket.into())?;

        let ipv6 = bind_addr.is_ipv6();
        let loopback = |port| to_family(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), ipv6);
        let local_targets = [loopback(endpoint.local_port1), loopback(endpoint.local_port2)];
        let controller = to_family(endpoint.controller, ipv6);

        Ok(Self {
            socket,
            endpoint,
            controller,
            local_targets,
            buffer_size: config.buffer_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the relay on its own task.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        RelayHandle { shutdown: shutdown_tx, task }
    }

    /// Bind and run in the background. Bind failures are only logged.
    pub fn launch(endpoint: RelayEndpoint, config: RelayConfig) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            match RtpRelay::bind(endpoint.clone(), &config).await {
                Ok(relay) => relay.run(shutdown_rx).await,
                Err(e) => error!("RTP relay on port {} failed to start: {}", endpoint.bind_port, e),
            }
        });
        RelayHandle { shutdown: shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "RTP relay started on {:?}, controller {}, local ports {} and {}",
            self.socket.local_addr().ok(),
            self.endpoint.controller,
            self.endpoint.local_port1,
            self.endpoint.local_port2
        );

        let mut buffer = vec![0u8; self.buffer_size];
        let mut to_local = 0u64;
        let mut to_controller = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        if self.is_controller(source) {
                            for target in self.local_targets {
                                self.send(&buffer[..len], target).await;
                            }
                            to_local += 1;
                        } else {
                            self.send(&buffer[..len], self.controller).await;
                            to_controller += 1;
                        }
                    }
                    Err(e) => warn!("RTP relay receive error: {}", e),
                },
            }
        }

        info!(
            "RTP relay on port {} stopped ({} packets to pipeline, {} to controller)",
            self.endpoint.bind_port, to_local, to_controller
        );
    }

    fn is_controller(&self, source: SocketAddr) -> bool {
        source.port() == self.endpoint.controller.port()
            && source.ip().to_canonical() == self.endpoint.controller.ip().to_canonical()
    }

    async fn send(&self, payload: &[u8], target: SocketAddr) {
        if let Err(e) = self.socket.send_to(payload, target).await {
            // real-time media: drop rather than retry
            debug!("RTP relay dropped {} bytes to {}: {}", payload.len(), target, e);
        }
    }
}

/// IPv4 addresses are written as IPv4-mapped when sending from a
/// dual-stack socket.
fn to_family(addr: SocketAddr, ipv6: bool) -> SocketAddr {
    match (addr, ipv6) {
        (SocketAddr::V4(v4), true) => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
        _ => addr,
    }
}

pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the relay and wait for its socket to close. Takes effect
    /// immediately, without waiting for another datagram.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(STOP_TIMEOUT, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("RTP relay task failed: {}", e),
            Err(_) => {
                warn!("RTP relay did not stop within {:?}, aborting", STOP_TIMEOUT);
                self.task.abort();
            }
        }
    }
}
