//! UDP relay between the race server's plugin protocol and the supervisor.
//!
//! Layout while open:
//! - listener bound to `host:local_port`, receives server events and sends
//!   outbound messages to the server's plugin address
//! - optional forward socket bound to `forward_listen_port`: every server
//!   event is copied to the forward address, and whatever arrives on the
//!   forward socket is relayed back to the server

use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{parse_plugin_address, RelayError, UdpCallback, UdpMessage};

/// Largest datagram the relay reads in one go
const MAX_DATAGRAM: usize = 65_535;

/// Receive buffer requested from the OS. Car update bursts arrive faster
/// than a slow callback drains them.
const RECV_BUFFER_SIZE: usize = 1 << 20;

/// Secondary destination for server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// `host:port` that receives a copy of every server event
    pub address: String,
    /// Local port listening for replies from the forward target
    pub listen_port: u16,
}

impl ForwardTarget {
    /// `None` unless both the address and the listen port are set.
    pub fn from_parts(address: &str, listen_port: u16) -> Option<Self> {
        if address.is_empty() || listen_port == 0 {
            return None;
        }
        Some(Self {
            address: address.to_string(),
            listen_port,
        })
    }
}

pub struct UdpRelay {
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    forward_local_addr: Option<SocketAddr>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpRelay {
    /// Bind the relay and start dispatching inbound messages to `callback`.
    ///
    /// `plugin_address` is where the server listens for plugin messages
    /// (`host:port`); the relay binds `host:local_port` for the server's events.
    pub async fn open(
        plugin_address: &str,
        local_port: u16,
        forward: Option<ForwardTarget>,
        callback: UdpCallback,
    ) -> Result<Self, RelayError> {
        let (host, port) = parse_plugin_address(plugin_address)?;
        let server_addr = resolve(&host, port).await?;

        let socket = Arc::new(bind_udp(SocketAddr::new(server_addr.ip(), local_port))?);
        let local_addr = socket.local_addr().map_err(|source| RelayError::Bind {
            addr: SocketAddr::new(server_addr.ip(), local_port),
            source,
        })?;

        let forward = match forward {
            Some(target) => {
                let (fwd_host, fwd_port) = parse_plugin_address(&target.address)?;
                let fwd_addr = resolve(&fwd_host, fwd_port).await?;
                let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), target.listen_port);
                let fwd_socket = Arc::new(bind_udp(bind_addr)?);
                Some((fwd_socket, fwd_addr))
            }
            None => None,
        };
        let forward_local_addr = forward
            .as_ref()
            .and_then(|(s, _)| s.local_addr().ok());

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        if let Some((fwd_socket, _)) = &forward {
            tasks.push(tokio::spawn(forward_loop(
                fwd_socket.clone(),
                socket.clone(),
                server_addr,
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(receive_loop(
            socket.clone(),
            forward,
            callback,
            shutdown.clone(),
        )));

        tracing::info!(
            "UDP relay listening on {} for server plugin address {}",
            local_addr,
            server_addr
        );

        Ok(Self {
            server_addr,
            local_addr,
            forward_local_addr,
            socket: Mutex::new(Some(socket)),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn forward_local_addr(&self) -> Option<SocketAddr> {
        self.forward_local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_open(&self) -> bool {
        self.lock_socket().is_some()
    }

    /// Send one message to the server's plugin address.
    pub async fn send_message(&self, message: &UdpMessage) -> Result<(), RelayError> {
        let socket = self.lock_socket().clone().ok_or(RelayError::NotOpen)?;
        socket
            .send_to(message.as_bytes(), self.server_addr)
            .await
            .map_err(RelayError::Send)?;
        Ok(())
    }

    /// Stop dispatching and release the sockets. Safe to call more than once.
    pub fn close(&self) -> Result<(), RelayError> {
        let socket = self.lock_socket().take();
        self.shutdown.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        if socket.is_some() {
            tracing::debug!("UDP relay on {} closed", self.local_addr);
        }
        Ok(())
    }

    fn lock_socket(&self) -> std::sync::MutexGuard<'_, Option<Arc<UdpSocket>>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| RelayError::Resolve(format!("{}:{}", host, port)))
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, RelayError> {
    let bind_err = |source| RelayError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::debug!("Could not enlarge UDP receive buffer: {}", e);
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    forward: Option<(Arc<UdpSocket>, SocketAddr)>,
    callback: UdpCallback,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((len, _)) => len,
                Err(e) => {
                    // Windows는 ICMP port unreachable을 recv 에러로 돌려줌, 무시하고 계속
                    tracing::debug!("UDP relay receive error: {}", e);
                    continue;
                }
            },
        };

        let payload = buf[..len].to_vec();

        if let Some((fwd_socket, fwd_addr)) = &forward {
            if let Err(e) = fwd_socket.send_to(&payload, fwd_addr).await {
                tracing::debug!("Could not forward UDP message to {}: {}", fwd_addr, e);
            }
        }

        dispatch(&callback, UdpMessage::new(payload));
    }
}

async fn forward_loop(
    fwd_socket: Arc<UdpSocket>,
    server_socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = fwd_socket.recv_from(&mut buf) => match res {
                Ok((len, _)) => len,
                Err(e) => {
                    tracing::debug!("UDP forward receive error: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = server_socket.send_to(&buf[..len], server_addr).await {
            tracing::debug!("Could not relay forwarded message to server: {}", e);
        }
    }
}

/// Invoke the callback, turning a panic into a logged error so the receive
/// loop keeps running.
fn dispatch(callback: &UdpCallback, message: UdpMessage) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(message))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("UDP callback panicked: {}", reason);
    }
}
