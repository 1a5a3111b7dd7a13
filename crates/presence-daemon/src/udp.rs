//! UDP transport for the discovery engine.
//!
//! One long-lived broadcast-capable socket. A background task reads
//! datagrams into an unbounded channel so the engine can drain them
//! without blocking on its tick.

use presence_core::transport::{Datagram, Result, Transport, TransportError};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Largest datagram we read. Anything longer is truncated by the socket.
const MAX_DATAGRAM_SIZE: usize = 65_507;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Destination port for every send
    port: u16,
    rx: mpsc::UnboundedReceiver<Datagram>,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind on every interface at `port` and send to the same port.
    pub async fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await
    }

    /// Bind to a specific address. Port 0 picks an ephemeral port, which then
    /// becomes the destination port too.
    pub async fn bind_addr(addr: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| TransportError::BindFailed(format!("SO_BROADCAST: {}", e)))?;
        let port = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let recv_task = tokio::spawn(Self::recv_loop(Arc::clone(&socket), tx));

        debug!("UDP transport bound on {} (port {})", addr, port);
        Ok(Self {
            socket,
            port,
            rx,
            recv_task,
        })
    }

    async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Datagram>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, SocketAddr::V4(from))) => {
                    let datagram = Datagram {
                        from: *from.ip(),
                        data: buf[..n].to_vec(),
                    };
                    if tx.send(datagram).is_err() {
                        // Transport dropped
                        return;
                    }
                }
                Ok((_, from)) => debug!("Ignoring datagram from non-IPv4 {}", from),
                Err(e) => {
                    debug!("Socket receive error: {}", e);
                    break;
                }
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send to a different port than the one we listen on.
    pub fn set_destination_port(&mut self, port: u16) {
        self.port = port;
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, to: Ipv4Addr, data: &[u8]) -> Result<()> {
        let target = SocketAddrV4::new(to, self.port);
        self.socket
            .try_send_to(data, target.into())
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", target, e)))
    }

    fn try_recv(&mut self) -> Option<Datagram> {
        self.rx.try_recv().ok()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
