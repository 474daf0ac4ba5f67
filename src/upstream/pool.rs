//! Per-upstream connection pools.
//!
//! UDP sockets are connected once and reused; TCP streams idle in a bounded
//! queue with a staleness cutoff. Both pools hand out owned connections so
//! an exchange never holds a pool lock across I/O.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const MAX_IDLE: usize = 8;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UdpPool {
    addr: SocketAddr,
    idle: Mutex<Vec<UdpSocket>>,
}

impl UdpPool {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub async fn get(&self) -> Result<UdpSocket> {
        if let Some(socket) = self.idle.lock().pop() {
            return Ok(socket);
        }

        let bind_addr = if self.addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;
        debug!("new UDP socket for {}", self.addr);
        Ok(socket)
    }

    pub fn put(&self, socket: UdpSocket) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(socket);
        }
    }
}

pub struct TcpPool {
    addr: SocketAddr,
    idle: Mutex<VecDeque<(TcpStream, Instant)>>,
    connect_timeout: Duration,
}

impl TcpPool {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            idle: Mutex::new(VecDeque::new()),
            connect_timeout,
        }
    }

    /// Pop a live idle stream or dial a fresh one. Returns whether the
    /// stream came from the pool, so the caller can retry once on a stale
    /// connection's EOF.
    pub async fn get(&self) -> Result<(TcpStream, bool)> {
        loop {
            let candidate = self.idle.lock().pop_front();
            let Some((stream, parked_at)) = candidate else {
                break;
            };
            if parked_at.elapsed() < TCP_IDLE_TIMEOUT {
                return Ok((stream, true));
            }
            // Stale; drop it and look at the next one.
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| crate::error::GjallarError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("new TCP connection to {}", self.addr);
        Ok((stream, false))
    }

    pub fn put(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push_back((stream, Instant::now()));
        }
    }

    pub fn drain(&self) {
        self.idle.lock().clear();
    }
}
