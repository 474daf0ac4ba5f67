//! Plain-DNS serving surface: UDP and TCP listeners feeding the resolver.

use crate::config::ServerConfig;
use crate::dns::wire;
use crate::resolver::{Resolver, ResponseWriter};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const UDP_BUFFER: usize = 4096;
/// Responses larger than this are truncated over UDP; clients retry on TCP.
const UDP_PAYLOAD_LIMIT: usize = 1232;

struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    async fn write(&self, response: &[u8]) -> std::io::Result<()> {
        let bytes = if response.len() > UDP_PAYLOAD_LIMIT {
            match truncate_for_udp(response) {
                Some(truncated) => truncated,
                None => response.to_vec(),
            }
        } else {
            response.to_vec()
        };
        self.socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }
}

/// Header + question only, TC set, record counts zeroed.
fn truncate_for_udp(response: &[u8]) -> Option<Vec<u8>> {
    let question_end = wire::question_section(response).ok()?.end;
    let mut out = response[..question_end].to_vec();
    out[2] |= 0x02;
    out[6..12].fill(0);
    Some(out)
}

struct TcpResponseWriter {
    stream: Arc<Mutex<OwnedWriteHalf>>,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter {
    async fn write(&self, response: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&(response.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(response).await?;
        stream.flush().await
    }
}

pub async fn run_udp_server(
    addr: SocketAddr,
    config: ServerConfig,
    resolver: Arc<Resolver>,
) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    info!("UDP listener on {}", addr);

    let mut receivers = Vec::new();
    for _ in 0..config.listeners.max(1) {
        let socket = socket.clone();
        let resolver = resolver.clone();
        receivers.push(tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP recv failed: {}", e);
                        continue;
                    }
                };
                let query = buf[..len].to_vec();
                let resolver = resolver.clone();
                let writer = UdpResponseWriter {
                    socket: socket.clone(),
                    peer,
                };
                tokio::spawn(async move {
                    resolver.serve_query(&query, peer, "udp", &writer).await;
                });
            }
        }));
    }

    for receiver in receivers {
        let _ = receiver.await;
    }
    Ok(())
}

pub async fn run_tcp_server(
    addr: SocketAddr,
    config: ServerConfig,
    resolver: Arc<Resolver>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("TCP listener on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                continue;
            }
        };
        let resolver = resolver.clone();
        let read_timeout = config.read_timeout;
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_connection(stream, peer, resolver, read_timeout).await {
                debug!(peer = %peer, "TCP connection closed: {}", e);
            }
        });
    }
}

async fn serve_tcp_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    read_timeout: std::time::Duration,
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(read_timeout, reader.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()), // idle connection
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(());
        }
        let mut query = vec![0u8; len];
        tokio::time::timeout(read_timeout, reader.read_exact(&mut query))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        let response_writer = TcpResponseWriter {
            stream: writer.clone(),
        };
        resolver.serve_query(&query, peer, "tcp", &response_writer).await;
    }
}
