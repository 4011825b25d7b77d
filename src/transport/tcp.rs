use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{BrineError, Result};
use crate::protocol::Message;
use crate::transport::{Connection, Endpoint, Listener, Transport, CONNECTION_BUFFER};

/// Largest accepted frame. Job arguments and returns are JSON, so this bounds
/// a single publication or return.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn resolve(&self, host: &str, port: u16) -> Result<Endpoint> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| BrineError::Resolution {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        let addr = addrs.next().ok_or_else(|| BrineError::Resolution {
            host: host.to_string(),
            port,
            reason: "no addresses returned".to_string(),
        })?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
            addr: Some(addr),
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        let addr = endpoint
            .addr
            .ok_or_else(|| BrineError::Transport(format!("{} was never resolved", endpoint)))?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrineError::Transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| BrineError::Transport(format!("connect to {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "TCP connection established");
        Ok(spawn_pumps(stream, addr.to_string()))
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(spawn_pumps(stream, addr.to_string()))
    }
}

/// Bridge a socket to a [`Connection`]: one task encodes outbound messages,
/// one decodes inbound frames. Either side closing tears both down.
fn spawn_pumps(stream: TcpStream, peer: String) -> Connection {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    let (mut sink, mut frames) = Framed::new(stream, codec).split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CONNECTION_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CONNECTION_BUFFER);
    let closed = CancellationToken::new();

    let writer_closed = closed.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = writer_closed.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let bytes = match serde_json::to_vec(&msg) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(peer = %writer_peer, kind = msg.kind(), error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Bytes::from(bytes)).await {
                tracing::debug!(peer = %writer_peer, error = %e, "Write failed, closing connection");
                break;
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => match serde_json::from_slice::<Message>(&bytes) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %reader_peer, error = %e, "Dropping undecodable frame");
                    }
                },
                Some(Err(e)) => {
                    tracing::debug!(peer = %reader_peer, error = %e, "Read failed, closing connection");
                    break;
                }
                None => break,
            }
        }
        closed.cancel();
    });

    Connection::new(peer, out_tx, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Recv;

    #[tokio::test]
    async fn tcp_round_trip() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let port = acceptor.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut conn = acceptor.accept().await.unwrap();
            if let Some(Message::Ping { nonce }) = conn.next().await {
                conn.send(Message::Pong { nonce }).await.unwrap();
            }
            conn
        });

        let transport = TcpTransport::default();
        let endpoint = transport.resolve("127.0.0.1", port).await.unwrap();
        let mut client = transport.connect(&endpoint).await.unwrap();
        client.send(Message::Ping { nonce: 42 }).await.unwrap();

        match client.recv(Duration::from_secs(5)).await {
            Recv::Message(Message::Pong { nonce }) => assert_eq!(nonce, 42),
            other => panic!("unexpected {:?}", other),
        }

        let server_conn = server.await.unwrap();
        drop(server_conn);
        assert!(matches!(client.recv(Duration::from_secs(5)).await, Recv::Closed));
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::default();
        let endpoint = transport.resolve("127.0.0.1", port).await.unwrap();
        let err = transport.connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, BrineError::Transport(_)));
    }

    #[tokio::test]
    async fn unresolvable_host_is_resolution_error() {
        let transport = TcpTransport::default();
        let err = transport
            .resolve("does-not-exist.invalid", 4506)
            .await
            .unwrap_err();
        assert!(matches!(err, BrineError::Resolution { .. }));
    }
}
