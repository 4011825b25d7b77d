//! Reliable bidirectional channels between minion and master.
//!
//! A [`Connection`] is a pair of message queues. Transport implementations
//! pump frames between the queues and the underlying socket, so request/reply
//! traffic and publications share one connection and callers can hold a cheap
//! [`Connection::sender`] clone while another task reads.
//!
//! - [`tcp`]: length-delimited JSON frames over TCP
//! - [`memory`]: an in-process network for tests and embedding

pub mod memory;
pub mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BrineError, Result};
use crate::protocol::Message;

pub use memory::{MemoryListener, MemoryNetwork};
pub use tcp::{TcpAcceptor, TcpTransport};

/// Queue depth of each direction of a connection.
pub const CONNECTION_BUFFER: usize = 256;

/// A resolved master address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub addr: Option<SocketAddr>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}:{} ({})", self.host, self.port, addr),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Result of waiting on a connection.
#[derive(Debug)]
pub enum Recv {
    Message(Message),
    Timeout,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    peer: String,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
}

impl Connection {
    pub fn new(
        peer: impl Into<String>,
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            peer: peer.into(),
            outbound,
            inbound,
        }
    }

    /// Two connected ends, as if `a` dialled `b`.
    pub fn pair(a: &str, b: &str) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::channel(CONNECTION_BUFFER);
        let (b_tx, a_rx) = mpsc::channel(CONNECTION_BUFFER);
        (Connection::new(b, a_tx, a_rx), Connection::new(a, b_tx, b_rx))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| BrineError::Transport(format!("connection to {} closed", self.peer)))
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(msg)) => Recv::Message(msg),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    /// Wait for the next message with no deadline. `None` once closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    pub fn split(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.outbound, self.inbound)
    }
}

/// Client side: how a minion reaches a master.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve a host name to something `connect` can dial.
    async fn resolve(&self, host: &str, port: u16) -> Result<Endpoint>;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection>;
}

/// Server side: how a master accepts minions.
#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&mut self) -> Result<Connection>;
}

/// Split `host`, `host:port` or `[v6]:port` into parts.
pub fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        _ => (address.to_string(), default_port),
    }
}
