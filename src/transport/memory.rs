//! An in-process network. Masters listen under a name; minions resolve and
//! dial that name. Names can be made unresolvable, and dropping a listener
//! makes its name unreachable, which is enough to drive failover and
//! backoff paths without sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BrineError, Result};
use crate::transport::{Connection, Endpoint, Listener, Transport};

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, mpsc::Sender<Connection>>,
    unresolvable: HashSet<String>,
    connect_attempts: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryNetwork")
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Start accepting connections addressed to `name`.
    pub fn listen(&self, name: &str) -> MemoryListener {
        let (tx, rx) = mpsc::channel(64);
        self.with_state(|s| s.listeners.insert(name.to_string(), tx));
        MemoryListener {
            name: name.to_string(),
            rx,
            network: self.clone(),
        }
    }

    pub fn set_unresolvable(&self, name: &str, unresolvable: bool) {
        self.with_state(|s| {
            if unresolvable {
                s.unresolvable.insert(name.to_string());
            } else {
                s.unresolvable.remove(name);
            }
        });
    }

    /// Number of connection attempts made to `name` so far.
    pub fn connect_attempts(&self, name: &str) -> usize {
        self.with_state(|s| s.connect_attempts.get(name).copied().unwrap_or(0))
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn resolve(&self, host: &str, port: u16) -> Result<Endpoint> {
        if self.with_state(|s| s.unresolvable.contains(host)) {
            return Err(BrineError::Resolution {
                host: host.to_string(),
                port,
                reason: "name not known".to_string(),
            });
        }
        Ok(Endpoint {
            host: host.to_string(),
            port,
            addr: None,
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        let listener = self.with_state(|s| {
            *s.connect_attempts.entry(endpoint.host.clone()).or_insert(0) += 1;
            s.listeners.get(&endpoint.host).cloned()
        });
        let listener = listener
            .ok_or_else(|| BrineError::Transport(format!("connection refused by {}", endpoint)))?;

        let (client, server) = Connection::pair("minion", &endpoint.host);
        listener
            .send(server)
            .await
            .map_err(|_| BrineError::Transport(format!("connection refused by {}", endpoint)))?;
        Ok(client)
    }
}

pub struct MemoryListener {
    name: String,
    rx: mpsc::Receiver<Connection>,
    network: MemoryNetwork,
}

impl MemoryListener {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let name = self.name.clone();
        self.network.with_state(|s| s.listeners.remove(&name));
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Connection> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BrineError::Transport(format!("listener {} closed", self.name)))
    }
}
