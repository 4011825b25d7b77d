//! Test harness for master/minion integration tests.
//!
//! Masters and minions talk over a shared [`MemoryNetwork`], so tests can
//! make masters unreachable or unresolvable without touching sockets.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use brine::config::{MasterConfig, MasterType, MinionConfig};
use brine::error::BrineError;
use brine::master::Master;
use brine::minion::{
    FunctionRegistry, MinionRuntime, SessionEvent, SessionHandle, SessionManager, SessionState,
};
use brine::pki::{Identity, KeyExchange, SessionKey};
use brine::protocol::{AuthReply, AuthStatus, Message};
use brine::transport::{Listener, MemoryNetwork, Recv};

/// Minion configuration with timings suited to tests.
pub fn test_minion_config(id: &str, masters: &[&str], master_type: MasterType) -> MinionConfig {
    let mut config = MinionConfig::new(id)
        .with_masters(masters)
        .with_master_type(master_type)
        .with_backoff(1000, 10000, false);
    config.retry_dns = 0;
    config.acceptance_wait_time = 1;
    config.random_reauth_delay = 0;
    config.auth_timeout = 5;
    config
}

/// Master configuration that accepts every key.
pub fn test_master_config(id: &str) -> MasterConfig {
    MasterConfig {
        id: id.to_string(),
        ..MasterConfig::default()
    }
    .with_auto_accept(true)
}

/// A master serving on the memory network.
pub struct TestMaster {
    pub name: String,
    pub master: Arc<Master>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestMaster {
    pub fn start(network: &MemoryNetwork, name: &str, config: MasterConfig) -> Self {
        Self::start_with(network, name, Master::in_memory(config))
    }

    pub fn start_with(network: &MemoryNetwork, name: &str, master: Master) -> Self {
        let master = Arc::new(master);
        let listener = network.listen(name);
        let shutdown = CancellationToken::new();
        let serving = master.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let _ = serving.serve(listener, token).await;
        });
        Self {
            name: name.to_string(),
            master,
            shutdown,
            handle,
        }
    }

    pub async fn connected(&self) -> Vec<String> {
        self.master.dispatcher().registry().read().await.connected()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// A minion with its session manager and job runtime running.
pub struct TestMinion {
    pub id: String,
    pub sessions: SessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub shutdown: CancellationToken,
    runtime: JoinHandle<()>,
}

impl TestMinion {
    pub async fn start(network: &MemoryNetwork, config: MinionConfig) -> Self {
        Self::start_with(network, config, |manager| manager).await
    }

    /// Start a minion after letting `customize` adjust the manager, e.g. to
    /// install a resolver or a master signing key.
    pub async fn start_with(
        network: &MemoryNetwork,
        config: MinionConfig,
        customize: impl FnOnce(SessionManager) -> SessionManager,
    ) -> Self {
        let id = config.id.clone();
        let runtime = MinionRuntime::new(&config).with_functions(FunctionRegistry::with_builtins());
        let (manager, publications) =
            SessionManager::new(config, Identity::generate(&id), Arc::new(network.clone()));
        let manager = customize(manager);
        let events = manager.subscribe();
        let shutdown = CancellationToken::new();
        let sessions = manager
            .run(shutdown.clone())
            .await
            .expect("session manager should start");
        let runtime = tokio::spawn(runtime.run(publications, shutdown.clone()));
        Self {
            id,
            sessions,
            events,
            shutdown,
            runtime,
        }
    }

    /// Wait for the next transition of `master` into `state`.
    pub async fn wait_for_state(&mut self, master: &str, state: SessionState, timeout: Duration) -> bool {
        wait_for_event(&mut self.events, timeout, |e| {
            matches!(e, SessionEvent::Transition { master: m, state: s } if m == master && *s == state)
        })
        .await
        .is_some()
    }

    /// Stop the minion and report how its sessions ended.
    pub async fn stop(self) -> Result<(), BrineError> {
        self.shutdown.cancel();
        let outcome = self.sessions.join().await;
        let _ = self.runtime.await;
        outcome
    }
}

/// Receive events until `pred` matches one or `timeout` passes.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut pred: F,
) -> Option<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// A master that authenticates every minion with `identity` and then never
/// answers anything again. Aborting the handle drops the listener and every
/// connection it holds.
pub fn spawn_silent_master(network: &MemoryNetwork, name: &str, identity: Identity) -> JoinHandle<()> {
    let mut listener = network.listen(name);
    let session_key = SessionKey::generate();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok(mut conn) = listener.accept().await {
            let Recv::Message(Message::AuthRequest(request)) =
                conn.recv(Duration::from_secs(5)).await
            else {
                continue;
            };
            let exchange = KeyExchange::new();
            let exchange_key = exchange.public_bytes().to_vec();
            let Ok(wrap) = exchange.derive(&request.exchange_key) else {
                continue;
            };
            let Ok(sealed_session_key) = wrap.seal(session_key.as_bytes()) else {
                continue;
            };
            let reply = AuthReply {
                status: AuthStatus::Accepted,
                master_public_key: identity.public_key().to_vec(),
                master_key_signature: None,
                exchange_key,
                sealed_session_key,
            };
            let _ = conn.send(Message::AuthReply(reply)).await;
            held.push(conn);
        }
    })
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "Condition not met within timeout: {}", message);
}
