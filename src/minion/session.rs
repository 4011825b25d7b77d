//! Minion-side connection lifecycle.
//!
//! A [`SessionManager`] keeps the minion connected to its master(s):
//!
//! - `str`: one master, reconnecting under [`ReconnectBackoff`]
//! - `failover`: one active master at a time, walking a [`FailoverCursor`]
//! - `list`: an independent session per master, each in its own task
//! - `func`: like `str`, but a [`MasterResolver`] names the master before
//!   every connection attempt
//!
//! Every state change is broadcast as a [`SessionEvent`]. Publications that
//! arrive on a connected session are forwarded to the runtime together with
//! a [`MasterLink`] for sending the return.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{MasterType, MinionConfig};
use crate::error::{BrineError, Result};
use crate::pki::identity::load_public_key;
use crate::pki::{fingerprint, verify_signature, Identity, KeyExchange, SessionKey};
use crate::protocol::{
    AuthReply, AuthRequest, AuthStatus, JobLoad, Message, PeerKind, PeerReply, PeerRequest,
    ReturnLoad, Sealed,
};
use crate::shutdown::cancellable_sleep;
use crate::transport::{split_host_port, Connection, Endpoint, Recv, Transport};

const EVENT_BUFFER: usize = 256;
const PUBLICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Resolving,
    Authenticating,
    Connected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Resolving => write!(f, "resolving"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterRecord {
    pub address: String,
    pub port: u16,
    pub alive: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Snapshot of one minion/master pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub master: MasterRecord,
    pub state: SessionState,
    pub reconnect_interval: Duration,
    pub reconnect_attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Transition { master: String, state: SessionState },
    /// About to sleep before retrying `master`.
    Backoff { master: String, wait: Duration },
    /// The master announced new key material; re-authenticating after `delay`.
    Rekey { master: String, delay: Duration },
}

/// Reconnect wait sequence.
///
/// The first wait is `recon_default`, or uniform in `[recon_default,
/// recon_max]` when randomized. Each following wait doubles the previous
/// one; a doubled value at or above `recon_max` wraps to `recon_default`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    default: Duration,
    max: Duration,
    randomize: bool,
    next: Option<Duration>,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(default: Duration, max: Duration, randomize: bool) -> Self {
        Self {
            default,
            max,
            randomize,
            next: None,
            attempt: 0,
        }
    }

    pub fn from_config(config: &MinionConfig) -> Self {
        Self::new(config.recon_default(), config.recon_max(), config.recon_randomize)
    }

    pub fn next_wait(&mut self) -> Duration {
        let wait = self.next.unwrap_or_else(|| self.first_wait());
        let doubled = wait.saturating_mul(2);
        self.next = Some(if doubled >= self.max {
            self.default
        } else {
            doubled
        });
        self.attempt += 1;
        wait
    }

    fn first_wait(&self) -> Duration {
        if !self.randomize || self.max <= self.default {
            return self.default;
        }
        let low = self.default.as_millis() as u64;
        let high = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// Forget past failures after a successful connection.
    pub fn reset(&mut self) {
        self.next = None;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    address: String,
    backoff: ReconnectBackoff,
    failed: bool,
    unresolvable: bool,
    banned: bool,
}

/// Ordered master candidates with a per-candidate backoff.
///
/// A failure moves straight on to the next candidate. A wait is only due
/// when the cursor comes back around to a candidate that already failed,
/// and it is drawn from that candidate's own backoff.
#[derive(Debug, Clone)]
pub struct FailoverCursor {
    candidates: Vec<Candidate>,
    position: usize,
}

impl FailoverCursor {
    pub fn new(addresses: Vec<String>, backoff: ReconnectBackoff) -> Self {
        let candidates = addresses
            .into_iter()
            .map(|address| Candidate {
                address,
                backoff: backoff.clone(),
                failed: false,
                unresolvable: false,
                banned: false,
            })
            .collect();
        Self {
            candidates,
            position: 0,
        }
    }

    pub fn current(&self) -> &str {
        &self.candidates[self.position].address
    }

    /// Backoff attempts consumed by the candidate at `index`.
    pub fn attempts(&self, index: usize) -> u32 {
        self.candidates
            .get(index)
            .map(|c| c.backoff.attempt())
            .unwrap_or(0)
    }

    /// Replace the current candidate's address (dynamic resolution).
    pub fn set_current_address(&mut self, address: String) {
        self.candidates[self.position].address = address;
    }

    /// Mark the current candidate failed and move to the next usable one.
    /// Returns the wait owed before trying it.
    pub fn advance(&mut self) -> Option<Duration> {
        self.candidates[self.position].failed = true;
        let len = self.candidates.len();
        for _ in 0..len {
            self.position = (self.position + 1) % len;
            if !self.candidates[self.position].banned {
                break;
            }
        }
        let next = &mut self.candidates[self.position];
        if next.failed {
            Some(next.backoff.next_wait())
        } else {
            None
        }
    }

    pub fn connected(&mut self) {
        for candidate in &mut self.candidates {
            candidate.failed = false;
            candidate.unresolvable = false;
        }
        self.candidates[self.position].backoff.reset();
    }

    pub fn resolved(&mut self) {
        self.candidates[self.position].unresolvable = false;
    }

    /// Returns true once every candidate has failed resolution.
    pub fn mark_unresolvable(&mut self) -> bool {
        self.candidates[self.position].unresolvable = true;
        self.candidates.iter().all(|c| c.unresolvable || c.banned)
    }

    /// Stop trying the current candidate. Returns true when none is left.
    pub fn ban_current(&mut self) -> bool {
        self.candidates[self.position].banned = true;
        self.candidates.iter().all(|c| c.banned)
    }
}

/// Names the master to use for `func` mode. Invoked before every connection
/// attempt.
#[async_trait]
pub trait MasterResolver: Send + Sync {
    async fn resolve_master(&self) -> Result<String>;
}

#[async_trait]
impl<F> MasterResolver for F
where
    F: Fn() -> Result<String> + Send + Sync,
{
    async fn resolve_master(&self) -> Result<String> {
        self()
    }
}

/// What the minion has learned about master keys: the key each master
/// presented last, and which signed keys have already been verified.
#[derive(Debug, Default)]
pub struct TrustStore {
    master_keys: HashMap<String, Vec<u8>>,
    verified: HashSet<String>,
    dir: Option<PathBuf>,
}

impl TrustStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Pinned keys live in `<pki_dir>/masters/<address>.pub`.
    pub fn load(pki_dir: &Path) -> std::io::Result<Self> {
        let dir = pki_dir.join("masters");
        std::fs::create_dir_all(&dir)?;
        let mut master_keys = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(address) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".pub"))
            else {
                continue;
            };
            match hex::decode(std::fs::read_to_string(&path)?.trim()) {
                Ok(key) => {
                    master_keys.insert(address.to_string(), key);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable master key"),
            }
        }
        Ok(Self {
            master_keys,
            verified: HashSet::new(),
            dir: Some(dir),
        })
    }

    pub fn master_key(&self, address: &str) -> Option<&[u8]> {
        self.master_keys.get(address).map(Vec::as_slice)
    }

    fn pin(&mut self, address: &str, key: &[u8]) {
        if self.master_keys.get(address).map(Vec::as_slice) == Some(key) {
            return;
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.pub", address.replace(['/', '\\'], "_")));
            if let Err(e) = std::fs::write(&path, hex::encode(key)) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist master key");
            }
        }
        self.master_keys.insert(address.to_string(), key.to_vec());
    }
}

pub(crate) type PendingPeers = Arc<Mutex<HashMap<u64, oneshot::Sender<PeerReply>>>>;

/// The way back to the master a publication came from.
#[derive(Debug, Clone)]
pub struct MasterLink {
    master: String,
    minion_id: String,
    sender: mpsc::Sender<Message>,
    key: SessionKey,
    peers: PendingPeers,
    request_ids: Arc<AtomicU64>,
}

impl MasterLink {
    pub(crate) fn new(
        master: &str,
        minion_id: &str,
        sender: mpsc::Sender<Message>,
        key: SessionKey,
        peers: PendingPeers,
        request_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            master: master.to_string(),
            minion_id: minion_id.to_string(),
            sender,
            key,
            peers,
            request_ids,
        }
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn minion_id(&self) -> &str {
        &self.minion_id
    }

    pub async fn send_return(&self, load: &ReturnLoad) -> Result<()> {
        let sealed = Sealed::seal(&self.key, load)?;
        self.sender
            .send(Message::Return(sealed))
            .await
            .map_err(|_| BrineError::Transport(format!("session to {} is gone", self.master)))
    }

    /// Ask the master to publish to other minions, or to run a runner, and
    /// wait up to `timeout` for its answer.
    pub async fn peer(
        &self,
        kind: PeerKind,
        fun: &str,
        arg: Vec<serde_json::Value>,
        tgt: &str,
        tgt_type: &str,
        timeout: Duration,
    ) -> Result<PeerReply> {
        let request_id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.peers).insert(request_id, tx);

        let request = PeerRequest {
            request_id,
            kind,
            fun: fun.to_string(),
            arg,
            tgt: tgt.to_string(),
            tgt_type: tgt_type.to_string(),
        };
        let sealed = Sealed::seal(&self.key, &request)?;
        if self.sender.send(Message::PeerRequest(sealed)).await.is_err() {
            lock(&self.peers).remove(&request_id);
            return Err(BrineError::Transport(format!("session to {} is gone", self.master)));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BrineError::Transport(format!(
                "session to {} closed before the peer reply",
                self.master
            ))),
            Err(_) => {
                lock(&self.peers).remove(&request_id);
                Err(BrineError::Transport(format!(
                    "peer request {} to {} timed out",
                    request_id, self.master
                )))
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A job received on a connected session.
#[derive(Debug, Clone)]
pub struct Publication {
    pub load: JobLoad,
    pub link: MasterLink,
}

enum AuthOutcome {
    Accepted(SessionKey),
    Pending,
}

/// Publications that arrive while a connection is authenticating, opened
/// once the session key is known.
type Held = Vec<Sealed>;

/// An authenticated connection ready for `connected_loop`.
type Established = (Connection, SessionKey, Held);

enum ConnectionEnd {
    Shutdown,
    Lost(String),
    Rekey(Connection),
}

struct SessionContext {
    config: MinionConfig,
    identity: Identity,
    transport: Arc<dyn Transport>,
    resolver: Option<Arc<dyn MasterResolver>>,
    master_sign_key: Option<Vec<u8>>,
    trust: Mutex<TrustStore>,
    events: broadcast::Sender<SessionEvent>,
    sessions: RwLock<BTreeMap<String, Session>>,
    publications: mpsc::Sender<Publication>,
    request_ids: Arc<AtomicU64>,
}

pub struct SessionManager {
    ctx: SessionContext,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.ctx.identity.id())
            .field("master_type", &self.ctx.config.effective_master_type())
            .finish()
    }
}

impl SessionManager {
    /// Build a manager and the receiving end of its publication stream.
    pub fn new(
        config: MinionConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Receiver<Publication>) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (publications, rx) = mpsc::channel(PUBLICATION_BUFFER);
        let manager = Self {
            ctx: SessionContext {
                config,
                identity,
                transport,
                resolver: None,
                master_sign_key: None,
                trust: Mutex::new(TrustStore::in_memory()),
                events,
                sessions: RwLock::new(BTreeMap::new()),
                publications,
                request_ids: Arc::new(AtomicU64::new(1)),
            },
        };
        (manager, rx)
    }

    /// Load the minion identity, the pinned master keys and, when signature
    /// verification is on, the master signing key from `pki_dir`.
    pub async fn bootstrap(
        config: MinionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<Publication>)> {
        let identity = Identity::load_or_generate(&config.id, &config.pki_dir, "minion").await?;
        let trust = TrustStore::load(&config.pki_dir)?;
        let sign_key = if config.verify_master_pubkey_sign {
            let path = config
                .pki_dir
                .join(format!("{}.pub", config.master_sign_key_name));
            Some(load_public_key(&path).await.map_err(|e| {
                BrineError::Config(format!(
                    "verify_master_pubkey_sign is set but {} is unusable: {}",
                    path.display(),
                    e
                ))
            })?)
        } else {
            None
        };
        let (mut manager, rx) = Self::new(config, identity, transport);
        manager.ctx.trust = Mutex::new(trust);
        manager.ctx.master_sign_key = sign_key;
        Ok((manager, rx))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MasterResolver>) -> Self {
        self.ctx.resolver = Some(resolver);
        self
    }

    pub fn with_master_sign_key(mut self, key: Vec<u8>) -> Self {
        self.ctx.master_sign_key = Some(key);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    pub fn identity(&self) -> &Identity {
        &self.ctx.identity
    }

    /// Run until `shutdown` fires or a fatal condition ends every session.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionHandle> {
        let ctx = Arc::new(self.ctx);
        let config = &ctx.config;
        let backoff = ReconnectBackoff::from_config(config);

        let mode = config.effective_master_type();
        tracing::info!(id = %ctx.identity.id(), mode = %mode, masters = ?config.masters, "Starting minion sessions");

        let mut tasks = Vec::new();
        match mode {
            MasterType::Str => {
                let first = config.masters.first().cloned().ok_or_else(|| {
                    BrineError::Config("no master configured".into())
                })?;
                tasks.push(spawn_cursor(
                    &ctx,
                    FailoverCursor::new(vec![first], backoff),
                    &shutdown,
                ));
            }
            MasterType::Func => {
                if ctx.resolver.is_none() {
                    return Err(BrineError::Config(
                        "master_type func needs a master resolver".into(),
                    ));
                }
                let placeholder = config.masters.first().cloned().unwrap_or_default();
                tasks.push(spawn_cursor(
                    &ctx,
                    FailoverCursor::new(vec![placeholder], backoff),
                    &shutdown,
                ));
            }
            MasterType::Failover => {
                if config.masters.is_empty() {
                    return Err(BrineError::Config("failover needs at least one master".into()));
                }
                let mut masters = config.masters.clone();
                if config.random_master {
                    masters.shuffle(&mut rand::thread_rng());
                    tracing::info!(order = ?masters, "Shuffled master list");
                }
                tasks.push(spawn_cursor(
                    &ctx,
                    FailoverCursor::new(masters, backoff),
                    &shutdown,
                ));
            }
            MasterType::List => {
                for master in &config.masters {
                    tasks.push(spawn_cursor(
                        &ctx,
                        FailoverCursor::new(vec![master.clone()], backoff.clone()),
                        &shutdown,
                    ));
                }
            }
        }

        Ok(SessionHandle { ctx, tasks })
    }
}

fn spawn_cursor(
    ctx: &Arc<SessionContext>,
    cursor: FailoverCursor,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    let ctx = ctx.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move { ctx.run_cursor(cursor, shutdown).await })
}

/// Running sessions. Await [`SessionHandle::join`] for the outcome.
pub struct SessionHandle {
    ctx: Arc<SessionContext>,
    tasks: Vec<tokio::task::JoinHandle<Result<()>>>,
}

impl SessionHandle {
    pub async fn sessions(&self) -> Vec<Session> {
        self.ctx.sessions.read().await.values().cloned().collect()
    }

    pub async fn session(&self, master: &str) -> Option<Session> {
        self.ctx.sessions.read().await.get(master).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Wait for every session to end. In multi-master mode one session
    /// failing fatally leaves the others running; the first fatal error is
    /// reported once all have ended.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for task in self.tasks {
            let outcome = task
                .await
                .map_err(|e| BrineError::Transport(format!("session task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Session ended fatally");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl SessionContext {
    async fn transition(&self, address: &str, state: SessionState) {
        {
            let (host, port) = split_host_port(address, self.config.master_port);
            let mut sessions = self.sessions.write().await;
            let session = sessions.entry(address.to_string()).or_insert_with(|| Session {
                master: MasterRecord {
                    address: host,
                    port,
                    alive: false,
                    last_checked: None,
                },
                state,
                reconnect_interval: self.config.recon_default(),
                reconnect_attempt: 0,
            });
            session.state = state;
            match state {
                SessionState::Connected => {
                    session.master.alive = true;
                    session.master.last_checked = Some(Utc::now());
                    session.reconnect_attempt = 0;
                    session.reconnect_interval = self.config.recon_default();
                }
                SessionState::Failed => {
                    session.master.alive = false;
                    session.master.last_checked = Some(Utc::now());
                }
                _ => {}
            }
        }
        tracing::info!(master = %address, state = %state, "Session state changed");
        let _ = self.events.send(SessionEvent::Transition {
            master: address.to_string(),
            state,
        });
    }

    async fn record_backoff(&self, address: &str, wait: Duration) {
        if let Some(session) = self.sessions.write().await.get_mut(address) {
            session.reconnect_interval = wait;
            session.reconnect_attempt += 1;
        }
        tracing::info!(master = %address, wait_ms = wait.as_millis() as u64, "Waiting before reconnecting");
        let _ = self.events.send(SessionEvent::Backoff {
            master: address.to_string(),
            wait,
        });
    }

    async fn run_cursor(
        self: Arc<Self>,
        mut cursor: FailoverCursor,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut dns_retries: u32 = 0;
        if self.resolver.is_none() {
            self.transition(cursor.current(), SessionState::Disconnected).await;
        }

        loop {
            if shutdown.is_cancelled() {
                self.transition(cursor.current(), SessionState::Disconnected).await;
                return Ok(());
            }

            let resolved = match &self.resolver {
                Some(resolver) => match resolver.resolve_master().await {
                    Ok(address) => {
                        cursor.set_current_address(address);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                None => Ok(()),
            };

            let address = cursor.current().to_string();
            self.transition(&address, SessionState::Resolving).await;
            let (host, port) = split_host_port(&address, self.config.master_port);
            let endpoint = match resolved {
                Ok(()) => self.transport.resolve(&host, port).await,
                Err(e) => Err(e),
            };

            let endpoint = match endpoint {
                Ok(endpoint) => {
                    dns_retries = 0;
                    cursor.resolved();
                    endpoint
                }
                Err(e) => {
                    self.transition(&address, SessionState::Failed).await;
                    if self.config.retry_dns > 0 {
                        dns_retries += 1;
                        if let Some(limit) = self.config.retry_dns_count {
                            if dns_retries > limit {
                                tracing::error!(master = %address, retries = limit, error = %e, "Master still unresolvable, giving up");
                                return Err(e);
                            }
                        }
                        tracing::warn!(master = %address, error = %e, retry_dns = self.config.retry_dns, "Master unresolvable, retrying");
                        if !cancellable_sleep(&shutdown, Duration::from_secs(self.config.retry_dns)).await {
                            self.transition(&address, SessionState::Disconnected).await;
                            return Ok(());
                        }
                        continue;
                    }
                    if cursor.mark_unresolvable() {
                        tracing::error!(master = %address, error = %e, "No master could be resolved and retry_dns is 0");
                        return Err(e);
                    }
                    tracing::warn!(master = %address, error = %e, "Master unresolvable, trying the next one");
                    if !self.wait_for_next(&mut cursor, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.transition(&address, SessionState::Authenticating).await;
            let mut established = match self.establish(&address, &endpoint, &shutdown).await {
                Ok(Some(pair)) => Some(pair),
                Ok(None) => {
                    self.transition(&address, SessionState::Disconnected).await;
                    return Ok(());
                }
                Err(e) => {
                    self.handle_failure(&address, &mut cursor, e).await?;
                    None
                }
            };

            if established.is_some() {
                cursor.connected();
            }

            while let Some((conn, key, held)) = established.take() {
                self.transition(&address, SessionState::Connected).await;
                match self.connected_loop(&address, conn, key, held, &shutdown).await {
                    ConnectionEnd::Shutdown => {
                        self.transition(&address, SessionState::Disconnected).await;
                        return Ok(());
                    }
                    ConnectionEnd::Lost(reason) => {
                        tracing::warn!(master = %address, reason = %reason, "Lost connection to master");
                        self.transition(&address, SessionState::Failed).await;
                    }
                    ConnectionEnd::Rekey(mut conn) => {
                        let delay = self.reauth_delay();
                        let _ = self.events.send(SessionEvent::Rekey {
                            master: address.clone(),
                            delay,
                        });
                        tracing::info!(master = %address, delay_ms = delay.as_millis() as u64, "Master key material changed, re-authenticating");
                        self.transition(&address, SessionState::Authenticating).await;
                        if !cancellable_sleep(&shutdown, delay).await {
                            self.transition(&address, SessionState::Disconnected).await;
                            return Ok(());
                        }
                        let mut held = Held::new();
                        match self.accept_loop(&address, &mut conn, &mut held, &shutdown).await {
                            Ok(Some(key)) => established = Some((conn, key, held)),
                            Ok(None) => {
                                self.transition(&address, SessionState::Disconnected).await;
                                return Ok(());
                            }
                            Err(e) => self.handle_failure(&address, &mut cursor, e).await?,
                        }
                    }
                }
            }

            if !self.wait_for_next(&mut cursor, &shutdown).await {
                return Ok(());
            }
        }
    }

    /// Log a failed attempt and mark the session failed. A security
    /// violation retires the candidate and is returned once none is left.
    async fn handle_failure(
        &self,
        address: &str,
        cursor: &mut FailoverCursor,
        err: BrineError,
    ) -> Result<()> {
        self.transition(address, SessionState::Failed).await;
        match &err {
            BrineError::SecurityViolation(_) => {
                tracing::error!(master = %address, error = %err, "Refusing to talk to this master again");
                if cursor.ban_current() {
                    return Err(err);
                }
            }
            BrineError::Authentication(_) => {
                tracing::error!(master = %address, error = %err, "Authentication with master failed");
            }
            _ if err.is_transient() => {
                tracing::warn!(master = %address, error = %err, "Connection attempt failed");
            }
            _ => {
                tracing::error!(master = %address, error = %err, "Unexpected failure talking to master");
            }
        }
        Ok(())
    }

    /// Advance past the current candidate, sleeping if the next one is owed
    /// a backoff. Returns false when shutdown interrupted the wait.
    async fn wait_for_next(&self, cursor: &mut FailoverCursor, shutdown: &CancellationToken) -> bool {
        if let Some(wait) = cursor.advance() {
            let address = cursor.current().to_string();
            self.record_backoff(&address, wait).await;
            if !cancellable_sleep(shutdown, wait).await {
                self.transition(&address, SessionState::Disconnected).await;
                return false;
            }
        }
        true
    }

    fn reauth_delay(&self) -> Duration {
        let max_ms = self.config.random_reauth_delay.saturating_mul(1000);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    async fn establish(
        &self,
        address: &str,
        endpoint: &Endpoint,
        shutdown: &CancellationToken,
    ) -> Result<Option<Established>> {
        let mut conn = self.transport.connect(endpoint).await?;
        let mut held = Held::new();
        Ok(self
            .accept_loop(address, &mut conn, &mut held, shutdown)
            .await?
            .map(|key| (conn, key, held)))
    }

    /// Authenticate until the master accepts the key, waiting
    /// `acceptance_wait_time` (growing toward `acceptance_wait_time_max`)
    /// while it is pending.
    async fn accept_loop(
        &self,
        address: &str,
        conn: &mut Connection,
        held: &mut Held,
        shutdown: &CancellationToken,
    ) -> Result<Option<SessionKey>> {
        let step = Duration::from_secs(self.config.acceptance_wait_time);
        let max = Duration::from_secs(self.config.acceptance_wait_time_max);
        let mut wait = step;
        loop {
            match self.authenticate(address, conn, held).await? {
                AuthOutcome::Accepted(key) => {
                    tracing::info!(master = %address, key_id = %key.id(), "Authenticated with master");
                    return Ok(Some(key));
                }
                AuthOutcome::Pending => {
                    tracing::info!(master = %address, wait_secs = wait.as_secs(), "Key pending acceptance on the master, waiting");
                    if !cancellable_sleep(shutdown, wait).await {
                        return Ok(None);
                    }
                    if max > step && wait < max {
                        wait = (wait + step).min(max);
                    }
                }
            }
        }
    }

    async fn authenticate(
        &self,
        address: &str,
        conn: &mut Connection,
        held: &mut Held,
    ) -> Result<AuthOutcome> {
        let exchange = KeyExchange::new();
        let exchange_key = exchange.public_bytes().to_vec();
        let id = self.identity.id().to_string();
        let signature = self
            .identity
            .sign(&AuthRequest::signed_bytes(&id, &exchange_key));
        conn.send(Message::AuthRequest(AuthRequest {
            id,
            public_key: self.identity.public_key().to_vec(),
            exchange_key,
            signature,
            grains: self.config.grains.clone(),
        }))
        .await?;

        let deadline = Instant::now() + self.config.auth_timeout();
        let reply = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match conn.recv(remaining).await {
                Recv::Message(Message::AuthReply(reply)) => break reply,
                Recv::Message(Message::Publish(sealed)) => {
                    tracing::debug!(master = %address, "Holding publication until authenticated");
                    held.push(sealed);
                }
                Recv::Message(Message::Ping { nonce }) => {
                    conn.send(Message::Pong { nonce }).await?;
                }
                Recv::Message(other) => {
                    tracing::debug!(master = %address, kind = other.kind(), "Ignoring message while authenticating");
                }
                Recv::Timeout => {
                    return Err(BrineError::Authentication(format!(
                        "{} did not answer within {:?}",
                        address,
                        self.config.auth_timeout()
                    )))
                }
                Recv::Closed => {
                    return Err(BrineError::Transport(format!(
                        "{} closed the connection during authentication",
                        address
                    )))
                }
            }
        };

        self.verify_master(address, &reply)?;

        match reply.status {
            AuthStatus::Accepted => {
                let wrap = exchange.derive(&reply.exchange_key)?;
                let raw = wrap.open(&reply.sealed_session_key)?;
                let key = SessionKey::from_bytes(&raw)?;
                lock(&self.trust).pin(address, &reply.master_public_key);
                Ok(AuthOutcome::Accepted(key))
            }
            AuthStatus::Pending => Ok(AuthOutcome::Pending),
            AuthStatus::Rejected => Err(BrineError::Authentication(format!(
                "{} rejected this minion's key",
                address
            ))),
        }
    }

    /// Fingerprint pinning, then signature verification, then the
    /// changed-key check. Any failure is a security violation.
    fn verify_master(&self, address: &str, reply: &AuthReply) -> Result<()> {
        let presented = fingerprint(&reply.master_public_key);

        if let Some(expected) = &self.config.master_finger {
            if normalize_finger(expected) != normalize_finger(&presented) {
                return Err(BrineError::SecurityViolation(format!(
                    "master {} fingerprint {} does not match master_finger",
                    address, presented
                )));
            }
        }

        let mut trust = lock(&self.trust);

        let mut signature_checked = false;
        if self.config.verify_master_pubkey_sign {
            if self.config.always_verify_signature || !trust.verified.contains(&presented) {
                let sign_key = self.master_sign_key.as_deref().ok_or_else(|| {
                    BrineError::SecurityViolation("no master signing key to verify against".into())
                })?;
                let signature = reply
                    .master_key_signature
                    .as_deref()
                    .ok_or_else(|| {
                        BrineError::SecurityViolation(format!(
                            "master {} did not sign its public key",
                            address
                        ))
                    })
                    .and_then(|s| {
                        hex::decode(s).map_err(|_| {
                            BrineError::SecurityViolation("malformed master key signature".into())
                        })
                    })?;
                verify_signature(sign_key, &reply.master_public_key, &signature).map_err(|_| {
                    BrineError::SecurityViolation(format!(
                        "signature on master {} public key is invalid",
                        address
                    ))
                })?;
                tracing::debug!(master = %address, fingerprint = %presented, "Master public key signature verified");
                trust.verified.insert(presented.clone());
            }
            signature_checked = true;
        }

        if let Some(known) = trust.master_key(address) {
            if known != reply.master_public_key.as_slice() {
                if signature_checked {
                    tracing::warn!(master = %address, fingerprint = %presented, "Master key changed, accepted on a valid signature");
                } else if self.config.open_mode {
                    tracing::warn!(master = %address, fingerprint = %presented, "Master key changed, accepted because open_mode is set");
                } else {
                    return Err(BrineError::SecurityViolation(format!(
                        "master {} presented a different public key than before",
                        address
                    )));
                }
            }
        }
        Ok(())
    }

    async fn connected_loop(
        &self,
        address: &str,
        conn: Connection,
        key: SessionKey,
        held: Held,
        shutdown: &CancellationToken,
    ) -> ConnectionEnd {
        let peer = conn.peer().to_string();
        let (sender, mut inbound) = conn.split();
        let peers: PendingPeers = Arc::new(Mutex::new(HashMap::new()));
        let link = MasterLink::new(
            address,
            self.identity.id(),
            sender.clone(),
            key.clone(),
            peers.clone(),
            self.request_ids.clone(),
        );

        let alive_interval = Duration::from_secs(self.config.master_alive_interval);
        let probing = !alive_interval.is_zero();
        let mut probe = tokio::time::interval(if probing {
            alive_interval
        } else {
            Duration::from_secs(3600)
        });
        probe.tick().await;
        let mut nonce: u64 = 0;
        let mut awaiting: Option<(u64, Instant)> = None;

        for sealed in held {
            if !self.forward(address, sealed, &key, &link).await {
                return ConnectionEnd::Shutdown;
            }
        }

        loop {
            let deadline = awaiting
                .map(|(_, d)| d)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.cancelled() => return ConnectionEnd::Shutdown,
                msg = inbound.recv() => match msg {
                    None => return ConnectionEnd::Lost("connection closed".into()),
                    Some(Message::Publish(sealed)) => {
                        if !self.forward(address, sealed, &key, &link).await {
                            return ConnectionEnd::Shutdown;
                        }
                    }
                    Some(Message::PeerReply(sealed)) => match sealed.open::<PeerReply>(&key) {
                        Ok(reply) => {
                            if let Some(tx) = lock(&peers).remove(&reply.request_id) {
                                let _ = tx.send(reply);
                            }
                        }
                        Err(e) => tracing::warn!(master = %address, error = %e, "Undecryptable peer reply"),
                    },
                    Some(Message::Pong { nonce: answered }) => {
                        if awaiting.map(|(n, _)| n) == Some(answered) {
                            awaiting = None;
                            self.mark_alive(address).await;
                        }
                    }
                    Some(Message::Ping { nonce }) => {
                        let _ = sender.send(Message::Pong { nonce }).await;
                    }
                    Some(Message::Rekey) => {
                        return ConnectionEnd::Rekey(Connection::new(peer, sender, inbound));
                    }
                    Some(other) => {
                        tracing::debug!(master = %address, kind = other.kind(), "Ignoring unexpected message");
                    }
                },
                _ = probe.tick(), if probing && awaiting.is_none() => {
                    nonce += 1;
                    if sender.send(Message::Ping { nonce }).await.is_err() {
                        return ConnectionEnd::Lost("connection closed".into());
                    }
                    awaiting = Some((nonce, Instant::now() + self.config.auth_timeout()));
                }
                _ = tokio::time::sleep_until(deadline), if awaiting.is_some() => {
                    return ConnectionEnd::Lost(format!(
                        "no answer to liveness probe within {:?}",
                        self.config.auth_timeout()
                    ));
                }
            }
        }
    }

    /// Open a publication and hand it to the runtime if it targets this
    /// minion. Returns false once the runtime has gone away.
    async fn forward(&self, address: &str, sealed: Sealed, key: &SessionKey, link: &MasterLink) -> bool {
        let load: JobLoad = match sealed.open(key) {
            Ok(load) => load,
            Err(e) => {
                tracing::warn!(master = %address, error = %e, "Undecryptable publication, dropping");
                return true;
            }
        };
        if !load.minions.iter().any(|m| m == self.identity.id()) {
            tracing::debug!(jid = %load.jid, "Publication not targeted at this minion");
            return true;
        }
        tracing::debug!(master = %address, jid = %load.jid, function = %load.fun, "Publication received");
        let publication = Publication {
            load,
            link: link.clone(),
        };
        self.publications.send(publication).await.is_ok()
    }

    async fn mark_alive(&self, address: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(address) {
            session.master.alive = true;
            session.master.last_checked = Some(Utc::now());
        }
    }
}

fn normalize_finger(finger: &str) -> String {
    finger
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
