use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::{BrineError, Result};
use crate::master::acl::{capabilities_for, ClientAcl, Decision, PeerAcl};
use crate::master::dispatch::{Dispatcher, PublishRequest, PublishResult};
use crate::master::job_cache::{FsJobStore, JobCache};
use crate::master::token::{AuthToken, Authenticator, StaticCredentials, TokenCheck, TokenStore};
use crate::pki::{
    verify_signature, AcceptedKeySet, Admission, AutoSign, FsKeyBackend, Identity, KeyExchange,
};
use crate::protocol::{AuthReply, AuthRequest, AuthStatus, Message, PeerRequest, ReturnLoad, Sealed};
use crate::shutdown::cancellable_sleep;
use crate::transport::{Listener, TcpAcceptor};

/// Queued requests per worker before connection readers are back-pressured.
const WORK_QUEUE_PER_WORKER: usize = 64;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Request/reply traffic handed from connection readers to the worker pool.
#[derive(Debug)]
enum Work {
    Auth {
        connection: u64,
        reply: mpsc::Sender<Message>,
        request: AuthRequest,
    },
    Return {
        connection: u64,
        sealed: Sealed,
    },
    Peer {
        connection: u64,
        reply: mpsc::Sender<Message>,
        sealed: Sealed,
    },
}

/// The master process: key acceptance, publication, return collection and
/// external-auth tokens. Shared as `Arc<Master>` by the connection tasks,
/// the worker pool and the HTTP API.
pub struct Master {
    config: MasterConfig,
    identity: Identity,
    key_signature: Option<String>,
    keys: Arc<RwLock<AcceptedKeySet>>,
    dispatcher: Dispatcher,
    tokens: Arc<RwLock<TokenStore>>,
    client_acl: ClientAcl,
    authenticators: HashMap<String, Arc<dyn Authenticator>>,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("id", &self.config.id)
            .field("fingerprint", &self.identity.fingerprint())
            .finish()
    }
}

impl Master {
    pub fn new(config: MasterConfig, identity: Identity, keys: AcceptedKeySet, cache: JobCache) -> Self {
        let dispatcher = Dispatcher::new(
            cache,
            PeerAcl::new(config.peer.clone(), config.peer_run.clone()),
            config.nodegroups.clone(),
        );
        let mut authenticators: HashMap<String, Arc<dyn Authenticator>> = HashMap::new();
        if !config.auth_users.is_empty() {
            authenticators.insert(
                "auto".to_string(),
                Arc::new(StaticCredentials::new("auto", config.auth_users.clone())),
            );
        }
        Self {
            tokens: Arc::new(RwLock::new(TokenStore::new(chrono::Duration::seconds(
                config.token_expire,
            )))),
            client_acl: ClientAcl::new(config.client_acl.clone(), config.client_acl_blacklist.clone()),
            keys: Arc::new(RwLock::new(keys)),
            key_signature: None,
            dispatcher,
            authenticators,
            identity,
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    /// A master with a fresh identity and nothing persisted, keyed by the
    /// acceptance policy in `config`.
    pub fn in_memory(config: MasterConfig) -> Self {
        let keys = apply_key_policy(AcceptedKeySet::in_memory(), &config);
        let cache = if config.job_cache {
            JobCache::new(config.keep_jobs())
        } else {
            JobCache::disabled()
        };
        let identity = Identity::generate(&config.id);
        Self::new(config, identity, keys, cache)
    }

    /// Load or create key material under `pki_dir`, open the key and job
    /// stores, and build the master.
    pub async fn bootstrap(config: MasterConfig) -> Result<Self> {
        let identity = Identity::load_or_generate(&config.id, &config.pki_dir, "master").await?;

        let backend = FsKeyBackend::new(&config.pki_dir);
        let keys = apply_key_policy(AcceptedKeySet::new(Box::new(backend))?, &config);

        let cache = match (&config.cachedir, config.job_cache) {
            (_, false) => JobCache::disabled(),
            (Some(dir), true) => {
                JobCache::with_store(config.keep_jobs(), Box::new(FsJobStore::new(dir)?))
            }
            (None, true) => JobCache::new(config.keep_jobs()),
        };

        let signing = if config.master_sign_pubkey {
            Some(
                Identity::load_or_generate(
                    &config.id,
                    &config.pki_dir,
                    &config.master_sign_key_name,
                )
                .await?,
            )
        } else {
            None
        };

        let master = Self::new(config, identity, keys, cache);
        Ok(match signing {
            Some(sign) => master.with_signing_key(&sign),
            None => master,
        })
    }

    /// Sign the master public key so minions with `verify_master_pubkey_sign`
    /// can check it.
    pub fn with_signing_key(mut self, signer: &Identity) -> Self {
        let signature = signer.sign(&self.identity.public_key());
        self.key_signature = Some(hex::encode(signature));
        tracing::info!(signer = %signer.fingerprint(), "Master public key signed");
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators
            .insert(authenticator.name().to_string(), authenticator);
        self
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn keys(&self) -> &Arc<RwLock<AcceptedKeySet>> {
        &self.keys
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn tokens(&self) -> &Arc<RwLock<TokenStore>> {
        &self.tokens
    }

    /// Exchange credentials for a token carrying the user's external-auth
    /// capabilities.
    pub async fn login(&self, username: &str, password: &str, eauth: &str) -> Result<AuthToken> {
        let authenticator = self
            .authenticators
            .get(eauth)
            .ok_or_else(|| BrineError::Authentication(format!("unknown eauth backend {}", eauth)))?;
        if !authenticator.authenticate(username, password) {
            tracing::warn!(username, eauth, "Failed login");
            return Err(BrineError::Authentication("bad username or password".into()));
        }
        let capabilities = self
            .config
            .external_auth
            .get(eauth)
            .and_then(|rules| capabilities_for(rules, username))
            .ok_or_else(|| {
                BrineError::AuthorizationDenied(format!("{} has no {} permissions", username, eauth))
            })?;
        Ok(self
            .tokens
            .write()
            .await
            .issue(username, eauth, capabilities, Utc::now()))
    }

    /// Publish on behalf of a token holder.
    pub async fn publish_with_token(
        &self,
        token: &str,
        mut request: PublishRequest,
    ) -> Result<PublishResult> {
        let check = self
            .tokens
            .write()
            .await
            .validate(token, &request.fun, Utc::now());
        let subject = match check {
            TokenCheck::Granted { subject } => subject,
            TokenCheck::Expired => return Err(BrineError::Authentication("token expired".into())),
            TokenCheck::Unknown => return Err(BrineError::Authentication("unknown token".into())),
            TokenCheck::Denied => {
                return Err(BrineError::AuthorizationDenied(format!(
                    "token does not permit {}",
                    request.fun
                )))
            }
        };
        if let Some(reason) = self.client_acl.check_blacklist(&subject, &request.fun) {
            return Err(BrineError::AuthorizationDenied(reason.to_string()));
        }
        request.user = Some(subject);
        self.dispatcher.publish(request).await
    }

    /// Publish on behalf of a local user governed by `client_acl`.
    pub async fn publish_as(&self, user: &str, mut request: PublishRequest) -> Result<PublishResult> {
        if let Decision::Deny(reason) = self.client_acl.authorize(user, &request.fun) {
            tracing::warn!(user, function = %request.fun, %reason, "Client publish denied");
            return Err(BrineError::AuthorizationDenied(reason.to_string()));
        }
        request.user = Some(user.to_string());
        self.dispatcher.publish(request).await
    }

    /// Bind the return port (and the HTTP API when configured) and serve
    /// until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.interface, self.config.ret_port)
            .parse()
            .map_err(|e| BrineError::Config(format!("bad interface/ret_port: {}", e)))?;
        let acceptor = TcpAcceptor::bind(addr).await?;
        tracing::info!(addr = %acceptor.local_addr()?, fingerprint = %self.identity.fingerprint(), "Master listening");

        if let Some(port) = self.config.api_port {
            let api_addr: SocketAddr = format!("{}:{}", self.config.interface, port)
                .parse()
                .map_err(|e| BrineError::Config(format!("bad api_port: {}", e)))?;
            let master = self.clone();
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                crate::master::api::run_api(api_addr, master, api_shutdown).await;
            });
        }

        self.serve(acceptor, shutdown).await
    }

    /// Accept minion connections from `listener` until `shutdown` fires.
    ///
    /// Each connection gets a reader task. Auth, return and peer traffic is
    /// queued to `worker_threads` workers; pings are answered inline so a
    /// busy pool never fails a liveness probe.
    pub async fn serve<L: Listener>(
        self: Arc<Self>,
        mut listener: L,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let workers = self.config.worker_threads.max(1);
        let (work_tx, work_rx) = mpsc::channel::<Work>(workers * WORK_QUEUE_PER_WORKER);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let master = self.clone();
            let rx = work_rx.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                master.worker_loop(worker, rx, token).await;
            }));
        }

        let maintenance = {
            let master = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { master.maintenance_loop(token).await })
        };

        tracing::info!(workers, "Master serving");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(connection, peer = %conn.peer(), "Connection accepted");
                        let master = self.clone();
                        let tx = work_tx.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            master.connection_loop(connection, conn, tx, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        if !cancellable_sleep(&shutdown, Duration::from_millis(100)).await {
                            break;
                        }
                    }
                }
            }
        }

        drop(work_tx);
        for handle in handles {
            let _ = handle.await;
        }
        let _ = maintenance.await;
        tracing::info!("Master stopped");
        Ok(())
    }

    async fn connection_loop(
        self: Arc<Self>,
        connection: u64,
        conn: crate::transport::Connection,
        work: mpsc::Sender<Work>,
        shutdown: CancellationToken,
    ) {
        let (reply, mut inbound) = conn.split();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let item = match msg {
                Message::AuthRequest(request) => Work::Auth {
                    connection,
                    reply: reply.clone(),
                    request,
                },
                Message::Return(sealed) => Work::Return { connection, sealed },
                Message::PeerRequest(sealed) => Work::Peer {
                    connection,
                    reply: reply.clone(),
                    sealed,
                },
                Message::Ping { nonce } => {
                    let mut registry = self.dispatcher.registry().write().await;
                    if let Some(id) = registry.id_for_connection(connection).map(String::from) {
                        registry.touch(&id);
                    }
                    drop(registry);
                    let _ = reply.send(Message::Pong { nonce }).await;
                    continue;
                }
                other => {
                    tracing::debug!(connection, kind = other.kind(), "Ignoring unexpected message");
                    continue;
                }
            };
            if work.send(item).await.is_err() {
                break;
            }
        }
        self.dispatcher.registry().write().await.disconnect(connection);
        tracing::debug!(connection, "Connection closed");
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        work: Arc<Mutex<mpsc::Receiver<Work>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let item = {
                let mut rx = work.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Work::Auth {
                    connection,
                    reply,
                    request,
                } => self.handle_auth(connection, reply, request).await,
                Work::Return { connection, sealed } => self.handle_return(connection, sealed).await,
                Work::Peer {
                    connection,
                    reply,
                    sealed,
                } => self.handle_peer(connection, reply, sealed).await,
            }
        }
        tracing::debug!(worker, "Worker stopped");
    }

    async fn handle_auth(&self, connection: u64, reply: mpsc::Sender<Message>, request: AuthRequest) {
        let minion_id = request.id.clone();
        let signed = AuthRequest::signed_bytes(&request.id, &request.exchange_key);

        let mut status = if let Err(e) = verify_signature(&request.public_key, &signed, &request.signature) {
            tracing::warn!(minion_id = %minion_id, connection, error = %e, "Auth request signature invalid");
            AuthStatus::Rejected
        } else {
            match self.keys.write().await.evaluate(&minion_id, &request.public_key) {
                Admission::Accepted(reason) => {
                    tracing::debug!(minion_id = %minion_id, reason = ?reason, "Minion key accepted");
                    AuthStatus::Accepted
                }
                Admission::Pending => AuthStatus::Pending,
                Admission::Rejected(reason) => {
                    tracing::info!(minion_id = %minion_id, reason = ?reason, "Minion key rejected");
                    AuthStatus::Rejected
                }
            }
        };

        let mut exchange_key = Vec::new();
        let mut sealed_session_key = Vec::new();
        if status == AuthStatus::Accepted {
            let exchange = KeyExchange::new();
            let public = exchange.public_bytes();
            let session_key = self.dispatcher.session_key().await;
            match exchange
                .derive(&request.exchange_key)
                .and_then(|wrap| wrap.seal(session_key.as_bytes()))
            {
                Ok(sealed) => {
                    exchange_key = public.to_vec();
                    sealed_session_key = sealed;
                    self.dispatcher.registry().write().await.register(
                        &minion_id,
                        request.grains,
                        connection,
                        reply.clone(),
                    );
                }
                Err(e) => {
                    tracing::warn!(minion_id = %minion_id, error = %e, "Key exchange failed");
                    status = AuthStatus::Rejected;
                }
            }
        }

        let msg = Message::AuthReply(AuthReply {
            status,
            master_public_key: self.identity.public_key().to_vec(),
            master_key_signature: self.key_signature.clone(),
            exchange_key,
            sealed_session_key,
        });
        if reply.send(msg).await.is_err() {
            tracing::debug!(minion_id = %minion_id, "Connection closed before auth reply");
        }
    }

    async fn authenticated(&self, connection: u64) -> Option<String> {
        self.dispatcher
            .registry()
            .read()
            .await
            .id_for_connection(connection)
            .map(String::from)
    }

    async fn handle_return(&self, connection: u64, sealed: Sealed) {
        let Some(minion_id) = self.authenticated(connection).await else {
            tracing::warn!(connection, "Return on an unauthenticated connection, dropping");
            return;
        };
        let load: ReturnLoad = match self.dispatcher.keys().read().await.open(&sealed) {
            Ok(load) => load,
            Err(e) => {
                tracing::warn!(minion_id = %minion_id, error = %e, "Undecryptable return, dropping");
                return;
            }
        };
        if let Err(e) = self.dispatcher.record_return(&minion_id, load).await {
            tracing::warn!(minion_id = %minion_id, error = %e, "Return not recorded");
        }
    }

    async fn handle_peer(&self, connection: u64, reply: mpsc::Sender<Message>, sealed: Sealed) {
        let Some(minion_id) = self.authenticated(connection).await else {
            tracing::warn!(connection, "Peer request on an unauthenticated connection, dropping");
            return;
        };
        let request: PeerRequest = match self.dispatcher.keys().read().await.open(&sealed) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(minion_id = %minion_id, error = %e, "Undecryptable peer request, dropping");
                return;
            }
        };
        let answer = self.dispatcher.peer(&minion_id, request).await;
        let key = self.dispatcher.session_key().await;
        match Sealed::seal(&key, &answer) {
            Ok(sealed) => {
                let _ = reply.send(Message::PeerReply(sealed)).await;
            }
            Err(e) => tracing::error!(minion_id = %minion_id, error = %e, "Failed to seal peer reply"),
        }
    }

    /// Periodic job eviction, token purge and, when configured, publish key
    /// rotation.
    async fn maintenance_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut housekeeping = tokio::time::interval(MAINTENANCE_INTERVAL);
        housekeeping.tick().await;

        let rotation_period = Duration::from_secs(self.config.publish_key_rotation);
        let mut rotation = tokio::time::interval(if rotation_period.is_zero() {
            Duration::from_secs(86400 * 365)
        } else {
            rotation_period
        });
        rotation.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = housekeeping.tick() => {
                    let now = Utc::now();
                    {
                        let mut cache = self.dispatcher.cache().write().await;
                        if cache.is_enabled() {
                            if let Err(e) = cache.evict_expired(now) {
                                tracing::error!(error = %e, "Job eviction failed");
                            }
                        }
                    }
                    let purged = self.tokens.write().await.purge_expired(now);
                    if purged > 0 {
                        tracing::debug!(purged, "Expired tokens purged");
                    }
                }
                _ = rotation.tick(), if !rotation_period.is_zero() => {
                    self.dispatcher.rotate_session_key().await;
                }
            }
        }
    }
}

fn apply_key_policy(keys: AcceptedKeySet, config: &MasterConfig) -> AcceptedKeySet {
    keys.with_open_mode(config.open_mode)
        .with_auto_accept(config.auto_accept)
        .with_autosign(AutoSign::from_file(config.autosign_file.clone()))
        .with_autoreject(AutoSign::from_file(config.autoreject_file.clone()))
}
