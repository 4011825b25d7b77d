//! Publication fan-out and return correlation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::error::{BrineError, Result};
use crate::master::acl::{Decision, PeerAcl};
use crate::master::job::{valid_jid, Job, JidGenerator, JobReturn};
use crate::master::job_cache::{JobCache, ReturnOutcome};
use crate::master::target::{Grains, Target, TargetType};
use crate::pki::SessionKey;
use crate::protocol::{Message, PeerKind, PeerReply, PeerRequest, ReturnLoad, Sealed};

/// What the master knows about one minion. Entries outlive the connection so
/// grain targeting still sees minions that are momentarily offline.
#[derive(Debug, Clone)]
pub struct MinionEntry {
    pub id: String,
    pub grains: Grains,
    pub connection: Option<u64>,
    pub sender: Option<mpsc::Sender<Message>>,
    pub last_seen: DateTime<Utc>,
}

impl MinionEntry {
    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }
}

/// Known minions, keyed by id, plus the connection each one is using.
#[derive(Debug, Default)]
pub struct MinionRegistry {
    minions: HashMap<String, MinionEntry>,
    by_connection: HashMap<u64, String>,
}

impl MinionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an authenticated minion to a connection. A newer connection for
    /// the same id replaces the old one.
    pub fn register(
        &mut self,
        id: &str,
        grains: Grains,
        connection: u64,
        sender: mpsc::Sender<Message>,
    ) {
        if let Some(old) = self.minions.get(id).and_then(|m| m.connection) {
            if old != connection {
                self.by_connection.remove(&old);
                tracing::info!(minion_id = %id, old, new = connection, "Minion reconnected on a new connection");
            }
        }
        self.by_connection.insert(connection, id.to_string());
        self.minions.insert(
            id.to_string(),
            MinionEntry {
                id: id.to_string(),
                grains,
                connection: Some(connection),
                sender: Some(sender),
                last_seen: Utc::now(),
            },
        );
        tracing::info!(minion_id = %id, connection, "Minion registered");
    }

    /// Forget a closed connection. The minion stays known but offline.
    pub fn disconnect(&mut self, connection: u64) -> Option<String> {
        let id = self.by_connection.remove(&connection)?;
        if let Some(entry) = self.minions.get_mut(&id) {
            if entry.connection == Some(connection) {
                entry.connection = None;
                entry.sender = None;
                tracing::info!(minion_id = %id, connection, "Minion disconnected");
            }
        }
        Some(id)
    }

    pub fn id_for_connection(&self, connection: u64) -> Option<&str> {
        self.by_connection.get(&connection).map(String::as_str)
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(entry) = self.minions.get_mut(id) {
            entry.last_seen = Utc::now();
        }
    }

    pub fn get(&self, id: &str) -> Option<&MinionEntry> {
        self.minions.get(id)
    }

    pub fn known(&self) -> impl Iterator<Item = (&str, &Grains)> {
        self.minions.values().map(|m| (m.id.as_str(), &m.grains))
    }

    /// Connected minion ids, sorted.
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .minions
            .values()
            .filter(|m| m.is_connected())
            .map(|m| m.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Known but disconnected minion ids, sorted.
    pub fn disconnected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .minions
            .values()
            .filter(|m| !m.is_connected())
            .map(|m| m.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn senders(&self) -> Vec<(String, mpsc::Sender<Message>)> {
        self.minions
            .values()
            .filter_map(|m| m.sender.clone().map(|s| (m.id.clone(), s)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.minions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minions.is_empty()
    }
}

/// The current publish key and, during a rotation, the one it replaced.
/// Returns sealed just before a rotation still open with the previous key.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub current: SessionKey,
    pub previous: Option<SessionKey>,
}

impl SessionKeys {
    pub fn new(current: SessionKey) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    pub fn rotate(&mut self) {
        let old = std::mem::replace(&mut self.current, SessionKey::generate());
        self.previous = Some(old);
    }

    pub fn open<T: serde::de::DeserializeOwned>(&self, sealed: &Sealed) -> Result<T> {
        match sealed.open(&self.current) {
            Ok(value) => Ok(value),
            Err(err) => match &self.previous {
                Some(previous) => sealed.open(previous),
                None => Err(err),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub fun: String,
    #[serde(default)]
    pub arg: Vec<serde_json::Value>,
    pub tgt: String,
    #[serde(default)]
    pub tgt_type: TargetType,
    #[serde(default)]
    pub user: Option<String>,
    /// Caller-chosen job id. Generated when absent.
    #[serde(default)]
    pub jid: Option<String>,
}

impl PublishRequest {
    pub fn new(fun: &str, tgt: &str, tgt_type: TargetType) -> Self {
        Self {
            fun: fun.to_string(),
            arg: Vec::new(),
            tgt: tgt.to_string(),
            tgt_type,
            user: None,
            jid: None,
        }
    }

    pub fn with_args(mut self, arg: Vec<serde_json::Value>) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_jid(mut self, jid: &str) -> Self {
        self.jid = Some(jid.to_string());
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub jid: String,
    /// Every minion the target evaluated to.
    pub minions: Vec<String>,
    /// How many of them were handed the publication.
    pub delivered: usize,
}

/// Turns publish requests into sealed publications and routes returns and
/// peer traffic. Cheap to clone; all state is shared.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<MinionRegistry>>,
    cache: Arc<RwLock<JobCache>>,
    keys: Arc<RwLock<SessionKeys>>,
    peer_acl: Arc<PeerAcl>,
    nodegroups: Arc<BTreeMap<String, String>>,
    jids: Arc<JidGenerator>,
}

impl Dispatcher {
    pub fn new(cache: JobCache, peer_acl: PeerAcl, nodegroups: BTreeMap<String, String>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(MinionRegistry::new())),
            cache: Arc::new(RwLock::new(cache)),
            keys: Arc::new(RwLock::new(SessionKeys::new(SessionKey::generate()))),
            peer_acl: Arc::new(peer_acl),
            nodegroups: Arc::new(nodegroups),
            jids: Arc::new(JidGenerator::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<MinionRegistry>> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<RwLock<JobCache>> {
        &self.cache
    }

    pub fn keys(&self) -> &Arc<RwLock<SessionKeys>> {
        &self.keys
    }

    pub async fn session_key(&self) -> SessionKey {
        self.keys.read().await.current.clone()
    }

    /// Evaluate the target against known minions, cache the job, and hand
    /// the sealed publication to each connected target. Delivery is not
    /// acknowledged.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResult> {
        let target = Target::parse(&request.tgt, request.tgt_type, &self.nodegroups)?;

        let (targets, senders) = {
            let registry = self.registry.read().await;
            let targets = target.select(registry.known());
            let senders: Vec<(String, mpsc::Sender<Message>)> = targets
                .iter()
                .filter_map(|id| {
                    registry
                        .get(id)
                        .and_then(|m| m.sender.clone())
                        .map(|s| (id.clone(), s))
                })
                .collect();
            (targets, senders)
        };

        if targets.is_empty() {
            tracing::info!(tgt = %request.tgt, tgt_type = %request.tgt_type, "Publish matched no minions");
            return Err(BrineError::NoTargets(request.tgt));
        }

        let jid = match request.jid {
            Some(jid) if !valid_jid(&jid) => {
                return Err(BrineError::InvalidTarget(format!("malformed job id {:?}", jid)))
            }
            Some(jid) => jid,
            None => self.jids.next(),
        };
        let job = Job::new(
            jid.clone(),
            &request.fun,
            request.arg,
            &request.tgt,
            &request.tgt_type.to_string(),
            targets.clone(),
        )
        .with_user(request.user);
        let load = job.to_load();

        self.cache.write().await.put_job(job)?;

        let sealed = Sealed::seal(&self.session_key().await, &load)?;
        let mut delivered = 0;
        for (id, sender) in senders {
            match sender.try_send(Message::Publish(sealed.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(jid = %jid, minion_id = %id, error = %e, "Publication not handed to transport")
                }
            }
        }

        tracing::info!(
            jid = %jid,
            function = %load.fun,
            targets = targets.len(),
            delivered,
            "Job published"
        );
        Ok(PublishResult {
            jid,
            minions: targets.into_iter().collect(),
            delivered,
        })
    }

    /// Store a return from the minion authenticated as `from`.
    pub async fn record_return(&self, from: &str, load: ReturnLoad) -> Result<ReturnOutcome> {
        if load.id != from {
            tracing::warn!(claimed = %load.id, authenticated = %from, jid = %load.jid, "Return claims another minion's id, dropping");
            return Err(BrineError::AuthorizationDenied(format!(
                "{} may not return for {}",
                from, load.id
            )));
        }
        self.registry.write().await.touch(from);
        self.cache.write().await.record_return(JobReturn::from(load))
    }

    /// Handle a minion-originated request. Denials become a negative reply
    /// and never reach other minions.
    pub async fn peer(&self, from: &str, request: PeerRequest) -> PeerReply {
        let decision = match request.kind {
            PeerKind::Publish => self.peer_acl.authorize_publish(from, &request.fun),
            PeerKind::Run => self.peer_acl.authorize_run(from, &request.fun),
        };
        if let Decision::Deny(reason) = decision {
            tracing::warn!(minion_id = %from, function = %request.fun, kind = ?request.kind, %reason, "Peer request denied");
            return PeerReply {
                request_id: request.request_id,
                ok: false,
                data: serde_json::json!({ "error": reason.to_string() }),
            };
        }

        let result = match request.kind {
            PeerKind::Publish => {
                let tgt_type = match request.tgt_type.parse::<TargetType>() {
                    Ok(t) => t,
                    Err(e) => return PeerReply::failure(request.request_id, &e),
                };
                let publish = PublishRequest {
                    fun: request.fun.clone(),
                    arg: request.arg.clone(),
                    tgt: request.tgt.clone(),
                    tgt_type,
                    user: Some(format!("minion:{}", from)),
                    jid: None,
                };
                self.publish(publish)
                    .await
                    .and_then(|r| Ok(serde_json::to_value(r)?))
            }
            PeerKind::Run => self.run(&request.fun, &request.arg).await,
        };

        match result {
            Ok(data) => PeerReply {
                request_id: request.request_id,
                ok: true,
                data,
            },
            Err(e) => PeerReply::failure(request.request_id, &e),
        }
    }

    /// Master-side runners available to `peer_run`.
    pub async fn run(&self, fun: &str, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        match fun {
            "manage.up" => Ok(serde_json::json!(self.registry.read().await.connected())),
            "manage.down" => Ok(serde_json::json!(self.registry.read().await.disconnected())),
            "jobs.lookup_jid" => {
                let jid = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BrineError::InvalidTarget("jobs.lookup_jid needs a jid".into()))?;
                match self.cache.read().await.lookup(jid) {
                    Ok(job) => Ok(serde_json::to_value(job.returns)?),
                    Err(miss) => Ok(serde_json::json!({ "error": miss.to_string() })),
                }
            }
            "jobs.list_jobs" => {
                let jobs = self.cache.read().await.jobs()?;
                let listing: BTreeMap<String, serde_json::Value> = jobs
                    .into_iter()
                    .map(|j| {
                        let summary = serde_json::json!({
                            "function": j.function,
                            "target": j.target,
                            "user": j.user,
                            "dispatched_at": j.dispatched_at.to_rfc3339(),
                        });
                        (j.jid, summary)
                    })
                    .collect();
                Ok(serde_json::to_value(listing)?)
            }
            other => Err(BrineError::AuthorizationDenied(format!(
                "no runner named {}",
                other
            ))),
        }
    }

    /// Send `msg` to every connected minion.
    pub async fn broadcast(&self, msg: Message) -> usize {
        let senders = self.registry.read().await.senders();
        let mut sent = 0;
        for (id, sender) in senders {
            if sender.try_send(msg.clone()).is_ok() {
                sent += 1;
            } else {
                tracing::debug!(minion_id = %id, kind = msg.kind(), "Broadcast not delivered");
            }
        }
        sent
    }

    /// Replace the publish key and tell connected minions to re-authenticate.
    pub async fn rotate_session_key(&self) -> usize {
        let id = {
            let mut keys = self.keys.write().await;
            keys.rotate();
            keys.current.id()
        };
        let notified = self.broadcast(Message::Rekey).await;
        tracing::info!(key_id = %id, notified, "Publish session key rotated");
        notified
    }
}

impl PeerReply {
    fn failure(request_id: u64, err: &BrineError) -> Self {
        Self {
            request_id,
            ok: false,
            data: serde_json::json!({ "error": err.to_string() }),
        }
    }
}
