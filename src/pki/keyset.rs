//! The master's record of minion public keys.
//!
//! Keys move `Pending -> Accepted`, `Pending -> Rejected`, or
//! `Rejected -> Accepted` through operator action. Accepted entries are
//! append-only: nothing in the handshake path demotes or replaces them.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pki::autosign::{AutoSign, AutosignMatch};
use crate::pki::identity::fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Pending,
    Accepted,
    Rejected,
}

impl std::fmt::Display for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyState::Pending => write!(f, "pending"),
            KeyState::Accepted => write!(f, "accepted"),
            KeyState::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub public_key: Vec<u8>,
    pub state: KeyState,
}

impl KeyRecord {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// Why a key was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptReason {
    OpenMode,
    Known,
    Autosign(AutosignMatch),
    AutoAccept,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidId,
    KeyMismatch,
    PreviouslyRejected,
    Autoreject,
}

/// Outcome of evaluating a minion's presented key during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(AcceptReason),
    Pending,
    Rejected(RejectReason),
}

/// Storage collaborator for key records.
pub trait KeyBackend: Send + Sync {
    fn load(&self) -> std::io::Result<Vec<KeyRecord>>;
    fn store(&self, record: &KeyRecord) -> std::io::Result<()>;
}

/// Keeps nothing beyond the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryKeyBackend;

impl KeyBackend for MemoryKeyBackend {
    fn load(&self) -> std::io::Result<Vec<KeyRecord>> {
        Ok(Vec::new())
    }

    fn store(&self, _record: &KeyRecord) -> std::io::Result<()> {
        Ok(())
    }
}

/// One hex-encoded public key file per minion, in a directory per state:
/// `minions/`, `minions_pre/`, `minions_rejected/`.
#[derive(Debug, Clone)]
pub struct FsKeyBackend {
    root: PathBuf,
}

impl FsKeyBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, state: KeyState) -> PathBuf {
        self.root.join(match state {
            KeyState::Accepted => "minions",
            KeyState::Pending => "minions_pre",
            KeyState::Rejected => "minions_rejected",
        })
    }
}

impl KeyBackend for FsKeyBackend {
    fn load(&self) -> std::io::Result<Vec<KeyRecord>> {
        let mut out = Vec::new();
        for state in [KeyState::Accepted, KeyState::Pending, KeyState::Rejected] {
            let dir = self.dir(state);
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let id = entry.file_name().to_string_lossy().to_string();
                let text = std::fs::read_to_string(entry.path())?;
                match hex::decode(text.trim()) {
                    Ok(public_key) => out.push(KeyRecord {
                        id,
                        public_key,
                        state,
                    }),
                    Err(e) => {
                        tracing::warn!(minion_id = %id, error = %e, "Skipping unreadable key file")
                    }
                }
            }
        }
        Ok(out)
    }

    fn store(&self, record: &KeyRecord) -> std::io::Result<()> {
        for state in [KeyState::Accepted, KeyState::Pending, KeyState::Rejected] {
            let path = self.dir(state).join(&record.id);
            if state != record.state && path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        let dir = self.dir(record.state);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(&record.id), hex::encode(&record.public_key))
    }
}

/// Minion ids end up as file names, so anything that could escape the key
/// directory is refused.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0')
}

pub struct AcceptedKeySet {
    keys: HashMap<String, KeyRecord>,
    backend: Box<dyn KeyBackend>,
    autosign: AutoSign,
    autoreject: AutoSign,
    auto_accept: bool,
    open_mode: bool,
}

impl std::fmt::Debug for AcceptedKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedKeySet")
            .field("keys", &self.keys.len())
            .field("auto_accept", &self.auto_accept)
            .field("open_mode", &self.open_mode)
            .finish()
    }
}

impl AcceptedKeySet {
    pub fn new(backend: Box<dyn KeyBackend>) -> std::io::Result<Self> {
        let keys = backend
            .load()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        Ok(Self {
            keys,
            backend,
            autosign: AutoSign::default(),
            autoreject: AutoSign::default(),
            auto_accept: false,
            open_mode: false,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            keys: HashMap::new(),
            backend: Box::new(MemoryKeyBackend),
            autosign: AutoSign::default(),
            autoreject: AutoSign::default(),
            auto_accept: false,
            open_mode: false,
        }
    }

    pub fn with_autosign(mut self, autosign: AutoSign) -> Self {
        self.autosign = autosign;
        self
    }

    pub fn with_autoreject(mut self, autoreject: AutoSign) -> Self {
        self.autoreject = autoreject;
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn with_open_mode(mut self, open_mode: bool) -> Self {
        self.open_mode = open_mode;
        self
    }

    /// Decide what to do with a key presented in an auth request.
    pub fn evaluate(&mut self, id: &str, public_key: &[u8]) -> Admission {
        if !valid_id(id) {
            tracing::warn!(minion_id = %id, "Refusing key for invalid minion id");
            return Admission::Rejected(RejectReason::InvalidId);
        }

        if self.open_mode {
            tracing::debug!(minion_id = %id, "Open mode, accepting key unconditionally");
            return Admission::Accepted(AcceptReason::OpenMode);
        }

        if let Some(existing) = self.keys.get(id).cloned() {
            match existing.state {
                KeyState::Accepted if existing.public_key == public_key => {
                    return Admission::Accepted(AcceptReason::Known);
                }
                KeyState::Accepted => {
                    tracing::error!(
                        minion_id = %id,
                        "Presented key does not match the accepted key, the minion may have been subverted"
                    );
                    return Admission::Rejected(RejectReason::KeyMismatch);
                }
                KeyState::Rejected => {
                    tracing::info!(minion_id = %id, "Key was previously rejected");
                    return Admission::Rejected(RejectReason::PreviouslyRejected);
                }
                KeyState::Pending if existing.public_key != public_key => {
                    tracing::warn!(minion_id = %id, "Pending key changed before acceptance, rejecting");
                    self.set(id, public_key, KeyState::Rejected);
                    return Admission::Rejected(RejectReason::KeyMismatch);
                }
                KeyState::Pending => {}
            }
        }

        if self.autoreject.check(id).is_some() {
            tracing::info!(minion_id = %id, "Key matched autoreject rules");
            self.set(id, public_key, KeyState::Rejected);
            return Admission::Rejected(RejectReason::Autoreject);
        }

        if let Some(rule) = self.autosign.check(id) {
            tracing::info!(minion_id = %id, rule = ?rule, "Key auto-signed");
            self.set(id, public_key, KeyState::Accepted);
            return Admission::Accepted(AcceptReason::Autosign(rule));
        }

        if self.auto_accept {
            tracing::info!(minion_id = %id, "Key auto-accepted");
            self.set(id, public_key, KeyState::Accepted);
            return Admission::Accepted(AcceptReason::AutoAccept);
        }

        if !self.keys.contains_key(id) {
            tracing::info!(minion_id = %id, "New key queued for acceptance");
            self.set(id, public_key, KeyState::Pending);
        }
        Admission::Pending
    }

    /// Operator acceptance of a pending or rejected key.
    pub fn accept(&mut self, id: &str) -> Option<KeyState> {
        let record = self.keys.get(id)?.clone();
        if record.state != KeyState::Accepted {
            self.set(id, &record.public_key, KeyState::Accepted);
            tracing::info!(minion_id = %id, from = %record.state, "Key accepted by operator");
        }
        Some(KeyState::Accepted)
    }

    /// Operator rejection of a pending key. Accepted keys stay accepted.
    pub fn reject(&mut self, id: &str) -> Option<KeyState> {
        let record = self.keys.get(id)?.clone();
        match record.state {
            KeyState::Pending => {
                self.set(id, &record.public_key, KeyState::Rejected);
                tracing::info!(minion_id = %id, "Key rejected by operator");
                Some(KeyState::Rejected)
            }
            state => Some(state),
        }
    }

    pub fn get(&self, id: &str) -> Option<&KeyRecord> {
        self.keys.get(id)
    }

    pub fn state(&self, id: &str) -> Option<KeyState> {
        self.keys.get(id).map(|r| r.state)
    }

    /// Ids in the given state, sorted.
    pub fn list(&self, state: KeyState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .keys
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn set(&mut self, id: &str, public_key: &[u8], state: KeyState) {
        let record = KeyRecord {
            id: id.to_string(),
            public_key: public_key.to_vec(),
            state,
        };
        if let Err(e) = self.backend.store(&record) {
            tracing::error!(minion_id = %id, error = %e, "Failed to persist key record");
        }
        self.keys.insert(id.to_string(), record);
    }
}
