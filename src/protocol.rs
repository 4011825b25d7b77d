//! Messages exchanged between minion and master over one connection.
//!
//! Auth traffic travels in the clear (it carries only public material and a
//! sealed key). Everything after the handshake is sealed with the publish
//! session key: job publications, returns, and peer requests/replies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::pki::SessionKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthReply(AuthReply),
    /// Sealed [`JobLoad`], master -> minion.
    Publish(Sealed),
    /// Sealed [`ReturnLoad`], minion -> master.
    Return(Sealed),
    /// Sealed [`PeerRequest`], minion -> master.
    PeerRequest(Sealed),
    /// Sealed [`PeerReply`], master -> minion.
    PeerReply(Sealed),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    /// The master's key material changed; minions must re-authenticate.
    Rekey,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AuthRequest(_) => "auth_request",
            Message::AuthReply(_) => "auth_reply",
            Message::Publish(_) => "publish",
            Message::Return(_) => "return",
            Message::PeerRequest(_) => "peer_request",
            Message::PeerReply(_) => "peer_reply",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Rekey => "rekey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

impl Sealed {
    pub fn seal<T: Serialize>(key: &SessionKey, value: &T) -> Result<Self> {
        let plain = serde_json::to_vec(value)?;
        Ok(Self {
            payload: key.seal(&plain)?,
        })
    }

    pub fn open<T: DeserializeOwned>(&self, key: &SessionKey) -> Result<T> {
        let plain = key.open(&self.payload)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: String,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    /// Minion's ephemeral X25519 public key.
    #[serde(with = "hex::serde")]
    pub exchange_key: Vec<u8>,
    /// Signature by the minion key over `id || exchange_key`.
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub grains: BTreeMap<String, serde_json::Value>,
}

impl AuthRequest {
    pub fn signed_bytes(id: &str, exchange_key: &[u8]) -> Vec<u8> {
        let mut out = id.as_bytes().to_vec();
        out.extend_from_slice(exchange_key);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub status: AuthStatus,
    #[serde(with = "hex::serde")]
    pub master_public_key: Vec<u8>,
    /// Signature of `master_public_key` by the master signing key, when the
    /// master is configured to sign its public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key_signature: Option<String>,
    /// Master's ephemeral X25519 public key.
    #[serde(with = "hex::serde")]
    pub exchange_key: Vec<u8>,
    /// Publish session key sealed under the exchange-derived key. Empty
    /// unless `status` is `Accepted`.
    #[serde(with = "hex::serde")]
    pub sealed_session_key: Vec<u8>,
}

/// A job as published to minions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLoad {
    pub jid: String,
    pub fun: String,
    #[serde(default)]
    pub arg: Vec<serde_json::Value>,
    pub tgt: String,
    pub tgt_type: String,
    /// Minion ids the master evaluated the target to.
    pub minions: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// A minion's result for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnLoad {
    pub jid: String,
    pub id: String,
    pub fun: String,
    pub success: bool,
    pub ret: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// Publish a job to other minions (`peer`).
    Publish,
    /// Run a master-side runner (`peer_run`).
    Run,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub request_id: u64,
    pub kind: PeerKind,
    pub fun: String,
    #[serde(default)]
    pub arg: Vec<serde_json::Value>,
    #[serde(default)]
    pub tgt: String,
    #[serde(default = "default_tgt_type")]
    pub tgt_type: String,
}

fn default_tgt_type() -> String {
    "glob".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    pub request_id: u64,
    pub ok: bool,
    pub data: serde_json::Value,
}
