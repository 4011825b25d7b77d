//! Typed configuration consumed by the master and minion runtimes.
//!
//! Defaults follow the long-standing defaults of the platform's config
//! surface (`recon_default: 1000`, `keep_jobs: 24`, `worker_threads: 5`, ...).
//! The binary loads these structs from YAML; library users construct them
//! directly and adjust fields with the `with_*` builders.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::{BrineError, Result};

pub const DEFAULT_MASTER_PORT: u16 = 4506;

/// How the minion treats its configured list of masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MasterType {
    /// A single master. A list under `str` is promoted to `List`.
    #[default]
    Str,
    /// One concurrent session per listed master.
    #[serde(alias = "multi")]
    List,
    /// Exactly one active master, advancing through the list on failure.
    Failover,
    /// The master address is produced by a resolver collaborator.
    Func,
}

impl fmt::Display for MasterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterType::Str => write!(f, "str"),
            MasterType::List => write!(f, "list"),
            MasterType::Failover => write!(f, "failover"),
            MasterType::Func => write!(f, "func"),
        }
    }
}

/// A mapping of pattern -> list of function patterns whose document order is
/// significant. The first key matching the subject decides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderedRules(pub Vec<(String, Vec<String>)>);

impl OrderedRules {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_rule(mut self, key: &str, patterns: &[&str]) -> Self {
        self.0
            .push((key.to_string(), patterns.iter().map(|p| p.to_string()).collect()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<String>)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for OrderedRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = OrderedRules;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of pattern to list of function patterns")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(OrderedRules::default())
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut rules = Vec::new();
                while let Some((key, patterns)) = map.next_entry::<String, Vec<String>>()? {
                    rules.push((key, patterns));
                }
                Ok(OrderedRules(rules))
            }
        }

        deserializer.deserialize_any(RulesVisitor)
    }
}

/// Accepts either `master: salt` or `master: [a, b]`.
fn string_or_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    struct StringOrList;

    impl<'de> Visitor<'de> for StringOrList {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a master address or a list of master addresses")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.push(item);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(StringOrList)
}

/// Blacklist consulted before any client ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclBlacklist {
    pub users: Vec<String>,
    pub modules: Vec<String>,
}

/// Minion-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinionConfig {
    pub id: String,
    #[serde(rename = "master", deserialize_with = "string_or_list")]
    pub masters: Vec<String>,
    pub master_type: MasterType,
    pub master_port: u16,
    /// Seconds between DNS retries; 0 makes a resolution failure fatal.
    pub retry_dns: u64,
    /// Maximum number of DNS retries before giving up. `None` retries forever.
    pub retry_dns_count: Option<u32>,
    pub random_master: bool,
    /// Seconds between liveness probes of the active master; 0 disables.
    pub master_alive_interval: u64,
    pub acceptance_wait_time: u64,
    pub acceptance_wait_time_max: u64,
    /// Milliseconds.
    pub recon_default: u64,
    /// Milliseconds.
    pub recon_max: u64,
    pub recon_randomize: bool,
    pub random_reauth_delay: u64,
    pub auth_timeout: u64,
    pub open_mode: bool,
    pub master_finger: Option<String>,
    pub verify_master_pubkey_sign: bool,
    pub master_sign_key_name: String,
    pub always_verify_signature: bool,
    pub multiprocessing: bool,
    pub pki_dir: PathBuf,
    pub grains: BTreeMap<String, serde_json::Value>,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            id: "minion".to_string(),
            masters: vec!["salt".to_string()],
            master_type: MasterType::Str,
            master_port: DEFAULT_MASTER_PORT,
            retry_dns: 30,
            retry_dns_count: None,
            random_master: false,
            master_alive_interval: 0,
            acceptance_wait_time: 10,
            acceptance_wait_time_max: 0,
            recon_default: 1000,
            recon_max: 10000,
            recon_randomize: true,
            random_reauth_delay: 10,
            auth_timeout: 5,
            open_mode: false,
            master_finger: None,
            verify_master_pubkey_sign: false,
            master_sign_key_name: "master_sign".to_string(),
            always_verify_signature: false,
            multiprocessing: true,
            pki_dir: PathBuf::from("/etc/brine/pki/minion"),
            grains: BTreeMap::new(),
        }
    }
}

impl MinionConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_masters(mut self, masters: &[&str]) -> Self {
        self.masters = masters.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_master_type(mut self, master_type: MasterType) -> Self {
        self.master_type = master_type;
        self
    }

    pub fn with_backoff(mut self, recon_default: u64, recon_max: u64, randomize: bool) -> Self {
        self.recon_default = recon_default;
        self.recon_max = recon_max;
        self.recon_randomize = randomize;
        self
    }

    pub fn with_pki_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = dir.into();
        self
    }

    pub fn with_grain(mut self, key: &str, value: serde_json::Value) -> Self {
        self.grains.insert(key.to_string(), value);
        self
    }

    /// The mode the session manager actually runs in. A list of masters
    /// under `str` behaves as multi-master.
    pub fn effective_master_type(&self) -> MasterType {
        match self.master_type {
            MasterType::Str if self.masters.len() > 1 => MasterType::List,
            other => other,
        }
    }

    pub fn recon_default(&self) -> Duration {
        Duration::from_millis(self.recon_default)
    }

    pub fn recon_max(&self) -> Duration {
        Duration::from_millis(self.recon_max)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }

    /// Reject combinations the runtime cannot honour.
    pub fn validate(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            return Err(BrineError::Config("minion id must not be empty".into()));
        }
        if self.masters.is_empty() && self.master_type != MasterType::Func {
            return Err(BrineError::Config("at least one master is required".into()));
        }
        if self.recon_default == 0 || self.recon_max < self.recon_default {
            return Err(BrineError::Config(format!(
                "recon_max ({}) must be >= recon_default ({}) and recon_default > 0",
                self.recon_max, self.recon_default
            )));
        }
        if self.master_type == MasterType::Failover && self.retry_dns != 0 {
            tracing::warn!(
                retry_dns = self.retry_dns,
                "master_type is failover but retry_dns is not 0, setting it to 0 so DNS errors fail over"
            );
            self.retry_dns = 0;
        }
        if self.random_master && self.masters.len() == 1 {
            tracing::warn!("random_master is set but only one master is configured, ignoring");
            self.random_master = false;
        }
        Ok(self)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml::from_str(text).map_err(|e| BrineError::Config(e.to_string()))?;
        cfg.validate()
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}

/// Master-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub id: String,
    pub interface: String,
    pub ret_port: u16,
    pub worker_threads: usize,
    /// Hours a job and its returns are retained.
    pub keep_jobs: u64,
    pub job_cache: bool,
    pub cachedir: Option<PathBuf>,
    pub pki_dir: PathBuf,
    pub open_mode: bool,
    pub auto_accept: bool,
    pub autosign_file: Option<PathBuf>,
    pub autoreject_file: Option<PathBuf>,
    pub master_sign_pubkey: bool,
    pub master_sign_key_name: String,
    pub peer: OrderedRules,
    pub peer_run: OrderedRules,
    #[serde(alias = "publisher_acl")]
    pub client_acl: OrderedRules,
    #[serde(alias = "publisher_acl_blacklist")]
    pub client_acl_blacklist: AclBlacklist,
    pub external_auth: BTreeMap<String, OrderedRules>,
    /// Credential table for the built-in `auto` backend: user -> sha256 hex.
    pub auth_users: BTreeMap<String, String>,
    /// Seconds an issued token stays valid.
    pub token_expire: i64,
    pub nodegroups: BTreeMap<String, String>,
    pub api_port: Option<u16>,
    /// Seconds between publish key rotations; 0 disables rotation.
    pub publish_key_rotation: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            id: "master".to_string(),
            interface: "0.0.0.0".to_string(),
            ret_port: DEFAULT_MASTER_PORT,
            worker_threads: 5,
            keep_jobs: 24,
            job_cache: true,
            cachedir: None,
            pki_dir: PathBuf::from("/etc/brine/pki/master"),
            open_mode: false,
            auto_accept: false,
            autosign_file: None,
            autoreject_file: None,
            master_sign_pubkey: false,
            master_sign_key_name: "master_sign".to_string(),
            peer: OrderedRules::default(),
            peer_run: OrderedRules::default(),
            client_acl: OrderedRules::default(),
            client_acl_blacklist: AclBlacklist::default(),
            external_auth: BTreeMap::new(),
            auth_users: BTreeMap::new(),
            token_expire: 43200,
            nodegroups: BTreeMap::new(),
            api_port: None,
            publish_key_rotation: 0,
        }
    }
}

impl MasterConfig {
    pub fn with_pki_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = dir.into();
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn with_keep_jobs(mut self, hours: u64) -> Self {
        self.keep_jobs = hours;
        self
    }

    pub fn with_peer(mut self, rules: OrderedRules) -> Self {
        self.peer = rules;
        self
    }

    pub fn keep_jobs(&self) -> chrono::Duration {
        chrono::Duration::hours(self.keep_jobs as i64)
    }

    pub fn validate(mut self) -> Result<Self> {
        if self.worker_threads == 0 {
            return Err(BrineError::Config("worker_threads must be at least 1".into()));
        }
        if self.worker_threads < 3 && !self.peer.is_empty() {
            tracing::warn!(
                worker_threads = self.worker_threads,
                "peer communication enabled with fewer than 3 workers, raising worker_threads to 3"
            );
            self.worker_threads = 3;
        }
        if self.token_expire <= 0 {
            return Err(BrineError::Config("token_expire must be positive".into()));
        }
        Ok(self)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml::from_str(text).map_err(|e| BrineError::Config(e.to_string()))?;
        cfg.validate()
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}
