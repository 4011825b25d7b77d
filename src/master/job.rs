use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{JobLoad, ReturnLoad};

/// One minion's result for a job. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReturn {
    pub minion_id: String,
    pub jid: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl From<ReturnLoad> for JobReturn {
    fn from(load: ReturnLoad) -> Self {
        Self {
            minion_id: load.id,
            jid: load.jid,
            success: load.success,
            payload: load.ret,
            timestamp: load.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub function: String,
    pub arguments: Vec<serde_json::Value>,
    pub target: String,
    pub target_type: String,
    pub dispatched_at: DateTime<Utc>,
    pub targets: BTreeSet<String>,
    pub returns: BTreeMap<String, JobReturn>,
    pub user: Option<String>,
}

impl Job {
    pub fn new(
        jid: String,
        function: &str,
        arguments: Vec<serde_json::Value>,
        target: &str,
        target_type: &str,
        targets: BTreeSet<String>,
    ) -> Self {
        Self {
            jid,
            function: function.to_string(),
            arguments,
            target: target.to_string(),
            target_type: target_type.to_string(),
            dispatched_at: Utc::now(),
            targets,
            returns: BTreeMap::new(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_dispatched_at(mut self, at: DateTime<Utc>) -> Self {
        self.dispatched_at = at;
        self
    }

    /// Targeted minions that have not returned yet.
    pub fn missing(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|m| !self.returns.contains_key(*m))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.targets.iter().all(|m| self.returns.contains_key(m))
    }

    pub fn is_expired(&self, keep: Duration, now: DateTime<Utc>) -> bool {
        keep > Duration::zero() && now - self.dispatched_at > keep
    }

    pub fn to_load(&self) -> JobLoad {
        JobLoad {
            jid: self.jid.clone(),
            fun: self.function.clone(),
            arg: self.arguments.clone(),
            tgt: self.target.clone(),
            tgt_type: self.target_type.clone(),
            minions: self.targets.iter().cloned().collect(),
            user: self.user.clone(),
        }
    }
}

/// Generates timestamp job ids (`YYYYmmddHHMMSSffffff`), strictly increasing
/// within one process even when called faster than the clock ticks.
#[derive(Debug, Default)]
pub struct JidGenerator {
    last: Mutex<Option<DateTime<Utc>>>,
}

/// Job ids are the generator's digit strings. They become file names in the
/// job store, so nothing else is accepted from callers.
pub fn valid_jid(jid: &str) -> bool {
    !jid.is_empty() && jid.len() <= 32 && jid.bytes().all(|b| b.is_ascii_digit())
}

impl JidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now.format("%Y%m%d%H%M%S%6f").to_string()
    }
}
