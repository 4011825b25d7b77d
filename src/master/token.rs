use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::matcher::expr_match;

/// Credential check for one external-auth backend.
pub trait Authenticator: Send + Sync {
    /// Backend name as used in `external_auth`.
    fn name(&self) -> &str;

    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Username -> SHA-256 hex of the password.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    name: String,
    users: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new(name: &str, users: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            users: users
                .into_iter()
                .map(|(u, h)| (u, h.to_ascii_lowercase()))
                .collect(),
        }
    }

    pub fn hash_password(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }
}

impl Authenticator for StaticCredentials {
    fn name(&self) -> &str {
        &self.name
    }

    fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(expected) = self.users.get(username) else {
            return false;
        };
        let offered = Self::hash_password(password);
        // Compare every byte regardless of where the first difference is.
        expected.len() == offered.len()
            && expected
                .bytes()
                .zip(offered.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub subject: String,
    pub eauth: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub capabilities: Vec<String>,
}

impl AuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn permits(&self, function: &str) -> bool {
        self.capabilities.iter().any(|p| expr_match(p, function))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    Granted { subject: String },
    /// Past `expires_at`. The token is gone; the caller must log in again.
    Expired,
    Unknown,
    /// Valid token whose capabilities do not cover the function.
    Denied,
}

/// Issued tokens, valid for `token_expire` seconds and never renewed.
#[derive(Debug)]
pub struct TokenStore {
    tokens: HashMap<String, AuthToken>,
    ttl: Duration,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(Duration::seconds(43200))
    }
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            ttl,
        }
    }

    pub fn issue(
        &mut self,
        subject: &str,
        eauth: &str,
        capabilities: Vec<String>,
        now: DateTime<Utc>,
    ) -> AuthToken {
        let token = AuthToken {
            token: Uuid::new_v4().simple().to_string(),
            subject: subject.to_string(),
            eauth: eauth.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
            capabilities,
        };
        tracing::info!(subject, eauth, expires_at = %token.expires_at, "Token issued");
        self.tokens.insert(token.token.clone(), token.clone());
        token
    }

    pub fn get(&self, token: &str) -> Option<&AuthToken> {
        self.tokens.get(token)
    }

    pub fn validate(&mut self, token: &str, function: &str, now: DateTime<Utc>) -> TokenCheck {
        let Some(entry) = self.tokens.get(token) else {
            return TokenCheck::Unknown;
        };
        if entry.is_expired(now) {
            tracing::info!(subject = %entry.subject, "Token expired");
            self.tokens.remove(token);
            return TokenCheck::Expired;
        }
        if !entry.permits(function) {
            tracing::info!(subject = %entry.subject, function, "Token does not cover function");
            return TokenCheck::Denied;
        }
        TokenCheck::Granted {
            subject: entry.subject.clone(),
        }
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| !t.is_expired(now));
        before - self.tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials() {
        let users = BTreeMap::from([(
            "fred".to_string(),
            StaticCredentials::hash_password("hunter2").to_uppercase(),
        )]);
        let auth = StaticCredentials::new("auto", users);
        assert_eq!(auth.name(), "auto");
        assert!(auth.authenticate("fred", "hunter2"));
        assert!(!auth.authenticate("fred", "hunter3"));
        assert!(!auth.authenticate("alice", "hunter2"));
    }

    #[test]
    fn token_lifecycle() {
        let mut store = TokenStore::new(Duration::seconds(60));
        let now = Utc::now();
        let token = store.issue("fred", "auto", vec!["test.*".into()], now);

        assert_eq!(
            store.validate(&token.token, "test.ping", now + Duration::seconds(30)),
            TokenCheck::Granted {
                subject: "fred".into()
            }
        );
        assert_eq!(
            store.validate(&token.token, "cmd.run", now),
            TokenCheck::Denied
        );
        assert_eq!(
            store.validate(&token.token, "test.ping", now + Duration::seconds(60)),
            TokenCheck::Expired
        );
        // Expired tokens are removed, not renewed.
        assert_eq!(
            store.validate(&token.token, "test.ping", now),
            TokenCheck::Unknown
        );
    }

    #[test]
    fn unknown_token() {
        let mut store = TokenStore::default();
        assert_eq!(store.validate("nope", "test.ping", Utc::now()), TokenCheck::Unknown);
    }

    #[test]
    fn purge() {
        let mut store = TokenStore::new(Duration::seconds(10));
        let now = Utc::now();
        store.issue("a", "auto", vec![], now);
        store.issue("b", "auto", vec![], now + Duration::seconds(20));
        assert_eq!(store.purge_expired(now + Duration::seconds(15)), 1);
        assert_eq!(store.len(), 1);
    }
}
