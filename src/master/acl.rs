//! Who may run what.
//!
//! Peer rules gate minion-originated requests: the minion id is matched
//! against each rule key (a regex anchored at the start) in configuration
//! order, and only the first matching key's function list applies. Client
//! ACLs gate external users, with the blacklist consulted first. Everything
//! not explicitly granted is denied.

use crate::config::{AclBlacklist, OrderedRules};
use crate::matcher::{expr_match, regex_prefix_match};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// No rule key matches the subject.
    NoMatchingRule,
    /// A rule matched the subject but none of its patterns match the function.
    FunctionNotPermitted,
    BlacklistedUser,
    BlacklistedModule,
    /// Peer publish of a `publish.*` function.
    RecursivePublish,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NoMatchingRule => write!(f, "no rule matches the caller"),
            DenyReason::FunctionNotPermitted => write!(f, "function not permitted"),
            DenyReason::BlacklistedUser => write!(f, "user is blacklisted"),
            DenyReason::BlacklistedModule => write!(f, "module is blacklisted"),
            DenyReason::RecursivePublish => write!(f, "recursive publish refused"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Function patterns of the first rule whose key matches `subject`.
fn first_matching<'a>(
    rules: &'a OrderedRules,
    subject: &str,
    key_matches: impl Fn(&str, &str) -> bool,
) -> Option<&'a [String]> {
    rules
        .iter()
        .find(|(key, _)| key_matches(key, subject))
        .map(|(_, patterns)| patterns.as_slice())
}

fn permits(patterns: &[String], function: &str) -> bool {
    patterns.iter().any(|p| expr_match(p, function))
}

/// `peer` and `peer_run` rules.
#[derive(Debug, Clone, Default)]
pub struct PeerAcl {
    peer: OrderedRules,
    peer_run: OrderedRules,
}

impl PeerAcl {
    pub fn new(peer: OrderedRules, peer_run: OrderedRules) -> Self {
        Self { peer, peer_run }
    }

    /// May `minion_id` publish `function` to other minions?
    pub fn authorize_publish(&self, minion_id: &str, function: &str) -> Decision {
        if function.starts_with("publish.") {
            tracing::warn!(minion_id, function, "Minion attempted a recursive peer publish");
            return Decision::Deny(DenyReason::RecursivePublish);
        }
        Self::decide(&self.peer, minion_id, function)
    }

    /// May `minion_id` invoke the runner `function` on the master?
    pub fn authorize_run(&self, minion_id: &str, function: &str) -> Decision {
        Self::decide(&self.peer_run, minion_id, function)
    }

    fn decide(rules: &OrderedRules, minion_id: &str, function: &str) -> Decision {
        match first_matching(rules, minion_id, regex_prefix_match) {
            None => Decision::Deny(DenyReason::NoMatchingRule),
            Some(patterns) if permits(patterns, function) => Decision::Allow,
            Some(_) => Decision::Deny(DenyReason::FunctionNotPermitted),
        }
    }
}

/// `client_acl` plus `client_acl_blacklist`.
#[derive(Debug, Clone, Default)]
pub struct ClientAcl {
    acl: OrderedRules,
    blacklist: AclBlacklist,
}

impl ClientAcl {
    pub fn new(acl: OrderedRules, blacklist: AclBlacklist) -> Self {
        Self { acl, blacklist }
    }

    /// Blacklist check alone. Also applied to token-authorized calls.
    pub fn check_blacklist(&self, user: &str, function: &str) -> Option<DenyReason> {
        if self.blacklist.users.iter().any(|p| expr_match(p, user)) {
            return Some(DenyReason::BlacklistedUser);
        }
        let module = function.split('.').next().unwrap_or(function);
        if self.blacklist.modules.iter().any(|p| expr_match(p, module)) {
            return Some(DenyReason::BlacklistedModule);
        }
        None
    }

    pub fn authorize(&self, user: &str, function: &str) -> Decision {
        if let Some(reason) = self.check_blacklist(user, function) {
            tracing::info!(user, function, %reason, "Client call refused by blacklist");
            return Decision::Deny(reason);
        }
        match first_matching(&self.acl, user, expr_match) {
            None => Decision::Deny(DenyReason::NoMatchingRule),
            Some(patterns) if permits(patterns, function) => Decision::Allow,
            Some(_) => Decision::Deny(DenyReason::FunctionNotPermitted),
        }
    }
}

/// Capabilities an external-auth backend grants `user`: the function patterns
/// of the first matching user key.
pub fn capabilities_for(rules: &OrderedRules, user: &str) -> Option<Vec<String>> {
    first_matching(rules, user, expr_match).map(|p| p.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_denies_by_default() {
        let acl = PeerAcl::new(OrderedRules::new().with_rule("web.*", &["test.*"]), OrderedRules::new());
        assert_eq!(
            acl.authorize_publish("db1", "test.ping"),
            Decision::Deny(DenyReason::NoMatchingRule)
        );
        assert_eq!(
            PeerAcl::default().authorize_run("web1", "manage.up"),
            Decision::Deny(DenyReason::NoMatchingRule)
        );
    }

    #[test]
    fn peer_first_matching_key_decides() {
        let rules = OrderedRules::new()
            .with_rule("web.*", &["test.*"])
            .with_rule(".*", &["network.interfaces"]);
        let acl = PeerAcl::new(rules, OrderedRules::new());

        assert!(acl.authorize_publish("web1", "test.ping").is_allowed());
        // web1 hits the first key, whose list lacks network.interfaces.
        assert_eq!(
            acl.authorize_publish("web1", "network.interfaces"),
            Decision::Deny(DenyReason::FunctionNotPermitted)
        );
        assert!(acl.authorize_publish("db1", "network.interfaces").is_allowed());
    }

    #[test]
    fn peer_key_is_anchored_at_start() {
        let acl = PeerAcl::new(OrderedRules::new().with_rule("web", &[".*"]), OrderedRules::new());
        assert!(acl.authorize_publish("web1.example.com", "cmd.run").is_allowed());
        assert!(!acl.authorize_publish("prodweb1", "cmd.run").is_allowed());
    }

    #[test]
    fn recursive_publish_refused() {
        let acl = PeerAcl::new(OrderedRules::new().with_rule(".*", &[".*"]), OrderedRules::new());
        assert_eq!(
            acl.authorize_publish("web1", "publish.publish"),
            Decision::Deny(DenyReason::RecursivePublish)
        );
    }

    #[test]
    fn peer_run_uses_its_own_rules() {
        let acl = PeerAcl::new(
            OrderedRules::new(),
            OrderedRules::new().with_rule("web1", &["manage.up"]),
        );
        assert!(acl.authorize_run("web1", "manage.up").is_allowed());
        assert!(!acl.authorize_publish("web1", "manage.up").is_allowed());
    }

    #[test]
    fn blacklisted_user_denied_despite_acl() {
        let acl = ClientAcl::new(
            OrderedRules::new().with_rule("fred", &["test.*"]),
            AclBlacklist {
                users: vec!["fred".into()],
                modules: vec![],
            },
        );
        assert_eq!(
            acl.authorize("fred", "test.ping"),
            Decision::Deny(DenyReason::BlacklistedUser)
        );
    }

    #[test]
    fn blacklisted_module_denied() {
        let acl = ClientAcl::new(
            OrderedRules::new().with_rule("fred", &[".*"]),
            AclBlacklist {
                users: vec![],
                modules: vec!["cmd".into()],
            },
        );
        assert_eq!(
            acl.authorize("fred", "cmd.run"),
            Decision::Deny(DenyReason::BlacklistedModule)
        );
        assert!(acl.authorize("fred", "test.ping").is_allowed());
    }

    #[test]
    fn capabilities_follow_first_user_key() {
        let rules = OrderedRules::new()
            .with_rule("fred", &["test.*"])
            .with_rule("*", &["grains.items"]);
        assert_eq!(capabilities_for(&rules, "fred").unwrap(), vec!["test.*"]);
        assert_eq!(capabilities_for(&rules, "alice").unwrap(), vec!["grains.items"]);
        assert!(capabilities_for(&OrderedRules::new(), "fred").is_none());
    }
}
