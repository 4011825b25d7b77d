//! String matching shared by autosign rules, ACLs and targeting.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

/// Shell-style glob match (`*`, `?`, `[abc]`). Invalid patterns never match.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(value))
        .unwrap_or(false)
}

/// Compiled rule regexes, keyed by their anchored source. Patterns come from
/// configuration, so the set stays small.
static COMPILED: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();

fn compiled(anchored: String, pattern: &str) -> Option<Regex> {
    let cache = COMPILED.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    cache
        .entry(anchored)
        .or_insert_with_key(|source| match Regex::new(source) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Invalid regular expression");
                None
            }
        })
        .clone()
}

/// Regex that must match the whole value. Invalid patterns never match.
pub fn regex_full_match(pattern: &str, value: &str) -> bool {
    compiled(format!("^(?:{})$", pattern), pattern).is_some_and(|re| re.is_match(value))
}

/// Regex anchored at the start only, the way minion ids are matched against
/// peer rule keys.
pub fn regex_prefix_match(pattern: &str, value: &str) -> bool {
    compiled(format!("^(?:{})", pattern), pattern).is_some_and(|re| re.is_match(value))
}

/// Exact, then glob, then full regex.
pub fn expr_match(pattern: &str, value: &str) -> bool {
    pattern == value || glob_match(pattern, value) || regex_full_match(pattern, value)
}
