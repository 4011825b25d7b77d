//! Target expressions: which of the known minions a publication goes to.
//!
//! Simple forms match a minion id (`glob`, `pcre`, `list`) or its grains
//! (`grain`, `grain_pcre`). A `compound` expression combines them with
//! `and`, `or`, `not` and parentheses, using prefixed terms:
//!
//! | prefix | meaning                     | example              |
//! |--------|-----------------------------|----------------------|
//! | `G@`   | grain glob                  | `G@os:Ubuntu`        |
//! | `P@`   | grain regex                 | `P@os:(Debian|Ubuntu)` |
//! | `L@`   | comma separated id list     | `L@web1,web2`        |
//! | `E@`   | id regex                    | `E@web\d+`           |
//! | `N@`   | nodegroup                   | `N@webservers`       |
//!
//! A bare word is an id glob.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BrineError, Result};

pub type Grains = BTreeMap<String, serde_json::Value>;

const GRAIN_DELIMITER: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Glob,
    Pcre,
    List,
    Grain,
    GrainPcre,
    Nodegroup,
    Compound,
}

impl FromStr for TargetType {
    type Err = BrineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "glob" => Ok(TargetType::Glob),
            "pcre" => Ok(TargetType::Pcre),
            "list" => Ok(TargetType::List),
            "grain" => Ok(TargetType::Grain),
            "grain_pcre" => Ok(TargetType::GrainPcre),
            "nodegroup" => Ok(TargetType::Nodegroup),
            "compound" => Ok(TargetType::Compound),
            other => Err(BrineError::InvalidTarget(format!(
                "unknown target type {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetType::Glob => "glob",
            TargetType::Pcre => "pcre",
            TargetType::List => "list",
            TargetType::Grain => "grain",
            TargetType::GrainPcre => "grain_pcre",
            TargetType::Nodegroup => "nodegroup",
            TargetType::Compound => "compound",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
enum ValueMatcher {
    Glob(glob::Pattern),
    Regex(Regex),
}

impl ValueMatcher {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match value {
            serde_json::Value::Array(items) => items.iter().any(|v| self.matches(v)),
            serde_json::Value::Object(_) | serde_json::Value::Null => false,
            serde_json::Value::String(s) => self.matches_str(s),
            other => self.matches_str(&other.to_string()),
        }
    }

    fn matches_str(&self, value: &str) -> bool {
        match self {
            ValueMatcher::Glob(p) => p.matches(&value.to_lowercase()),
            ValueMatcher::Regex(re) => re.is_match(value),
        }
    }
}

/// One way of reading `a:b:c` as a grain path plus a value pattern.
#[derive(Debug)]
struct GrainCandidate {
    path: Vec<String>,
    value: ValueMatcher,
}

#[derive(Debug)]
enum Node {
    IdGlob(glob::Pattern),
    IdRegex(Regex),
    IdList(HashSet<String>),
    Grain(Vec<GrainCandidate>),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

impl Node {
    fn matches(&self, id: &str, grains: &Grains) -> bool {
        match self {
            Node::IdGlob(p) => p.matches(id),
            Node::IdRegex(re) => re.is_match(id),
            Node::IdList(ids) => ids.contains(id),
            Node::Grain(candidates) => candidates.iter().any(|c| {
                lookup_path(grains, &c.path).is_some_and(|v| c.value.matches(v))
            }),
            Node::Not(inner) => !inner.matches(id, grains),
            Node::And(nodes) => nodes.iter().all(|n| n.matches(id, grains)),
            Node::Or(nodes) => nodes.iter().any(|n| n.matches(id, grains)),
        }
    }
}

fn lookup_path<'a>(grains: &'a Grains, path: &[String]) -> Option<&'a serde_json::Value> {
    let (first, rest) = path.split_first()?;
    let mut value = grains.get(first)?;
    for key in rest {
        value = value.as_object()?.get(key)?;
    }
    Some(value)
}

/// A compiled target expression.
#[derive(Debug)]
pub struct Target {
    root: Node,
}

impl Target {
    pub fn parse(
        expr: &str,
        tgt_type: TargetType,
        nodegroups: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut seen = Vec::new();
        let root = compile(expr, tgt_type, nodegroups, &mut seen)?;
        Ok(Self { root })
    }

    pub fn matches(&self, id: &str, grains: &Grains) -> bool {
        self.root.matches(id, grains)
    }

    /// Ids among `minions` the expression selects.
    pub fn select<'a, I>(&self, minions: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = (&'a str, &'a Grains)>,
    {
        minions
            .into_iter()
            .filter(|(id, grains)| self.matches(id, grains))
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

fn compile(
    expr: &str,
    tgt_type: TargetType,
    nodegroups: &BTreeMap<String, String>,
    seen: &mut Vec<String>,
) -> Result<Node> {
    let expr = expr.trim();
    match tgt_type {
        TargetType::Glob => glob_node(expr),
        TargetType::Pcre => Ok(Node::IdRegex(id_regex(expr)?)),
        TargetType::List => Ok(Node::IdList(
            expr.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )),
        TargetType::Grain => grain_node(expr, false),
        TargetType::GrainPcre => grain_node(expr, true),
        TargetType::Nodegroup => nodegroup_node(expr, nodegroups, seen),
        TargetType::Compound => {
            let tokens = tokenize(expr);
            if tokens.is_empty() {
                return Err(BrineError::InvalidTarget("empty compound expression".into()));
            }
            let mut parser = Parser {
                tokens,
                pos: 0,
                nodegroups,
                seen,
            };
            let node = parser.or_expr()?;
            if parser.pos != parser.tokens.len() {
                return Err(BrineError::InvalidTarget(format!(
                    "unexpected {:?} in {:?}",
                    parser.tokens[parser.pos], expr
                )));
            }
            Ok(node)
        }
    }
}

fn glob_node(expr: &str) -> Result<Node> {
    glob::Pattern::new(expr)
        .map(Node::IdGlob)
        .map_err(|e| BrineError::InvalidTarget(format!("bad glob {:?}: {}", expr, e)))
}

/// Id regexes are anchored at the start only.
fn id_regex(expr: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})", expr))
        .map_err(|e| BrineError::InvalidTarget(format!("bad regex {:?}: {}", expr, e)))
}

/// Grain values compare case-insensitively, so `os:ubuntu` selects `Ubuntu`.
fn grain_regex(expr: &str) -> Result<Regex> {
    Regex::new(&format!("(?i)^(?:{})", expr))
        .map_err(|e| BrineError::InvalidTarget(format!("bad regex {:?}: {}", expr, e)))
}

fn grain_node(expr: &str, regex: bool) -> Result<Node> {
    let parts: Vec<&str> = expr.split(GRAIN_DELIMITER).collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return Err(BrineError::InvalidTarget(format!(
            "grain target {:?} must look like key:value",
            expr
        )));
    }
    let mut candidates = Vec::new();
    for split in 1..parts.len() {
        let path = parts[..split].iter().map(|s| s.to_string()).collect();
        let pattern = parts[split..].join(&GRAIN_DELIMITER.to_string());
        let value = if regex {
            ValueMatcher::Regex(grain_regex(&pattern)?)
        } else {
            match glob::Pattern::new(&pattern.to_lowercase()) {
                Ok(p) => ValueMatcher::Glob(p),
                Err(_) => continue,
            }
        };
        candidates.push(GrainCandidate { path, value });
    }
    if candidates.is_empty() {
        return Err(BrineError::InvalidTarget(format!("bad grain pattern {:?}", expr)));
    }
    Ok(Node::Grain(candidates))
}

fn nodegroup_node(
    name: &str,
    nodegroups: &BTreeMap<String, String>,
    seen: &mut Vec<String>,
) -> Result<Node> {
    if seen.iter().any(|s| s == name) {
        return Err(BrineError::InvalidTarget(format!(
            "nodegroup {:?} refers to itself",
            name
        )));
    }
    let expr = nodegroups
        .get(name)
        .ok_or_else(|| BrineError::InvalidTarget(format!("unknown nodegroup {:?}", name)))?;
    seen.push(name.to_string());
    let node = compile(expr, TargetType::Compound, nodegroups, seen);
    seen.pop();
    node
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Term(String),
}

/// Split on whitespace, then peel parentheses off term edges. A closing
/// paren that balances one inside the term (as in `E@web(1|2)`) stays.
fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for word in expr.split_whitespace() {
        let mut word = word;
        while let Some(rest) = word.strip_prefix('(') {
            tokens.push(Token::Open);
            word = rest;
        }
        let mut closes = 0;
        while word.ends_with(')')
            && word.matches(')').count() > word.matches('(').count()
        {
            word = &word[..word.len() - 1];
            closes += 1;
        }
        match word {
            "" => {}
            "and" => tokens.push(Token::And),
            "or" => tokens.push(Token::Or),
            "not" => tokens.push(Token::Not),
            term => tokens.push(Token::Term(term.to_string())),
        }
        tokens.extend(std::iter::repeat(Token::Close).take(closes));
    }
    tokens
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    nodegroups: &'a BTreeMap<String, String>,
    seen: &'a mut Vec<String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<Node> {
        let mut nodes = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            nodes.push(self.and_expr()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::Or(nodes)
        })
    }

    fn and_expr(&mut self) -> Result<Node> {
        let mut nodes = vec![self.not_expr()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            nodes.push(self.not_expr()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::And(nodes)
        })
    }

    fn not_expr(&mut self) -> Result<Node> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.not_expr()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| BrineError::InvalidTarget("compound expression ends early".into()))?;
        self.pos += 1;
        match token {
            Token::Open => {
                let node = self.or_expr()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(BrineError::InvalidTarget("unbalanced parenthesis".into()));
                }
                self.pos += 1;
                Ok(node)
            }
            Token::Term(term) => self.term(&term),
            other => Err(BrineError::InvalidTarget(format!(
                "expected a target term, found {:?}",
                other
            ))),
        }
    }

    fn term(&mut self, term: &str) -> Result<Node> {
        let Some((prefix, body)) = term.split_once('@').filter(|(p, _)| p.len() == 1) else {
            return glob_node(term);
        };
        match prefix {
            "G" => grain_node(body, false),
            "P" => grain_node(body, true),
            "L" => compile(body, TargetType::List, self.nodegroups, self.seen),
            "E" => Ok(Node::IdRegex(id_regex(body)?)),
            "N" => nodegroup_node(body, self.nodegroups, self.seen),
            other => Err(BrineError::InvalidTarget(format!(
                "unsupported matcher prefix {}@",
                other
            ))),
        }
    }
}
