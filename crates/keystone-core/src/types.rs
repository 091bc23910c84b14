//! Core types for Keystone: node identity, manifests, invariants and guardrails

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const MAX_ID_LEN: usize = 128;

/// Node identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, bounded, restricted to `[A-Za-z0-9._:-]`, and not only dots.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_ID_LEN
            && !self.0.chars().all(|c| c == '.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0.to_string()
    }
}

/// Blueprint manifest for one node. Owned by the registry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub id: NodeId,
    pub version: u64,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub invariants: Vec<Invariant>,
    #[serde(default)]
    pub guardrails: Vec<GuardrailRule>,
    /// Build parameters handed to the node's builder. Opaque to the core.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Manifest {
    pub fn new(id: impl Into<NodeId>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
            dependencies: Vec::new(),
            invariants: Vec::new(),
            guardrails: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, dep: impl Into<NodeId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_invariant(mut self, id: impl Into<String>, predicate: Predicate) -> Self {
        self.invariants.push(Invariant {
            id: id.into(),
            predicate,
        });
        self
    }

    pub fn with_guardrail(mut self, rule: GuardrailRule) -> Self {
        self.guardrails.push(rule);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Schema checks that need nothing but the manifest itself.
    pub fn validate(&self) -> Result<()> {
        let id = self.id.as_str();
        if !self.id.is_well_formed() {
            return Err(Error::validation(id, "id must be 1-128 chars of [A-Za-z0-9._:-]"));
        }
        if self.version == 0 {
            return Err(Error::validation(id, "version must be >= 1"));
        }

        let mut deps = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.id {
                return Err(Error::validation(id, "node cannot depend on itself"));
            }
            if !dep.is_well_formed() {
                return Err(Error::validation(id, format!("malformed dependency id '{}'", dep)));
            }
            if !deps.insert(dep) {
                return Err(Error::validation(id, format!("duplicate dependency '{}'", dep)));
            }
        }

        let mut invariants = HashSet::new();
        for inv in &self.invariants {
            if inv.id.trim().is_empty() {
                return Err(Error::validation(id, "invariant id must not be empty"));
            }
            if !invariants.insert(inv.id.as_str()) {
                return Err(Error::validation(id, format!("duplicate invariant '{}'", inv.id)));
            }
        }

        let mut rules = HashSet::new();
        for rule in &self.guardrails {
            if rule.id.trim().is_empty() {
                return Err(Error::validation(id, "guardrail id must not be empty"));
            }
            if !rules.insert(rule.id.as_str()) {
                return Err(Error::validation(id, format!("duplicate guardrail '{}'", rule.id)));
            }
            if rule.max_attempts == 0 {
                return Err(Error::validation(
                    id,
                    format!("guardrail '{}' needs max_attempts >= 1", rule.id),
                ));
            }
            if let Scope::Node(target) = &rule.scope {
                if !target.is_well_formed() {
                    return Err(Error::validation(
                        id,
                        format!("guardrail '{}' has malformed scope '{}'", rule.id, target),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named predicate the node's post-build state must satisfy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Invariant {
    pub id: String,
    pub predicate: Predicate,
}

/// Closed predicate vocabulary over a node's JSON state. Paths are JSON pointers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Exists { path: String },
    Equals { path: String, value: serde_json::Value },
    NotEquals { path: String, value: serde_json::Value },
    AtLeast { path: String, min: f64 },
    AtMost { path: String, max: f64 },
    OneOf { path: String, values: Vec<serde_json::Value> },
    NonEmpty { path: String },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    pub fn equals(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Equals {
            path: path.into(),
            value,
        }
    }

    pub fn at_least(path: impl Into<String>, min: f64) -> Self {
        Self::AtLeast {
            path: path.into(),
            min,
        }
    }
}

/// Which nodes a guardrail rule watches. `"*"` on the wire is the wildcard.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    Node(NodeId),
    Any,
}

impl Scope {
    pub fn matches(&self, node: &NodeId) -> bool {
        match self {
            Self::Node(id) => id == node,
            Self::Any => true,
        }
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        if s == "*" {
            Self::Any
        } else {
            Self::Node(NodeId::new(s))
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Node(id) => id.into(),
            Scope::Any => "*".into(),
        }
    }
}

/// Condition over a node's recent fact window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The most recent fact was rejected.
    LastRejected,
    /// The trailing `count` facts were all rejected.
    ConsecutiveRejections { count: usize },
    /// At least `count` of the last `window` facts were rejected.
    RejectionsInWindow { count: usize, window: usize },
    /// The most recent fact failed the named invariant.
    InvariantFailed { invariant: String },
}

/// Bounded action vocabulary a guardrail may request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    RetryBuild,
    RollbackNode,
    Escalate,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryBuild => write!(f, "retry-build"),
            Self::RollbackNode => write!(f, "rollback-node"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// Declarative remediation policy carried in a node's manifest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GuardrailRule {
    pub id: String,
    pub scope: Scope,
    pub condition: Condition,
    pub action: ActionKind,
    pub max_attempts: u32,
}

impl GuardrailRule {
    pub fn new(
        id: impl Into<String>,
        scope: Scope,
        condition: Condition,
        action: ActionKind,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            scope,
            condition,
            action,
            max_attempts,
        }
    }
}

/// Remediation emitted by the autonomy controller. Each variant carries only what it needs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RemediationAction {
    RetryBuild,
    RollbackNode,
    Escalate { reason: String },
}

impl RemediationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::RetryBuild => ActionKind::RetryBuild,
            Self::RollbackNode => ActionKind::RollbackNode,
            Self::Escalate { .. } => ActionKind::Escalate,
        }
    }
}

/// Lifecycle status of a registered node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registered,
    Pending,
    Running,
    Built,
    Certified,
    Rejected,
    Failed,
    Blocked,
    RolledBack,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Built => "built",
            Self::Certified => "certified",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}
