//! Error types for Keystone

use crate::types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error for '{node}': {reason}")]
    Validation { node: String, reason: String },

    #[error("dependency cycle: {}", render_cycle(.cycle))]
    Cycle { cycle: Vec<NodeId> },

    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("build failure on {node} (attempt {attempt}): {message}")]
    BuildFailure {
        node: NodeId,
        attempt: u32,
        message: String,
    },

    #[error("certification rejected {node} build {build_id}: failed {failed:?}")]
    CertificationRejection {
        node: NodeId,
        build_id: String,
        failed: Vec<String>,
    },

    #[error("delivery failure on {topic} to {subscriber}: {reason}")]
    DeliveryFailure {
        topic: String,
        subscriber: String,
        reason: String,
        /// Critical topics hand the failure to the publisher instead of retrying.
        critical: bool,
    },

    #[error("rollback of {node} exceeded budget: {elapsed_ms}ms > {budget_ms}ms")]
    RollbackTimeout {
        node: NodeId,
        elapsed_ms: u64,
        budget_ms: u64,
    },

    #[error("fact ledger for {node} broken at position {position}: {reason}")]
    LedgerTampered {
        node: NodeId,
        position: usize,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed classification of [`Error`], used in events and status reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Cycle,
    NotFound,
    BuildFailure,
    CertificationRejection,
    DeliveryFailure,
    RollbackTimeout,
    LedgerTampered,
    Store,
    Config,
    Internal,
}

fn render_cycle(cycle: &[NodeId]) -> String {
    cycle
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    pub fn validation(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn build_failure(node: &NodeId, attempt: u32, message: impl Into<String>) -> Self {
        Self::BuildFailure {
            node: node.clone(),
            attempt,
            message: message.into(),
        }
    }

    pub fn delivery_failure(
        topic: impl Into<String>,
        subscriber: impl Into<String>,
        reason: impl Into<String>,
        critical: bool,
    ) -> Self {
        Self::DeliveryFailure {
            topic: topic.into(),
            subscriber: subscriber.into(),
            reason: reason.into(),
            critical,
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Cycle { .. } => ErrorKind::Cycle,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BuildFailure { .. } => ErrorKind::BuildFailure,
            Self::CertificationRejection { .. } => ErrorKind::CertificationRejection,
            Self::DeliveryFailure { .. } => ErrorKind::DeliveryFailure,
            Self::RollbackTimeout { .. } => ErrorKind::RollbackTimeout,
            Self::LedgerTampered { .. } => ErrorKind::LedgerTampered,
            Self::Store(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the owning component may retry locally. Delivery failures only
    /// qualify on advisory topics.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BuildFailure { .. } | Self::Io(_) => true,
            Self::DeliveryFailure { critical, .. } => !critical,
            _ => false,
        }
    }
}
