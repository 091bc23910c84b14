//! keystone-autonomy — bounded, policy-driven reaction to certified facts
//!
//! Guardrail rules declared in manifests are evaluated against each node's
//! recent fact window. Firing rules emit remediation events on the bus; the
//! controller never calls into the orchestrator directly. Attempts are counted
//! per (node, rule) and degrade to escalation once exhausted, and a governor
//! caps how much automated action the system may take overall.

pub mod audit;
pub mod condition;
pub mod controller;
pub mod governor;

pub use audit::{AuditEntry, AuditTrail};
pub use condition::holds;
pub use controller::AutonomyController;
pub use governor::Governor;
