//! Guardrail condition evaluation over a node's fact window.

use keystone_core::{Condition, Fact};

/// Whether `condition` holds over `window` (oldest first, expired facts removed).
pub fn holds(condition: &Condition, window: &[Fact]) -> bool {
    let rejected = |f: &Fact| !f.is_certified();
    match condition {
        Condition::LastRejected => window.last().is_some_and(rejected),
        Condition::ConsecutiveRejections { count } => {
            *count > 0 && window.len() >= *count && window.iter().rev().take(*count).all(rejected)
        }
        Condition::RejectionsInWindow { count, window: span } => {
            *count > 0 && window.iter().rev().take(*span).filter(|f| rejected(f)).count() >= *count
        }
        Condition::InvariantFailed { invariant } => window.last().is_some_and(|f| {
            f.predicate_results
                .iter()
                .any(|r| !r.passed && &r.invariant == invariant)
        }),
    }
}
