//! keystone-certifier — turns succeeded builds into signed, hash-linked facts
//!
//! Certification is read-then-attest: invariants are evaluated against the
//! build's published state, the outcome is signed and appended to the node's
//! ledger, and the fact is announced whether it passed or not.

pub mod certifier;
pub mod ledger;
pub mod predicate;
pub mod signer;

pub use certifier::Certifier;
pub use ledger::FactLedger;
pub use predicate::{evaluate, evaluate_invariants};
pub use signer::FactSigner;
