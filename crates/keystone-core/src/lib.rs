//! Keystone Core - shared types, configuration, persistence and error handling

pub mod build;
pub mod config;
pub mod error;
pub mod event;
pub mod fact;
pub mod store;
pub mod types;

pub use build::*;
pub use config::KeystoneConfig;
pub use error::{Error, ErrorKind, Result};
pub use event::*;
pub use fact::*;
pub use store::{FsStore, MemoryStore, Snapshot, StateStore};
pub use types::*;
