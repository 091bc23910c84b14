//! keystone-orchestrator — incremental rebuild scheduling and bounded rollback
//!
//! A single consumer loop owns every scheduling decision. Graph changes,
//! manual triggers, remediation actions, finished builds and issued facts all
//! enter the same queue; build tasks run concurrently under a global limit and
//! report back through it.

pub mod builder;
pub mod journal;
pub mod live;
pub mod orchestrator;
pub mod recovery;
pub mod rollback;

pub use builder::{BuildContext, BuilderRegistry, ManifestBuilder, NodeBuilder};
pub use journal::BuildJournal;
pub use live::LiveStates;
pub use orchestrator::Orchestrator;
pub use rollback::rollback;
