//! Facade crate wiring kiln's microcrates into a single build session:
//! loads a [`project::Project`], drives it through the track/fetch/pull/
//! build/push pipeline via [`kiln_scheduler::Scheduler`], and re-exports
//! the pieces a frontend needs without depending on every microcrate
//! directly.

pub mod project;
pub mod session;
pub mod stage;
pub mod worker;

pub use project::{PlanGraph, Project};
pub use session::{BuildSession, ElementReport, SessionOptions, SessionReport};

pub use kiln_artifact::{ArtifactStore, Completeness, FsRefStore};
pub use kiln_cas::FsStore;
pub use kiln_config::{load_config, OnError, SessionConfig};
pub use kiln_events::{EventLog, EventType, SessionEvent};
pub use kiln_lock::SessionLock;
pub use kiln_remote::{ArtifactRef, MemoryRemoteCache, RemoteCache};
pub use kiln_types::{Element, LoadError, Source};
