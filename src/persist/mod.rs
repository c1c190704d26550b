// src/persist/mod.rs

//! Session persistence.
//!
//! [`TransitionStore`] is the write path for every status change. Two
//! implementations ship: [`FileStore`] (snapshot + append-only transition
//! log in a session directory) and [`MemoryStore`]. [`recovery`] turns a
//! loaded session back into a runnable graph.

pub mod file_store;
pub mod record;
pub mod recovery;
pub mod retry;
pub mod store;

pub use file_store::FileStore;
pub use record::{Actor, TransitionRecord};
pub use recovery::{RecoveryStats, recover};
pub use retry::{DEFAULT_CONFLICT_ATTEMPTS, with_conflict_retry};
pub use store::{MemoryStore, SessionState, Snapshot, TransitionStore};
