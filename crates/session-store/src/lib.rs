//! Durable checkpoints for subscriber credit pools
//!
//! Holds the persisted half of the two-phase update discipline. The live
//! pools of a session keep running in memory; after each batch of work the
//! caller drains them and hands the changes here.
//!
//! Session flow:
//! 1. Session starts → `SessionStore::put` with the initial pool snapshots
//! 2. Live pools handle usage, scans and grants
//! 3. `SessionUpdate::take` drains what changed
//! 4. `SessionStore::apply_update` replays it onto the checkpoint and persists
//! 5. Process restarts → `SessionStore::restore` rebuilds the live pools
//! 6. Session ends → `SessionStore::remove`

pub mod error;
pub mod state;
pub mod store;

pub use error::{Error, Result};
pub use state::{SessionUpdate, StoredSessionState};
pub use store::SessionStore;
