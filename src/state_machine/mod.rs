//! State machine layer
//!
//! - `KvStateMachine`: key-value store with idempotent client retries
//! - `RecordingStateMachine`: records applied entries for testing

pub mod kv;
pub mod traits;

pub use kv::{KeyValueStore, KvCommand, KvStateMachine, SharedKvStore};
pub use traits::{AppliedEntries, ApplyResult, RecordingStateMachine, StateMachine, StateMachineError};
