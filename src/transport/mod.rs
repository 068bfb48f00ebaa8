//! Transport layer for peer RPC communication
//!
//! - `InMemoryNetwork` / `InMemoryTransport`: in-process delivery with
//!   partition control, for tests and the demo cluster

pub mod inmemory;
pub mod traits;

pub use inmemory::{InMemoryNetwork, InMemoryTransport};
pub use traits::{PeerTransport, TransportError};
