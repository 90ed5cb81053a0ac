//! # LKV Sync Client
//!
//! Purpose: Talk to a cluster of length-prefixed key-value nodes over pooled,
//! synchronous TCP connections.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per node; growth and
//!    shrink are bounded by each node's configuration.
//! 2. **Deterministic Routing**: Keys map to nodes through a weighted
//!    consistent-hash ring, so membership changes move few keys.
//! 3. **Minimal Allocation**: Codec buffers live with their connection and
//!    are reused across commands.
//! 4. **Protocol Clarity**: Blocks are framed and parsed explicitly and
//!    decoding resumes across partial reads.

pub mod codec;
mod connection;
mod connectors;
mod pool;
mod ring;
pub mod router;

pub use codec::{Reply, STATUS_NOT_FOUND, STATUS_OK};
pub use connection::Connection;
pub use connectors::{Connectors, Handle};
pub use lkv_common::{
    BusyReason, ConnectorsConfig, HandoffPolicy, LkvError, LkvResult, NodeConfig, Value,
};
pub use pool::{Pool, PoolStats, PoolStatus, PooledConnection};
pub use router::HashRing;
