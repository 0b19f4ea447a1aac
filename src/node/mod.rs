//! Truman mesh node.
//!
//! Combines the networking components into a runnable node:
//! - `NetworkNode`: async API for embedding in an existing runtime
//! - `Backend`: synchronous host contract owning its own runtime

pub mod backend;
pub mod config;
pub mod node;
pub mod strings;

pub use backend::Backend;
pub use config::{ConfigError, NodeConfig};
pub use node::{NetworkNode, NodeError, NodeState, NodeStats};
pub use strings::{decode_list, encode_list, StringListError};
