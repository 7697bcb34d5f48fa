use blake3::hash;

mod config;
mod node;
mod service;
pub mod wire;

pub use config::NodeConfig;
pub use node::{Node, NodeInfo, UserNode};
pub use service::{Reply, ServiceNode};

/// Nodes are addressed by the blake3 digest of their name.
pub type NodeID = [u8; 32];

pub fn node_id(name: &str) -> NodeID {
    *hash(name.as_bytes()).as_bytes()
}
