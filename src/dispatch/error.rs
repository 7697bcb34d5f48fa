use thiserror::Error;

use super::command::CommandID;
use crate::hex::HexDisplayExt;
use crate::mesh::{wire, NodeID};

/// Dispatch-layer errors. These are local to the caller of `execute` /
/// `end_execute` / `submit` and are returned immediately. Business failures
/// never show up here: they travel inside an
/// [`Outcome`](super::Outcome).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("command has no receiver")]
    NoReceiver,
    #[error("command was already submitted")]
    AlreadySubmitted,
    #[error("command result was already retrieved")]
    AlreadyCompleted,
    #[error("handle belongs to command {handle}, not {command}")]
    HandleMismatch { command: CommandID, handle: CommandID },
    #[error("operation was dropped before producing an outcome")]
    Abandoned,
    #[error("sender is not a user of this node")]
    NotLocalUser,
    #[error("no route to node {}", .0.hex())]
    NoRoute(NodeID),
    #[error("relay came from a node that is not a neighbour")]
    NotNeighbour,
    #[error("node went away")]
    NodeGone,
    #[error("neighbour did not reply in time")]
    Timeout,
    #[error("wire error: {0}")]
    Wire(#[from] wire::Error),
}

impl DispatchError {
    /// Errors after which a forwarding node should try another neighbour.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            DispatchError::NoRoute(_)
                | DispatchError::NotNeighbour
                | DispatchError::NodeGone
                | DispatchError::Timeout
        )
    }
}
