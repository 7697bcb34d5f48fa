mod command;
mod error;
mod ops;
mod outcome;

pub use command::{
    Callback, Command, CommandFrame, CommandID, CommandKind, CommandState, CompletionHandle,
};
pub use error::DispatchError;
pub use ops::{MemoryOperations, Operations};
pub use outcome::{Failure, Outcome, Payload};
