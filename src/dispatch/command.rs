use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::DispatchError,
    ops::Operations,
    outcome::{Failure, Outcome},
};
use crate::hex::HexDisplayExt;
use crate::mesh::NodeID;
use crate::model::{QueryBuilder, Trip, User};

pub type CommandID = u64;

/// The operation a command asks for, with its payload. The variant alone
/// decides which [`Operations`] method runs.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum CommandKind {
    Join {
        username: String,
        password_hash: String,
    },
    Unjoin {
        username: String,
    },
    RegisterUser(User),
    InsertTrip(Trip),
    SearchTrip(QueryBuilder),
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Join { .. } => "join",
            CommandKind::Unjoin { .. } => "unjoin",
            CommandKind::RegisterUser(_) => "register_user",
            CommandKind::InsertTrip(_) => "insert_trip",
            CommandKind::SearchTrip(_) => "search_trip",
        }
    }

    async fn invoke(self, receiver: &dyn Operations) -> Outcome {
        match self {
            CommandKind::Join {
                username,
                password_hash,
            } => receiver.join(&username, &password_hash).await,
            CommandKind::Unjoin { username } => receiver.unjoin(&username).await,
            CommandKind::RegisterUser(user) => receiver.register_user(user).await,
            CommandKind::InsertTrip(trip) => receiver.insert_trip(trip).await,
            CommandKind::SearchTrip(query) => receiver.search_trip(query).await,
        }
    }
}

/// The part of a command that travels between nodes.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct CommandFrame {
    pub id: CommandID,
    pub kind: CommandKind,
    /// The node whose provider should serve the command.
    pub target: Option<NodeID>,
    /// The node that accepted the command from its client. Set once, never
    /// rewritten by relays.
    pub root_sender: Option<NodeID>,
    /// Nodes the command has been relayed through, oldest first.
    pub hops: Vec<NodeID>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Submitted,
    Completed,
}

pub type Callback = Box<dyn FnOnce(CompletionHandle) + Send + 'static>;

/// One client request, packaged as a value.
///
/// A command is built with its payload, bound to a receiver and executed.
/// [`execute`](Command::execute) spawns the operation and returns at once
/// with a [`CompletionHandle`]; the optional callback fires exactly once
/// when the operation is done, and the outcome is picked up exactly once
/// through [`end_execute`](Command::end_execute). A command runs at most
/// once.
pub struct Command {
    frame: CommandFrame,
    receiver: Option<Arc<dyn Operations>>,
    callback: Option<Callback>,
    cancel: CancellationToken,
    state: CommandState,
    result: Option<Outcome>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self::from_frame(CommandFrame {
            id: rand::random(),
            kind,
            target: None,
            root_sender: None,
            hops: Vec::new(),
        })
    }

    /// Rebuilds a command received from another node. It comes back unbound
    /// and in the `Created` state; the routing fields are kept as they were.
    pub fn from_frame(frame: CommandFrame) -> Self {
        Self {
            frame,
            receiver: None,
            callback: None,
            cancel: CancellationToken::new(),
            state: CommandState::Created,
            result: None,
        }
    }

    pub fn join(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self::new(CommandKind::Join {
            username: username.into(),
            password_hash: password_hash.into(),
        })
    }

    pub fn unjoin(username: impl Into<String>) -> Self {
        Self::new(CommandKind::Unjoin {
            username: username.into(),
        })
    }

    pub fn register_user(user: User) -> Self {
        Self::new(CommandKind::RegisterUser(user))
    }

    pub fn insert_trip(trip: Trip) -> Self {
        Self::new(CommandKind::InsertTrip(trip))
    }

    pub fn search_trip(query: QueryBuilder) -> Self {
        Self::new(CommandKind::SearchTrip(query))
    }

    pub fn with_id(mut self, id: CommandID) -> Self {
        self.frame.id = id;
        self
    }

    /// Addresses the command to the node hosting the receiver.
    pub fn to(mut self, target: NodeID) -> Self {
        self.frame.target = Some(target);
        self
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn Operations>) -> Self {
        self.set_receiver(receiver);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(CompletionHandle) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn set_receiver(&mut self, receiver: Arc<dyn Operations>) {
        self.receiver = Some(receiver);
    }

    pub fn id(&self) -> CommandID {
        self.frame.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.frame.kind
    }

    pub fn target(&self) -> Option<NodeID> {
        self.frame.target
    }

    pub fn root_sender(&self) -> Option<NodeID> {
        self.frame.root_sender
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// The retrieved outcome, once `end_execute` has run.
    pub fn result(&self) -> Option<&Outcome> {
        self.result.as_ref()
    }

    pub fn frame(&self) -> &CommandFrame {
        &self.frame
    }

    pub fn into_frame(self) -> CommandFrame {
        self.frame
    }

    /// Token that cancels the operation once it is in flight.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records the node that accepted the command from its client. Returns
    /// false, leaving the existing value, if a root sender is already set.
    pub(crate) fn stamp_root_sender(&mut self, node: NodeID) -> bool {
        if self.frame.root_sender.is_some() {
            return false;
        }
        self.frame.root_sender = Some(node);
        true
    }

    /// Starts the operation on the bound receiver and returns immediately.
    ///
    /// The returned handle only says the command was submitted. The real
    /// outcome comes from [`end_execute`](Command::end_execute). Must be
    /// called from within a tokio runtime.
    pub fn execute(&mut self) -> Result<CompletionHandle, DispatchError> {
        match self.state {
            CommandState::Created => {}
            CommandState::Submitted => Err(DispatchError::AlreadySubmitted)?,
            CommandState::Completed => Err(DispatchError::AlreadyCompleted)?,
        }
        let receiver = self.receiver.clone().ok_or(DispatchError::NoReceiver)?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let handle = CompletionHandle::new(self.frame.id, outcome_rx, self.cancel.clone());
        let completed = handle.clone();
        let callback = self.callback.take();
        let kind = self.frame.kind.clone();
        let cancel = self.cancel.clone();

        let span = debug_span!("command", id = self.frame.id, op = kind.name());
        tokio::spawn(
            async move {
                // provider panics stay inside `work`
                let mut work =
                    tokio::spawn(async move { kind.invoke(&*receiver).await }.in_current_span());
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        work.abort();
                        debug!("cancelled in flight");
                        Some(Outcome::Failure(Failure::Cancelled))
                    }
                    joined = &mut work => match joined {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            warn!("operation abandoned: {}", e);
                            None
                        }
                    },
                };
                completed.inner.finished.store(true, Ordering::Release);
                match outcome {
                    Some(outcome) => {
                        trace!("operation finished, success: {}", outcome.is_success());
                        // nobody may be waiting for the outcome any more
                        let _ = outcome_tx.send(outcome);
                    }
                    None => drop(outcome_tx),
                }
                // callbacks only fire once execute() has handed back control
                let _ = armed_rx.await;
                if let Some(callback) = callback {
                    callback(completed);
                }
            }
            .instrument(span),
        );

        self.state = CommandState::Submitted;
        debug!(
            "submitted {} command {} for {}",
            self.frame.kind.name(),
            self.frame.id,
            self.frame
                .target
                .map(|t| t.hex().short(4).to_string())
                .unwrap_or_else(|| "local receiver".into()),
        );
        let _ = armed_tx.send(());
        Ok(handle)
    }

    /// Waits for the operation behind `handle` and stores its outcome.
    /// Retrieval happens once: a second call fails with `AlreadyCompleted`,
    /// also when the outcome was taken through the handle itself. Either way
    /// the command ends up `Completed`.
    pub async fn end_execute(
        &mut self,
        handle: &CompletionHandle,
    ) -> Result<Outcome, DispatchError> {
        if handle.command_id() != self.frame.id {
            Err(DispatchError::HandleMismatch {
                command: self.frame.id,
                handle: handle.command_id(),
            })?
        }
        if self.state == CommandState::Completed {
            Err(DispatchError::AlreadyCompleted)?
        }
        let result = handle.end_execute().await;
        match &result {
            Ok(outcome) => self.result = Some(outcome.clone()),
            Err(DispatchError::AlreadyCompleted) => self.result = handle.retrieved().await,
            Err(_) => {}
        }
        self.state = CommandState::Completed;
        result
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("frame", &self.frame)
            .field("bound", &self.receiver.is_some())
            .field("state", &self.state)
            .field("result", &self.result)
            .finish()
    }
}

enum Slot {
    Pending(oneshot::Receiver<Outcome>),
    /// Retrieved; `None` if the operation was abandoned.
    Taken(Option<Outcome>),
}

struct Inflight {
    outcome: Mutex<Slot>,
    finished: AtomicBool,
    cancel: CancellationToken,
}

/// Opaque handle to a submitted command. Handed back by `execute` and passed
/// to the completion callback; clones share the same single outcome.
#[derive(Clone)]
pub struct CompletionHandle {
    command_id: CommandID,
    inner: Arc<Inflight>,
}

impl CompletionHandle {
    fn new(
        command_id: CommandID,
        outcome: oneshot::Receiver<Outcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            command_id,
            inner: Arc::new(Inflight {
                outcome: Mutex::new(Slot::Pending(outcome)),
                finished: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn command_id(&self) -> CommandID {
        self.command_id
    }

    /// Whether the operation has produced its outcome (retrieved or not).
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Asks the in-flight operation to stop. Best effort: an operation that
    /// already finished keeps its outcome.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Waits for the outcome and takes it. Only the first retrieval across
    /// all clones succeeds.
    pub async fn end_execute(&self) -> Result<Outcome, DispatchError> {
        let mut slot = self.inner.outcome.lock().await;
        let Slot::Pending(outcome) = &mut *slot else {
            return Err(DispatchError::AlreadyCompleted);
        };
        let result = outcome.await.map_err(|_| DispatchError::Abandoned);
        *slot = Slot::Taken(result.clone().ok());
        result
    }

    async fn retrieved(&self) -> Option<Outcome> {
        match &*self.inner.outcome.lock().await {
            Slot::Taken(outcome) => outcome.clone(),
            Slot::Pending(_) => None,
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("command_id", &self.command_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
