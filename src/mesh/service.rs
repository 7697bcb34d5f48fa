use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use rkyv::{Archive, Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, RwLock, RwLockWriteGuard},
    time::timeout,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    config::NodeConfig,
    node::{Node, NodeInfo, UserNode},
    node_id, wire, NodeID,
};
use crate::dispatch::{
    Command, CommandFrame, CommandID, CommandState, DispatchError, Operations, Outcome,
};
use crate::hex::HexDisplayExt;

/// The answer to a command, as it travels back towards the root sender.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct Reply {
    pub command_id: CommandID,
    /// The node that accepted the command from its client.
    pub root_sender: Option<NodeID>,
    /// The node whose provider ran the operation.
    pub served_by: NodeID,
    pub outcome: Outcome,
}

/// A relayed command, waiting in a node's inbox.
struct Envelope {
    from: NodeID,
    buf: Vec<u8>,
    reply: oneshot::Sender<Result<Reply, DispatchError>>,
}

/// Our end of a neighbour relation: where to drop commands for that node.
#[derive(Clone)]
struct PeerLink {
    id: NodeID,
    name: String,
    inbox: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct PeerState {
    neighbours: HashMap<NodeID, PeerLink>,
    local_users: HashMap<NodeID, UserNode>,
    seen: HashSet<CommandID>,
    /// `seen` in arrival order, oldest first.
    seen_order: VecDeque<CommandID>,
}

impl PeerState {
    /// Records a command passing through. Returns false if it was already
    /// here.
    fn remember(&mut self, id: CommandID, capacity: usize) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        while self.seen_order.len() > capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// A peer of the service mesh.
///
/// A service node hosts local users and an operations provider, keeps links
/// to its neighbours and relays commands addressed to other nodes. Topology
/// changes are serialized by a per-node lock; neighbour relations are
/// symmetric.
///
/// Nodes hold each other through inbox channels, never through `Arc`s, so a
/// dropped node goes away even while its neighbours still know it.
pub struct ServiceNode {
    info: NodeInfo,
    id: NodeID,
    config: NodeConfig,
    provider: Arc<dyn Operations>,
    state: RwLock<PeerState>,
    inbox: mpsc::UnboundedSender<Envelope>,
}

impl ServiceNode {
    /// Creates the node and starts serving its inbox. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        info: NodeInfo,
        provider: Arc<dyn Operations>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            id: node_id(&info.name),
            info,
            config,
            provider,
            state: RwLock::new(PeerState::default()),
            inbox,
        });
        let span = debug_span!("service_node", node = %node.id.hex().short(4));
        tokio::spawn(Self::serve(Arc::downgrade(&node), inbox_rx).instrument(span));
        debug!("{} is up as {}", node.info, node.id.hex());
        node
    }

    pub fn id(&self) -> NodeID {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn Operations> {
        self.provider.clone()
    }

    fn link(&self) -> PeerLink {
        PeerLink {
            id: self.id,
            name: self.info.name.clone(),
            inbox: self.inbox.clone(),
        }
    }

    /// Write-locks this node and `other`, always in id order, and returns
    /// the guards as (ours, theirs).
    async fn lock_pair<'a>(
        &'a self,
        other: &'a ServiceNode,
    ) -> (RwLockWriteGuard<'a, PeerState>, RwLockWriteGuard<'a, PeerState>) {
        if self.id < other.id {
            let ours = self.state.write().await;
            let theirs = other.state.write().await;
            (ours, theirs)
        } else {
            let theirs = other.state.write().await;
            let ours = self.state.write().await;
            (ours, theirs)
        }
    }

    /// Connects the two nodes both ways. Returns false if they already were
    /// neighbours or `other` is this node.
    pub async fn add_neighbour(&self, other: &ServiceNode) -> bool {
        if other.id == self.id {
            warn!("{} refused to become its own neighbour", self.info.name);
            return false;
        }

        let (mut ours, mut theirs) = self.lock_pair(other).await;
        let added = !ours.neighbours.contains_key(&other.id);
        ours.neighbours.entry(other.id).or_insert_with(|| other.link());
        theirs.neighbours.entry(self.id).or_insert_with(|| self.link());

        if added {
            debug!("{} <-> {} are now neighbours", self.info.name, other.info.name);
        }
        added
    }

    /// Disconnects the two nodes both ways. Returns false if they weren't
    /// neighbours.
    pub async fn remove_neighbour(&self, other: &ServiceNode) -> bool {
        if other.id == self.id {
            return false;
        }

        let (mut ours, mut theirs) = self.lock_pair(other).await;
        let removed = ours.neighbours.remove(&other.id).is_some();
        let reverse = theirs.neighbours.remove(&self.id).is_some();
        if removed || reverse {
            debug!("{} <-> {} are no longer neighbours", self.info.name, other.info.name);
        }
        removed || reverse
    }

    pub async fn has_neighbour(&self, id: &NodeID) -> bool {
        self.state.read().await.neighbours.contains_key(id)
    }

    pub async fn num_neighbours(&self) -> usize {
        self.state.read().await.neighbours.len()
    }

    /// Neighbour ids with their names.
    pub async fn neighbours(&self) -> Vec<(NodeID, String)> {
        self.state
            .read()
            .await
            .neighbours
            .values()
            .map(|link| (link.id, link.name.clone()))
            .collect()
    }

    /// Attaches a user to this node. Returns false if it was already here.
    pub async fn add_user(&self, user: UserNode) -> bool {
        let id = user.id();
        let mut state = self.state.write().await;
        if state.local_users.contains_key(&id) {
            return false;
        }
        debug!("{} attached to {}", user.name(), self.info.name);
        state.local_users.insert(id, user);
        true
    }

    pub async fn remove_user(&self, id: &NodeID) -> Option<UserNode> {
        self.state.write().await.local_users.remove(id)
    }

    pub async fn has_user(&self, id: &NodeID) -> bool {
        self.state.read().await.local_users.contains_key(id)
    }

    pub async fn num_users(&self) -> usize {
        self.state.read().await.local_users.len()
    }

    pub async fn local_users(&self) -> Vec<UserNode> {
        self.state.read().await.local_users.values().cloned().collect()
    }

    /// Accepts a command from one of this node's users and carries it to the
    /// node it is addressed to, which may be this one. This node becomes the
    /// command's root sender.
    pub async fn submit(
        &self,
        sender: &NodeID,
        mut command: Command,
    ) -> Result<Reply, DispatchError> {
        if !self.has_user(sender).await {
            Err(DispatchError::NotLocalUser)?
        }
        if command.target().is_none() {
            Err(DispatchError::NoReceiver)?
        }
        match command.state() {
            CommandState::Created => {}
            CommandState::Submitted => Err(DispatchError::AlreadySubmitted)?,
            CommandState::Completed => Err(DispatchError::AlreadyCompleted)?,
        }
        if !command.stamp_root_sender(self.id) {
            debug!("command {} already carries a root sender", command.id());
        }

        let span = debug_span!("submit", command = command.id(), op = command.kind().name());
        self.route(command.into_frame()).instrument(span).await
    }

    async fn route(&self, mut frame: CommandFrame) -> Result<Reply, DispatchError> {
        let target = frame.target.ok_or(DispatchError::NoReceiver)?;
        let first_visit = self
            .state
            .write()
            .await
            .remember(frame.id, self.config.seen_commands);
        if !first_visit {
            trace!("command {} already came through here", frame.id);
            Err(DispatchError::NoRoute(target))?
        }
        if target == self.id {
            return self.serve_locally(frame).await;
        }
        if frame.hops.len() >= self.config.max_hops {
            warn!("command {} ran out of hops on its way to {}", frame.id, target.hex());
            Err(DispatchError::NoRoute(target))?
        }
        frame.hops.push(self.id);

        // the target itself first, then everyone the command hasn't met yet
        let candidates: Vec<PeerLink> = {
            let state = self.state.read().await;
            state
                .neighbours
                .get(&target)
                .into_iter()
                .chain(state.neighbours.values().filter(|link| {
                    link.id != target && !frame.hops.contains(&link.id)
                }))
                .cloned()
                .collect()
        };

        let mut last_error = None;
        for link in candidates {
            match self.forward(&link, &frame).await {
                Err(e) if e.is_unreachable() => {
                    trace!("{} could not take command {}: {}", link.name, frame.id, e);
                    // a dead end says less than a link that failed
                    if last_error.is_none() || !matches!(e, DispatchError::NoRoute(_)) {
                        last_error = Some(e);
                    }
                }
                result => return result,
            }
        }
        Err(last_error.unwrap_or(DispatchError::NoRoute(target)))
    }

    async fn forward(
        &self,
        link: &PeerLink,
        frame: &CommandFrame,
    ) -> Result<Reply, DispatchError> {
        let buf = wire::encode(frame, frame.hops.len() > 1)?;
        trace!("relaying command {} to {} ({} bytes)", frame.id, link.name, buf.len());

        let (reply_tx, reply_rx) = oneshot::channel();
        link.inbox
            .send(Envelope {
                from: self.id,
                buf,
                reply: reply_tx,
            })
            .map_err(|_| DispatchError::NodeGone)?;

        match timeout(self.config.forward_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::NodeGone),
            Err(_) => {
                warn!("{} did not answer command {} in time", link.name, frame.id);
                Err(DispatchError::Timeout)
            }
        }
    }

    async fn serve_locally(&self, frame: CommandFrame) -> Result<Reply, DispatchError> {
        let root_sender = frame.root_sender;
        let mut command = Command::from_frame(frame).with_receiver(self.provider.clone());
        let handle = command.execute()?;
        let outcome = command.end_execute(&handle).await?;
        debug!(
            "served {} command {} for {}",
            command.kind().name(),
            command.id(),
            root_sender
                .map(|id| id.hex().short(4).to_string())
                .unwrap_or_else(|| "?".into()),
        );
        Ok(Reply {
            command_id: command.id(),
            root_sender,
            served_by: self.id,
            outcome,
        })
    }

    async fn accept_forwarded(&self, from: NodeID, buf: &[u8]) -> Result<Reply, DispatchError> {
        if !self.has_neighbour(&from).await {
            warn!("dropping a command relayed by non-neighbour {}", from.hex());
            Err(DispatchError::NotNeighbour)?
        }
        let received = wire::decode(buf)?;
        trace!(
            "command {} from {} ({}forwarded) sent at {}",
            received.frame.id,
            from.hex().short(4),
            if received.prefix.forwarded() { "" } else { "not " },
            received.sent_at,
        );
        self.route(received.frame).await
    }

    /// Serves relayed commands until the node is dropped. Each command gets
    /// its own task.
    async fn serve(node: Weak<ServiceNode>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { from, buf, reply }) = inbox.recv().await {
            let Some(node) = node.upgrade() else {
                let _ = reply.send(Err(DispatchError::NodeGone));
                break;
            };
            tokio::spawn(
                async move {
                    let result = node.accept_forwarded(from, &buf).await;
                    // the relaying node may have given up already
                    let _ = reply.send(result);
                }
                .in_current_span(),
            );
        }
        debug!("inbox closed");
    }
}

impl Node for ServiceNode {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn id(&self) -> NodeID {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;

    use super::*;
    use crate::dispatch::{Failure, MemoryOperations, Payload};
    use crate::geo::{Direction, Distance, Location};
    use crate::model::{Blake3Hasher, PasswordHasher, QueryBuilder, Trip, User};

    fn node(name: &str) -> Arc<ServiceNode> {
        node_with(name, Arc::new(MemoryOperations::new()))
    }

    fn node_with(name: &str, provider: Arc<dyn Operations>) -> Arc<ServiceNode> {
        ServiceNode::spawn(NodeInfo::new(name), provider, NodeConfig::default())
    }

    fn milan() -> Location {
        Location::with_coordinates("Milano", 45.4642, 9.19)
    }

    fn registered(username: &str, password: &str) -> User {
        let mut user = User::with_username(username, username);
        user.set_password(&Blake3Hasher::new(), password);
        user
    }

    async fn attach(node: &ServiceNode, username: &str) -> NodeID {
        let user = UserNode::new(username);
        let id = user.id();
        node.add_user(user).await;
        id
    }

    #[tokio::test]
    async fn neighbours_are_symmetric_and_idempotent() {
        let (a, b) = (node("a"), node("b"));

        assert!(a.add_neighbour(&b).await);
        assert!(a.has_neighbour(&b.id()).await);
        assert!(b.has_neighbour(&a.id()).await);

        assert!(!a.add_neighbour(&b).await);
        assert!(!b.add_neighbour(&a).await);
        assert_eq!(a.num_neighbours().await, 1);
        assert_eq!(b.num_neighbours().await, 1);
        assert_eq!(a.neighbours().await, vec![(b.id(), "b".to_string())]);
    }

    #[tokio::test]
    async fn no_self_loops() {
        let a = node("a");

        assert!(!a.add_neighbour(&a).await);
        assert_eq!(a.num_neighbours().await, 0);
    }

    #[tokio::test]
    async fn removal_is_symmetric() {
        let (a, b, c) = (node("a"), node("b"), node("c"));
        a.add_neighbour(&b).await;
        a.add_neighbour(&c).await;

        assert!(b.remove_neighbour(&a).await);
        assert!(!a.has_neighbour(&b.id()).await);
        assert!(!b.has_neighbour(&a.id()).await);
        assert!(a.has_neighbour(&c.id()).await);
        assert!(!b.remove_neighbour(&a).await);
    }

    #[tokio::test]
    async fn concurrent_topology_changes_stay_consistent() {
        let hub = node("hub");
        let spokes: Vec<_> = (0..20).map(|i| node(&format!("spoke-{i}"))).collect();

        join_all(spokes.iter().enumerate().map(|(i, spoke)| {
            let hub = hub.clone();
            async move {
                // half connect from each side, at the same time
                if i % 2 == 0 {
                    hub.add_neighbour(spoke).await
                } else {
                    spoke.add_neighbour(&hub).await
                }
            }
        }))
        .await;
        join_all((0..50).map(|i| hub.add_user(UserNode::new(format!("user-{}", i % 25))))).await;

        assert_eq!(hub.num_neighbours().await, 20);
        for spoke in &spokes {
            assert!(spoke.has_neighbour(&hub.id()).await);
        }
        assert_eq!(hub.num_users().await, 25);
    }

    #[tokio::test]
    async fn local_users() {
        let a = node("a");
        let mario = UserNode::new("mario");

        assert!(a.add_user(mario.clone()).await);
        assert!(!a.add_user(mario.clone()).await);
        assert!(a.has_user(&mario.id()).await);
        assert_eq!(a.local_users().await, vec![mario.clone()]);

        assert_eq!(a.remove_user(&mario.id()).await, Some(mario.clone()));
        assert!(!a.has_user(&mario.id()).await);
        assert_eq!(a.remove_user(&mario.id()).await, None);
    }

    #[tokio::test]
    async fn join_through_hosting_node() {
        let ops = Arc::new(MemoryOperations::new());
        ops.register_user(registered("mario", "pw")).await;
        let a = node_with("a", ops.clone());
        let b = node("b");
        a.add_neighbour(&b).await;
        let mario = attach(&a, "mario").await;
        let hasher = Blake3Hasher::new();

        let reply = a
            .submit(&mario, Command::join("mario", hasher.hash("pw")).to(a.id()))
            .await
            .unwrap();
        assert_eq!(
            reply.outcome,
            Outcome::Success(Payload::LoginOk { username: "mario".into() })
        );
        assert_eq!(reply.served_by, a.id());
        assert_eq!(reply.root_sender, Some(a.id()));
        assert!(ops.is_online("mario").await);

        let reply = a
            .submit(&mario, Command::join("mario", hasher.hash("guess")).to(a.id()))
            .await
            .unwrap();
        assert!(matches!(
            reply.outcome,
            Outcome::Failure(Failure::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn search_through_node_respects_range() {
        let a = node("a");
        let mario = attach(&a, "mario").await;
        let submit = |command: Command| a.submit(&mario, command.to(a.id()));
        let trip = |km: f64| {
            Trip::builder()
                .owner("mario")
                .departure(milan().offset(&Distance::from_kilometers(km), Direction::East))
                .arrival(Location::with_coordinates("Bergamo", 45.6983, 9.6773))
                .build()
        };

        submit(Command::register_user(registered("mario", "pw"))).await.unwrap();
        submit(Command::insert_trip(trip(5.))).await.unwrap();
        submit(Command::insert_trip(trip(15.))).await.unwrap();
        let query = QueryBuilder::builder()
            .range_km(10.)
            .departure(milan())
            .build();
        let query_id = query.id();

        let reply = submit(Command::search_trip(query)).await.unwrap();
        match reply.outcome {
            Outcome::Success(Payload::TripsFound { query_id: id, trips }) => {
                assert_eq!(id, query_id);
                assert_eq!(trips.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn command_is_relayed_to_the_receiver() {
        let ops = Arc::new(MemoryOperations::new());
        ops.register_user(registered("mario", "pw")).await;
        let a = node("a");
        let b = node_with("b", ops.clone());
        a.add_neighbour(&b).await;
        let mario = attach(&a, "mario").await;

        let command = Command::join("mario", Blake3Hasher::new().hash("pw")).to(b.id());
        let command_id = command.id();
        let reply = a.submit(&mario, command).await.unwrap();

        assert_eq!(reply.command_id, command_id);
        assert_eq!(reply.served_by, b.id());
        assert_eq!(reply.root_sender, Some(a.id()));
        assert!(reply.outcome.is_success());
        assert!(ops.is_online("mario").await);
    }

    #[tokio::test]
    async fn relay_crosses_several_hops() {
        let ops = Arc::new(MemoryOperations::new());
        let (a, b, c, d) = (node("a"), node("b"), node("c"), node_with("d", ops.clone()));
        // a - b - c - d, plus a dead end a - x
        let x = node("x");
        a.add_neighbour(&x).await;
        a.add_neighbour(&b).await;
        b.add_neighbour(&c).await;
        c.add_neighbour(&d).await;
        let mario = attach(&a, "mario").await;

        let reply = a
            .submit(&mario, Command::register_user(registered("mario", "pw")).to(d.id()))
            .await
            .unwrap();

        assert_eq!(reply.served_by, d.id());
        assert_eq!(reply.root_sender, Some(a.id()));
        assert_eq!(reply.outcome, Outcome::Success(Payload::UserRegistered { user_id: 1 }));
    }

    #[tokio::test]
    async fn hop_limit_stops_relaying() {
        let provider: Arc<dyn Operations> = Arc::new(MemoryOperations::new());
        let config = NodeConfig::builder().max_hops(1).build();
        let spawn = |name: &str| {
            ServiceNode::spawn(NodeInfo::new(name), provider.clone(), config.clone())
        };
        let (a, b, c) = (spawn("a"), spawn("b"), spawn("c"));
        a.add_neighbour(&b).await;
        b.add_neighbour(&c).await;
        let mario = attach(&a, "mario").await;

        let result = a.submit(&mario, Command::unjoin("mario").to(c.id())).await;
        assert_eq!(result.unwrap_err(), DispatchError::NoRoute(c.id()));

        let result = a.submit(&mario, Command::unjoin("mario").to(b.id())).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn submit_checks() {
        let (a, b) = (node("a"), node("b"));
        a.add_neighbour(&b).await;
        let mario = attach(&a, "mario").await;

        assert_eq!(
            a.submit(&UserNode::new("luca").id(), Command::unjoin("luca").to(a.id()))
                .await
                .unwrap_err(),
            DispatchError::NotLocalUser
        );
        assert_eq!(
            a.submit(&mario, Command::unjoin("mario")).await.unwrap_err(),
            DispatchError::NoReceiver
        );
        let nowhere = node_id("nowhere");
        assert_eq!(
            a.submit(&mario, Command::unjoin("mario").to(nowhere))
                .await
                .unwrap_err(),
            DispatchError::NoRoute(nowhere)
        );
    }

    #[tokio::test]
    async fn dropped_neighbour_is_unreachable() {
        let (a, b) = (node("a"), node("b"));
        a.add_neighbour(&b).await;
        let mario = attach(&a, "mario").await;
        let target = b.id();
        drop(b);

        let result = a.submit(&mario, Command::unjoin("mario").to(target)).await;
        assert_eq!(result.unwrap_err(), DispatchError::NodeGone);
    }

    struct Stalled;

    #[async_trait]
    impl Operations for Stalled {
        async fn join(&self, _username: &str, _password_hash: &str) -> Outcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Outcome::failed("too late")
        }
    }

    #[tokio::test]
    async fn slow_neighbour_times_out() {
        let config = NodeConfig::builder()
            .forward_timeout(Duration::from_millis(50))
            .build();
        let a = ServiceNode::spawn(
            NodeInfo::new("a"),
            Arc::new(MemoryOperations::new()),
            config,
        );
        let b = node_with("b", Arc::new(Stalled));
        a.add_neighbour(&b).await;
        let mario = attach(&a, "mario").await;

        let result = a.submit(&mario, Command::join("mario", "x").to(b.id())).await;
        assert_eq!(result.unwrap_err(), DispatchError::Timeout);
    }

    #[tokio::test]
    async fn relays_only_from_neighbours() {
        let (a, b) = (node("a"), node("b"));
        let frame = Command::unjoin("mario").to(b.id()).into_frame();
        let buf = wire::encode(&frame, false).unwrap();

        assert_eq!(
            b.accept_forwarded(a.id(), &buf).await.unwrap_err(),
            DispatchError::NotNeighbour
        );
    }

    #[tokio::test]
    async fn interleaved_add_and_remove_stay_symmetric() {
        let (a, b) = (node("a"), node("b"));
        a.add_neighbour(&b).await;

        // queue a removal and then an add behind b's lock
        let held = b.state.write().await;
        let remove = tokio::spawn({
            let (a, b) = (a.clone(), b.clone());
            async move { b.remove_neighbour(&a).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let add = tokio::spawn({
            let (a, b) = (a.clone(), b.clone());
            async move { a.add_neighbour(&b).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(remove.await.unwrap());
        assert!(add.await.unwrap());
        assert!(a.has_neighbour(&b.id()).await);
        assert!(b.has_neighbour(&a.id()).await);
    }

    #[tokio::test]
    async fn churn_on_one_pair_stays_symmetric() {
        let (a, b) = (node("a"), node("b"));

        join_all((0..64).map(|i| {
            let (a, b) = (a.clone(), b.clone());
            async move {
                match i % 4 {
                    0 => a.add_neighbour(&b).await,
                    1 => b.remove_neighbour(&a).await,
                    2 => b.add_neighbour(&a).await,
                    _ => a.remove_neighbour(&b).await,
                }
            }
        }))
        .await;

        assert_eq!(a.has_neighbour(&b.id()).await, b.has_neighbour(&a.id()).await);
        assert_eq!(a.num_neighbours().await, b.num_neighbours().await);
    }

    #[tokio::test]
    async fn unreachable_target_in_a_dense_mesh() {
        let config = NodeConfig::builder()
            .forward_timeout(Duration::from_millis(500))
            .build();
        let mesh: Vec<_> = (0..6)
            .map(|i| {
                ServiceNode::spawn(
                    NodeInfo::new(format!("n{i}")),
                    Arc::new(MemoryOperations::new()),
                    config.clone(),
                )
            })
            .collect();
        for (i, a) in mesh.iter().enumerate() {
            for b in &mesh[i + 1..] {
                a.add_neighbour(b).await;
            }
        }
        let mario = attach(&mesh[0], "mario").await;
        let nowhere = node_id("nowhere");

        let started = tokio::time::Instant::now();
        let result = mesh[0]
            .submit(&mario, Command::unjoin("mario").to(nowhere))
            .await;

        assert_eq!(result.unwrap_err(), DispatchError::NoRoute(nowhere));
        assert!(started.elapsed() < config.forward_timeout);
    }

    #[tokio::test]
    async fn repeated_command_is_turned_away() {
        let (a, b) = (node("a"), node("b"));
        a.add_neighbour(&b).await;
        let frame = Command::unjoin("mario").to(b.id()).into_frame();
        let buf = wire::encode(&frame, false).unwrap();

        assert!(b.accept_forwarded(a.id(), &buf).await.is_ok());
        assert_eq!(
            b.accept_forwarded(a.id(), &buf).await.unwrap_err(),
            DispatchError::NoRoute(b.id())
        );
    }

    #[test]
    fn seen_commands_are_bounded() {
        let mut state = PeerState::default();

        assert!(state.remember(1, 2));
        assert!(!state.remember(1, 2));
        assert!(state.remember(2, 2));
        assert!(state.remember(3, 2));
        // 1 fell out of the window
        assert!(state.remember(1, 2));
        assert_eq!(state.seen.len(), 2);
    }

    #[tokio::test]
    async fn broken_direct_link_falls_back_to_other_paths() {
        let ops = Arc::new(MemoryOperations::new());
        let (a, b, c) = (node("a"), node_with("b", ops.clone()), node("c"));
        a.add_neighbour(&c).await;
        c.add_neighbour(&b).await;
        // a believes it still has a direct link to b, but that inbox is gone
        let (dead, _) = mpsc::unbounded_channel();
        a.state.write().await.neighbours.insert(
            b.id(),
            PeerLink {
                id: b.id(),
                name: "b".into(),
                inbox: dead,
            },
        );
        let mario = attach(&a, "mario").await;

        let reply = a
            .submit(&mario, Command::register_user(registered("mario", "pw")).to(b.id()))
            .await
            .unwrap();

        assert_eq!(reply.served_by, b.id());
        assert!(reply.outcome.is_success());
    }
}
