use super::log::{Entry, Index, Log};
use super::message::{Envelope, Message, Request, RequestID, Response, Status};
use super::state::State;
use super::timer::{Scheduler, Timer, TimerFire};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A node ID. An opaque, stable string identifying a cluster member.
pub type NodeID = String;

/// A leader term. Monotonically non-decreasing; terms define logical epochs
/// of leadership.
pub type Term = u64;

/// Raft node options. Durations are in milliseconds.
pub struct Options {
    /// The randomized leader timeout range for followers. A new duration is
    /// drawn uniformly on every arm.
    pub leader_timeout: std::ops::Range<u64>,
    /// The randomized election timeout range for candidates.
    pub election_timeout: std::ops::Range<u64>,
    /// The per-peer heartbeat interval. Must be below the leader timeout, or
    /// followers will keep starting elections against a live leader.
    pub heartbeat_interval: u64,
    /// The minimum delay between elections started by this node. Timeouts
    /// firing inside the delay are ignored and re-armed.
    pub min_election_delay: u64,
    /// Maximum number of entries in a single AppendEntries message.
    pub max_append_entries: usize,
    /// Seed for the election randomness. Defaults to entropy; fixed in tests
    /// for reproducibility.
    pub seed: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            leader_timeout: super::LEADER_TIMEOUT_RANGE,
            election_timeout: super::ELECTION_TIMEOUT_RANGE,
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            min_election_delay: super::MIN_ELECTION_DELAY,
            max_append_entries: super::MAX_APPEND_ENTRIES,
            seed: None,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or timer expiries via on_timer().
/// These methods consume the current node and return a new one with a
/// possibly different role. Outbound messages are sent via the given node_tx
/// channel; timers are armed on the given scheduler and fire back into the
/// caller's event loop.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step(msg)?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node as a leaderless follower with its leader
    /// timeout armed. A single-node cluster still waits for the first leader
    /// timeout before assuming leadership.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        scheduler: Scheduler,
        opts: Options,
    ) -> Result<Self> {
        assert!(!peers.contains(&id), "node can't be its own peer");
        let node = RawNode::new(id, peers, log, state, node_tx, scheduler, opts)?;
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Processes a timer expiry.
    pub fn on_timer(self, fire: TimerFire) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.on_timer(fire),
            Node::Follower(n) => n.on_timer(fire),
            Node::Leader(n) => n.on_timer(fire),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    scheduler: Scheduler,
    /// The generation of each armed timer. Fires with a stale generation
    /// raced with a cancel or reset and are discarded.
    armed: HashMap<Timer, u64>,
    /// When this node last started an election, to enforce the election
    /// delay floor.
    last_campaign: Option<Instant>,
    rng: StdRng,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            scheduler: self.scheduler,
            armed: self.armed,
            last_campaign: self.last_campaign,
            rng: self.rng,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.get_term_vote().0
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, i.e. the
    /// largest value that a majority of the cluster is at or above. The
    /// vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to the given recipient.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id.clone(), to, term: self.term(), message };
        Self::send_with(&self.node_tx, msg)
    }

    /// Sends a message without borrowing self, to allow partial borrows.
    fn send_with(tx: &crossbeam::channel::Sender<Envelope>, msg: Envelope) -> Result<()> {
        debug!("Sending {msg:?}");
        Ok(tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().cloned().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Arms a timer, recording its generation. Also used to reset a timer,
    /// since arming replaces any previous arm.
    fn arm_timer(&mut self, timer: Timer, duration: Duration) {
        let generation = self.scheduler.arm(timer.clone(), duration);
        self.armed.insert(timer, generation);
    }

    /// Cancels a timer, if armed.
    fn cancel_timer(&mut self, timer: &Timer) {
        self.scheduler.cancel(timer);
        self.armed.remove(timer);
    }

    /// Arms (or resets) the leader timeout with a fresh random duration.
    fn arm_leader_timeout(&mut self) {
        let duration = Duration::from_millis(self.rng.gen_range(self.opts.leader_timeout.clone()));
        self.arm_timer(Timer::Leader, duration);
    }

    /// Arms (or resets) the election timeout with a fresh random duration.
    fn arm_election_timeout(&mut self) {
        let duration =
            Duration::from_millis(self.rng.gen_range(self.opts.election_timeout.clone()));
        self.arm_timer(Timer::Election, duration);
    }

    /// Arms (or resets) a peer's heartbeat timeout.
    fn arm_heartbeat(&mut self, peer: NodeID) {
        let duration = Duration::from_millis(self.opts.heartbeat_interval);
        self.arm_timer(Timer::Heartbeat(peer), duration);
    }

    /// Cancels the election timeout and all per-peer heartbeat timeouts, e.g.
    /// when stepping down to follower.
    fn cancel_campaign_timers(&mut self) {
        self.cancel_timer(&Timer::Election);
        for peer in self.peers.clone() {
            self.cancel_timer(&Timer::Heartbeat(peer));
        }
    }

    /// Returns true if the fire matches the currently armed generation of its
    /// timer. Stale fires raced with a cancel or reset and must be ignored.
    fn timer_is_current(&self, fire: &TimerFire) -> bool {
        self.armed.get(&fire.timer) == Some(&fire.generation)
    }

    /// Returns true if enough time has passed since the last election start
    /// to begin another one (the election frequency floor).
    fn may_campaign(&self) -> bool {
        let delay = Duration::from_millis(self.opts.min_election_delay);
        self.last_campaign.map_or(true, |at| at.elapsed() >= delay)
    }

    /// Applies any pending committed log entries, discarding the results.
    /// Used by followers and candidates, where no client is waiting.
    fn maybe_apply(&mut self) -> Result<()> {
        let applied_index = self.state.get_applied_index();
        let mut scan = self.log.scan_apply(applied_index);
        while let Some(entry) = scan.next().transpose()? {
            debug!("Applying {entry:?}");
            // Deterministic errors are identical on all replicas and can be
            // ignored. Non-deterministic errors would diverge the replicas,
            // so the node must halt.
            if let Err(error) = self.state.apply(entry) {
                if !error.is_deterministic() {
                    panic!("non-deterministic apply failure: {error}");
                }
            }
        }
        Ok(())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(msg.from == self.id || self.peers.contains(&msg.from), "unknown sender");
    }

    /// Replies to a stale-term request with a negative response carrying our
    /// current term, so the sender discovers the term and steps down. Stale
    /// responses are simply dropped.
    fn reject_stale(&self, msg: Envelope) -> Result<()> {
        debug!("Dropping message from stale term {}: {:?}", msg.term, msg.message);
        match msg.message {
            Message::AppendEntries { .. } => {
                self.send(msg.from, Message::AppendEntriesResponse { success: false, match_index: 0 })
            }
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })
            }
            _ => Ok(()),
        }
    }

    /// Builds the common part of a status report.
    fn status(&self, leader: Option<NodeID>) -> Status {
        Status {
            server: self.id.clone(),
            leader,
            term: self.term(),
            last_index: self.log.get_last_index().0,
            commit_index: self.log.get_commit_index().0,
            applied_index: self.state.get_applied_index(),
            match_index: HashMap::new(),
            storage: self.log.store_name(),
        }
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including ourself.
    votes: HashSet<NodeID>,
}

impl Candidate {
    fn new() -> Self {
        Self { votes: HashSet::new() }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&self) {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(
            self.log.get_term_vote().1.as_ref(),
            Some(&self.id),
            "log vote does not match self"
        );
    }

    /// Transitions the candidate to a follower. Either we lost the election
    /// to a leader in this term, or we discovered a new term and don't know
    /// the leader yet.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        self.cancel_campaign_timers();
        if let Some(leader) = &leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
        } else {
            // We found a new term, but don't know the leader yet. We'll find
            // out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
        }
        self.arm_leader_timeout();
        Ok(self.into_role(Follower::new(leader)))
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(mut self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        self.cancel_campaign_timers();
        let (last_index, _) = self.log.get_last_index();
        let peers = self.peers.clone();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Broadcast an empty AppendEntries immediately, to assert leadership
        // and suppress elections. This also arms the heartbeat timeouts.
        for peer in node.peers.iter().cloned().sorted().collect_vec() {
            node.send_append(&peer)?;
        }
        Ok(node)
    }

    /// Becomes leader if we have quorum. Trivially true in a single-node
    /// cluster, where campaigning wins the election outright.
    fn maybe_become_leader(self) -> Result<Node> {
        if self.role.votes.len() >= self.quorum_size() {
            return Ok(self.into_leader()?.into());
        }
        Ok(self.into())
    }

    /// Campaigns for leadership in a new term: increment the term, vote for
    /// ourself, solicit votes from all peers, and arm the election and
    /// per-peer heartbeat timeouts (the latter re-solicit unresponsive
    /// voters).
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting election for term {term}");
        self.last_campaign = Some(Instant::now());
        self.role = Candidate::new();
        self.role.votes.insert(self.id.clone()); // vote for ourself
        self.log.set_term(term, Some(self.id.clone()))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::RequestVote { last_index, last_term })?;
        self.arm_election_timeout();
        for peer in self.peers.clone() {
            self.arm_heartbeat(peer);
        }
        Ok(())
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Reject or drop messages from stale terms.
        if msg.term < self.term() {
            self.reject_stale(msg)?;
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is an append
        // from the new leader, stepping it will follow the leader.
        if msg.term > self.term() {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Another candidate campaigns in this term. We voted for ourself,
            // so deny the vote.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
            }

            // A voter granted us their vote. Record it, and assume leadership
            // if it gives us quorum.
            Message::RequestVoteResponse { granted: true } => {
                self.role.votes.insert(msg.from);
                return self.maybe_become_leader();
            }

            // We didn't get this vote, nothing to do.
            Message::RequestVoteResponse { granted: false } => {}

            // A concurrent candidate won the election in this term. Follow it
            // and step the append.
            Message::AppendEntries { .. } => {
                return self.into_follower(msg.term, Some(msg.from.clone()))?.step(msg);
            }

            // Reject client commands while campaigning; there is no leader to
            // hint at.
            Message::ClientRequest { id, request: Request::Execute(_) } => {
                let response = Err(Error::NotLeader { leader: None });
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // Serve status locally.
            Message::ClientRequest { id, request: Request::Status } => {
                let response = Ok(Response::Status(self.status(None)));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // Snapshot transfer is not implemented.
            Message::InstallSnapshot { .. } | Message::InstallSnapshotResponse { .. } => {
                warn!("Snapshot RPCs are not implemented, dropping {:?}", msg.message);
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::AppendEntriesResponse { .. } | Message::ClientResponse { .. } => {
                panic!("unexpected message {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a timer expiry.
    fn on_timer(mut self, fire: TimerFire) -> Result<Node> {
        self.assert();
        if !self.timer_is_current(&fire) {
            debug!("Ignoring stale timer fire {fire:?}");
            return Ok(self.into());
        }
        self.armed.remove(&fire.timer);

        match fire.timer {
            // The election timed out without a winner (e.g. a split vote).
            // Start a new election in a higher term, unless we're inside the
            // election delay floor.
            Timer::Election => {
                if !self.may_campaign() {
                    debug!("Ignoring election timeout inside election delay");
                    self.arm_election_timeout();
                    return Ok(self.into());
                }
                self.campaign()?;
                self.maybe_become_leader()
            }

            // Re-solicit a vote from a peer that hasn't responded.
            Timer::Heartbeat(peer) => {
                if !self.role.votes.contains(&peer) {
                    let (last_index, last_term) = self.log.get_last_index();
                    self.send(peer.clone(), Message::RequestVote { last_index, last_term })?;
                    self.arm_heartbeat(peer);
                }
                Ok(self.into())
            }

            // A stale fire from our follower days; the role no longer
            // matches.
            Timer::Leader => {
                debug!("Ignoring leader timeout as candidate");
                Ok(self.into())
            }
        }
    }
}

// A follower replicates state from a leader.
pub struct Follower {
    /// The leader, or None if just initialized or in a fresh term.
    leader: Option<NodeID>,
}

impl Follower {
    fn new(leader: Option<NodeID>) -> Self {
        Self { leader }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower with the leader timeout
    /// armed.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        scheduler: Scheduler,
        opts: Options,
    ) -> Result<Self> {
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut node = Self {
            id,
            peers,
            log,
            state,
            node_tx,
            scheduler,
            armed: HashMap::new(),
            last_campaign: None,
            rng,
            opts,
            role: Follower::new(None),
        };
        // Catch up on any committed entries persisted before a restart.
        node.maybe_apply()?;
        node.arm_leader_timeout();
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&self) {
        if let Some(leader) = &self.role.leader {
            assert_ne!(leader, &self.id, "can't follow self");
            assert!(self.peers.contains(leader), "leader not in peers");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        }
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(mut self) -> Result<Node> {
        // Apply any pending entries, so we're caught up if we win.
        self.maybe_apply()?;
        self.cancel_timer(&Timer::Leader);
        let mut node = self.into_role(Candidate::new());
        node.campaign()?;
        // A single-node cluster wins immediately.
        node.maybe_become_leader()
    }

    /// Transitions the follower into a follower, either following a leader
    /// discovered in the current term or stepping into a new term without
    /// one.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader));
        } else {
            // We found a new term, but don't know the leader yet.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None);
        }
        self.arm_leader_timeout();
        Ok(self)
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Reject or drop messages from stale terms.
        if msg.term < self.term() {
            self.reject_stale(msg)?;
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is an append
        // from the new leader, stepping it will follow the leader.
        if msg.term > self.term() {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        match msg.message {
            // The leader replicates entries, or asserts leadership with an
            // empty append (a heartbeat).
            Message::AppendEntries { prev_index, prev_term, entries, commit_index } => {
                if let Some(first) = entries.first() {
                    assert_eq!(first.index, prev_index + 1, "base index mismatch");
                }

                // Make sure the append comes from our leader, adopting it if
                // we don't have one in this term yet.
                match &self.role.leader {
                    Some(leader) => assert_eq!(&msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from.clone()), msg.term)?,
                }
                // The leader is alive, so hold off on elections.
                self.arm_leader_timeout();

                // If the base entry isn't in our log, reject the append. The
                // commit index tells the leader where our log is known to
                // match, so it can back off directly to it.
                if prev_index > 0 && !self.log.has(prev_index, prev_term)? {
                    debug!("Rejecting append at base {prev_index}@{prev_term}");
                    let (commit_index, _) = self.log.get_commit_index();
                    let response =
                        Message::AppendEntriesResponse { success: false, match_index: commit_index };
                    self.send(msg.from, response)?;
                    return Ok(self.into());
                }

                // Append the entries, ignoring duplicates and truncating any
                // conflicting tail, then advance our commit index to the
                // leader's (but not past the entries we just matched) and
                // apply the newly committed entries.
                let match_index = prev_index + entries.len() as Index;
                self.log.splice(entries)?;
                let commit_index = std::cmp::min(commit_index, match_index);
                if commit_index > self.log.get_commit_index().0 {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                }
                self.send(msg.from, Message::AppendEntriesResponse { success: true, match_index })?;
            }

            // A candidate solicits our vote. Grant it if we haven't voted for
            // someone else in this term and the candidate's log is at least
            // as up-to-date as ours; Raft is unsafe without the up-to-date
            // check.
            Message::RequestVote { last_index, last_term } => {
                if let (_, Some(vote)) = self.log.get_term_vote() {
                    if msg.from != vote {
                        self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
                        return Ok(self.into());
                    }
                }

                let (log_index, log_term) = self.log.get_last_index();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
                    return Ok(self.into());
                }

                info!("Voting for {} in term {} election", msg.from, msg.term);
                self.log.set_term(msg.term, Some(msg.from.clone()))?;
                self.arm_leader_timeout();
                self.send(msg.from, Message::RequestVoteResponse { granted: true })?;
            }

            // A vote may arrive after we lost an election and stepped back to
            // follower. Ignore it.
            Message::RequestVoteResponse { .. } => {}

            // Reject client commands, hinting at the leader if known.
            Message::ClientRequest { id, request: Request::Execute(_) } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                let response = Err(Error::NotLeader { leader: self.role.leader.clone() });
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // Serve status locally.
            Message::ClientRequest { id, request: Request::Status } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                let response = Ok(Response::Status(self.status(self.role.leader.clone())));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // Snapshot transfer is not implemented.
            Message::InstallSnapshot { .. } | Message::InstallSnapshotResponse { .. } => {
                warn!("Snapshot RPCs are not implemented, dropping {:?}", msg.message);
            }

            // An append response can reach a follower that was deposed while
            // its appends were in flight: the response's higher term made it
            // step down just before this handler ran. There's nothing to do
            // with it anymore.
            Message::AppendEntriesResponse { .. } => {
                debug!("Ignoring append response as follower: {:?}", msg.message);
            }

            // We never submit requests to other nodes, so we shouldn't see
            // these.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a timer expiry.
    fn on_timer(mut self, fire: TimerFire) -> Result<Node> {
        self.assert();
        if !self.timer_is_current(&fire) {
            debug!("Ignoring stale timer fire {fire:?}");
            return Ok(self.into());
        }
        self.armed.remove(&fire.timer);

        match fire.timer {
            // We haven't heard from the leader in a while, so start an
            // election, unless we're inside the election delay floor.
            Timer::Leader => {
                if !self.may_campaign() {
                    debug!("Ignoring leader timeout inside election delay");
                    self.arm_leader_timeout();
                    return Ok(self.into());
                }
                self.into_candidate()
            }

            // Stale fires from a previous role.
            Timer::Election | Timer::Heartbeat(_) => {
                debug!("Ignoring {:?} timeout as follower", fire.timer);
                Ok(self.into())
            }
        }
    }
}

/// Follower replication progress, tracked by the leader.
struct Progress {
    /// The next entry index to send to the follower.
    next_index: Index,
    /// The last entry index known replicated to the follower.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index is advanced along with it if necessary.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }
}

/// A pending client write, tracked on the leader and resolved when the
/// entry at its log index is applied. This is a leader-local sidecar: it is
/// never replicated, and it is aborted with Error::Deposed if the leader
/// loses leadership before the entry commits.
struct Write {
    /// The node which submitted the write (the leader itself, since requests
    /// are not forwarded).
    from: NodeID,
    /// The write request ID.
    id: RequestID,
}

// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Pending client writes, keyed by the log index of their entry.
    writes: HashMap<Index, Write>,
}

impl Leader {
    /// Creates a new leader role, with all followers assumed at our last
    /// index (they'll correct us via append responses).
    fn new(peers: HashSet<NodeID>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|peer| (peer, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, writes: HashMap::new() }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&self) {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(
            self.log.get_term_vote().1.as_ref(),
            Some(&self.id),
            "log vote does not match self"
        );
    }

    /// Transitions the leader into a follower. This only happens when we
    /// discover a new term, so we become a leaderless follower. All pending
    /// client writes are aborted: the new leader may or may not keep their
    /// entries, and the client must retry to find out.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");
        info!("Discovered new term {term}, stepping down");

        for write in std::mem::take(&mut self.role.writes)
            .into_values()
            .sorted_by(|a, b| a.id.cmp(&b.id))
        {
            let message = Message::ClientResponse { id: write.id, response: Err(Error::Deposed) };
            self.send(write.from, message)?;
        }

        self.cancel_campaign_timers();
        self.log.set_term(term, None)?;
        self.arm_leader_timeout();
        Ok(self.into_role(Follower::new(None)))
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: &NodeID) -> &mut Progress {
        self.role.progress.get_mut(id).expect("unknown peer")
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Reject or drop messages from stale terms.
        if msg.term < self.term() {
            self.reject_stale(msg)?;
            return Ok(self.into());
        }

        // If we receive a message for a future term, step down and step the
        // message as a leaderless follower.
        if msg.term > self.term() {
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A follower accepted entries. Record its progress, try to
            // commit, and eagerly send any further pending entries.
            Message::AppendEntriesResponse { success: true, match_index } => {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "follower matched unknown index");

                if self.progress(&msg.from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
                if self.progress(&msg.from).match_index < last_index {
                    self.send_append(&msg.from)?;
                }
            }

            // A follower rejected entries because the base entry didn't match
            // its log. Back off its next index and retry. The follower's
            // commit index (in match_index) bounds the backoff, since
            // everything at or below it is known to match.
            Message::AppendEntriesResponse { success: false, match_index: follower_commit } => {
                let progress = self.progress(&msg.from);
                let next_index = std::cmp::max(
                    std::cmp::min(progress.next_index.saturating_sub(1), follower_commit + 1),
                    progress.match_index + 1,
                );
                if next_index < progress.next_index {
                    debug!("Backing off next index for {} to {next_index}", msg.from);
                    progress.next_index = next_index;
                }
                self.send_append(&msg.from)?;
            }

            // A client submitted a command. Propose it, and track the request
            // until the entry is applied and the result returned.
            Message::ClientRequest { id, request: Request::Execute(command) } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                let index = self.propose(command)?;
                self.role.writes.insert(index, Write { from: msg.from, id });
                if self.peers.is_empty() {
                    self.maybe_commit_and_apply()?;
                }
            }

            // Serve status, including replication progress.
            Message::ClientRequest { id, request: Request::Status } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                let mut status = self.status(Some(self.id.clone()));
                status.match_index = self
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (id.clone(), p.match_index))
                    .chain(std::iter::once((self.id.clone(), self.log.get_last_index().0)))
                    .collect();
                let response = Ok(Response::Status(status));
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            // Don't grant votes in this term; we won the election.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?;
            }

            // Votes can come in after we won the election. Ignore them.
            Message::RequestVoteResponse { .. } => {}

            // Snapshot transfer is not implemented.
            Message::InstallSnapshot { .. } | Message::InstallSnapshotResponse { .. } => {
                warn!("Snapshot RPCs are not implemented, dropping {:?}", msg.message);
            }

            // Leaders don't submit requests to other nodes.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a timer expiry.
    fn on_timer(mut self, fire: TimerFire) -> Result<Node> {
        self.assert();
        if !self.timer_is_current(&fire) {
            debug!("Ignoring stale timer fire {fire:?}");
            return Ok(self.into());
        }
        self.armed.remove(&fire.timer);

        match fire.timer {
            // Send an append to the peer: pending entries if it's behind, an
            // empty heartbeat otherwise. This re-arms the timer, and also
            // retries batches whose responses were lost.
            Timer::Heartbeat(peer) => {
                self.send_append(&peer)?;
                Ok(self.into())
            }

            // Stale fires from a previous role.
            Timer::Leader | Timer::Election => {
                debug!("Ignoring {:?} timeout as leader", fire.timer);
                Ok(self.into())
            }
        }
    }

    /// Proposes a command for consensus by appending it to our log and
    /// eagerly replicating it to peers that are fully caught up (their match
    /// index is at our commit index); lagging peers are served by their
    /// heartbeat timeout instead. Returns the entry's index.
    fn propose(&mut self, command: Vec<u8>) -> Result<Index> {
        let index = self.log.append(command)?;
        let (commit_index, _) = self.log.get_commit_index();
        for peer in self.peers.iter().cloned().sorted().collect_vec() {
            if self.progress(&peer).match_index == commit_index {
                self.send_append(&peer)?;
            }
        }
        Ok(index)
    }

    /// Sends an AppendEntries to a peer, containing any entries pending for
    /// it (bounded by the batch limit) or nothing if it's caught up, and
    /// resets the peer's heartbeat timeout. The peer's commit index rides
    /// along, propagating commits.
    fn send_append(&mut self, peer: &NodeID) -> Result<()> {
        let next_index = {
            let progress = self.progress(peer);
            assert_ne!(progress.next_index, 0, "invalid next index");
            assert!(progress.next_index > progress.match_index, "next index below match index");
            progress.next_index
        };
        let prev_index = next_index - 1;
        let prev_term = match prev_index {
            0 => 0,
            index => self.log.term_at(index)?.expect("missing base entry"),
        };
        let entries: Vec<Entry> = self
            .log
            .scan(next_index..)
            .take(self.opts.max_append_entries)
            .collect::<Result<_>>()?;
        let (commit_index, _) = self.log.get_commit_index();

        debug!("Replicating {} entries at base {prev_index} to {peer}", entries.len());
        let message = Message::AppendEntries { prev_index, prev_term, entries, commit_index };
        self.send(peer.clone(), message)?;
        self.arm_heartbeat(peer.clone());
        Ok(())
    }

    /// Commits any new entries that have been replicated to a quorum, and
    /// applies them to the state machine, responding to the waiting clients.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // The quorum index is the highest index stored on a majority,
        // counting our own log.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // The quorum value can regress below the commit index, e.g. after a
        // leader change where progress is initialized at 0. Don't commit.
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term() => {}
            Some(_) => return Ok(commit_index),
            None => panic!("missing commit entry {quorum_index}"),
        }

        self.log.commit(quorum_index)?;

        // Apply the committed entries and respond to the client writers.
        let (id, term) = (self.id.clone(), self.term());
        let applied_index = self.state.get_applied_index();
        let mut scan = self.log.scan_apply(applied_index);
        while let Some(entry) = scan.next().transpose()? {
            debug!("Applying {entry:?}");
            let write = self.role.writes.remove(&entry.index);
            let result = self.state.apply(entry);
            if let Err(error) = &result {
                if !error.is_deterministic() {
                    panic!("non-deterministic apply failure: {error}");
                }
            }
            if let Some(Write { id: request_id, from: to }) = write {
                let message = Message::ClientResponse {
                    id: request_id,
                    response: result.map(Response::Execute),
                };
                Self::send_with(&self.node_tx, Envelope { from: id.clone(), to, term, message })?;
            }
        }
        Ok(quorum_index)
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::test::Journal;
    use super::*;
    use crate::storage;

    use crossbeam::channel::Receiver;
    use std::sync::{Arc, Mutex};
    use test_case::test_case;

    /// Node options for deterministic protocol tests. Timers are fired
    /// manually, so the durations are irrelevant, but the election delay
    /// floor must be disabled and the randomness seeded.
    fn test_options() -> Options {
        Options { min_election_delay: 0, seed: Some(17), ..Options::default() }
    }

    /// Test helpers for Node.
    impl Node {
        fn armed(&self) -> &HashMap<Timer, u64> {
            match self {
                Node::Candidate(n) => &n.armed,
                Node::Follower(n) => &n.armed,
                Node::Leader(n) => &n.armed,
            }
        }

        /// Fires an armed timer with its current generation.
        fn fire(self, timer: Timer) -> Result<Node> {
            let generation = *self.armed().get(&timer).expect("timer not armed");
            self.on_timer(TimerFire { timer, generation })
        }

        fn is_armed(&self, timer: &Timer) -> bool {
            self.armed().contains_key(timer)
        }

        fn role_name(&self) -> &'static str {
            match self {
                Node::Candidate(_) => "candidate",
                Node::Follower(_) => "follower",
                Node::Leader(_) => "leader",
            }
        }

        fn test_status(&self) -> Status {
            match self {
                Node::Candidate(n) => n.status(None),
                Node::Follower(n) => n.status(n.role.leader.clone()),
                Node::Leader(n) => n.status(Some(n.id.clone())),
            }
        }

        fn log_mut(&mut self) -> &mut Log {
            match self {
                Node::Candidate(n) => &mut n.log,
                Node::Follower(n) => &mut n.log,
                Node::Leader(n) => &mut n.log,
            }
        }
    }

    fn new_noop(id: &str, peers: &[&str]) -> (Node, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (timer_tx, _timer_rx) = crossbeam::channel::unbounded();
        // The timer receiver is dropped; the scheduler thread exits on its
        // first real fire, which is fine since tests fire timers manually.
        let scheduler = Scheduler::new(timer_tx);
        let log = Log::new(Box::new(storage::Memory::new())).expect("log failed");
        let (state, _) = Journal::new();
        let node = Node::new(
            id.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            log,
            state,
            node_tx,
            scheduler,
            test_options(),
        )
        .expect("node failed");
        (node, node_rx)
    }

    /// Tests quorum sizes across cluster sizes.
    #[test_case(1 => 1)]
    #[test_case(2 => 2)]
    #[test_case(3 => 2)]
    #[test_case(4 => 3)]
    #[test_case(5 => 3)]
    #[test_case(6 => 4)]
    #[test_case(7 => 4)]
    fn quorum_size(size: usize) -> usize {
        let peers: Vec<String> = (2..=size).map(|i| i.to_string()).collect();
        let peer_refs: Vec<&str> = peers.iter().map(|s| s.as_str()).collect();
        let (node, _rx) = new_noop("1", &peer_refs);
        match node {
            Node::Follower(n) => {
                assert_eq!(n.cluster_size(), size);
                n.quorum_size()
            }
            _ => panic!("expected follower"),
        }
    }

    /// Tests the quorum value of match index vectors.
    #[test_case(vec![1] => 1)]
    #[test_case(vec![1, 3, 2] => 2)]
    #[test_case(vec![4, 1, 3, 2] => 2)]
    #[test_case(vec![1, 1, 1, 2, 2] => 1)]
    #[test_case(vec![1, 1, 2, 2, 2] => 2)]
    fn quorum_value(values: Vec<i8>) -> i8 {
        let peers: Vec<String> = (2..=values.len()).map(|i| i.to_string()).collect();
        let peer_refs: Vec<&str> = peers.iter().map(|s| s.as_str()).collect();
        let (node, _rx) = new_noop("1", &peer_refs);
        match node {
            Node::Follower(n) => n.quorum_value(values),
            _ => panic!("expected follower"),
        }
    }

    /// An in-process test cluster. Nodes are driven deterministically by
    /// firing their timers and pumping their outboxes by hand; the real
    /// schedulers' fires are never delivered.
    struct Cluster {
        ids: Vec<NodeID>,
        nodes: HashMap<NodeID, Node>,
        node_rx: HashMap<NodeID, Receiver<Envelope>>,
        /// Kept alive so scheduler threads don't exit early.
        #[allow(dead_code)]
        timer_rx: HashMap<NodeID, Receiver<TimerFire>>,
        /// Entries applied to each node's state machine, in apply order.
        applied: HashMap<NodeID, Arc<Mutex<Vec<Entry>>>>,
        /// Network partitions, as unordered node pairs that can't talk.
        disconnected: HashSet<(NodeID, NodeID)>,
        /// Client responses collected per node, in arrival order.
        responses: HashMap<NodeID, Vec<(RequestID, Result<Response>)>>,
        next_request_id: u8,
    }

    impl Cluster {
        /// Creates a cluster of n nodes named a, b, c, ...
        fn new(n: usize) -> Self {
            let ids: Vec<NodeID> =
                (0..n).map(|i| ((b'a' + i as u8) as char).to_string()).collect();
            let mut cluster = Self {
                ids: ids.clone(),
                nodes: HashMap::new(),
                node_rx: HashMap::new(),
                timer_rx: HashMap::new(),
                applied: HashMap::new(),
                disconnected: HashSet::new(),
                responses: HashMap::new(),
                next_request_id: 1,
            };
            for id in &ids {
                let (node_tx, node_rx) = crossbeam::channel::unbounded();
                let (timer_tx, timer_rx) = crossbeam::channel::unbounded();
                let scheduler = Scheduler::new(timer_tx);
                let log = Log::new(Box::new(storage::Memory::new())).expect("log failed");
                let (state, applied) = Journal::new();
                let peers = ids.iter().filter(|p| *p != id).cloned().collect();
                let node = Node::new(
                    id.clone(),
                    peers,
                    log,
                    state,
                    node_tx,
                    scheduler,
                    test_options(),
                )
                .expect("node failed");
                cluster.nodes.insert(id.clone(), node);
                cluster.node_rx.insert(id.clone(), node_rx);
                cluster.timer_rx.insert(id.clone(), timer_rx);
                cluster.applied.insert(id.clone(), applied);
                cluster.responses.insert(id.clone(), Vec::new());
            }
            cluster
        }

        fn node(&self, id: &str) -> &Node {
            self.nodes.get(id).expect("unknown node")
        }

        /// Applies a transition to a node, replacing it.
        fn transition(&mut self, id: &str, f: impl FnOnce(Node) -> Result<Node>) {
            let node = self.nodes.remove(id).expect("unknown node");
            self.nodes.insert(id.to_string(), f(node).expect("transition failed"));
        }

        /// Fires an armed timer on a node.
        fn fire(&mut self, id: &str, timer: Timer) {
            self.transition(id, |n| n.fire(timer));
        }

        /// Submits a client request to a node, returning the request ID.
        fn request(&mut self, id: &str, request: Request) -> RequestID {
            let request_id = vec![self.next_request_id];
            self.next_request_id += 1;
            let (from, to) = (id.to_string(), id.to_string());
            let term = self.node(id).term();
            let message = Message::ClientRequest { id: request_id.clone(), request };
            self.transition(id, |n| n.step(Envelope { from, to, term, message }));
            request_id
        }

        /// Submits a command to a node.
        fn execute(&mut self, id: &str, command: &str) -> RequestID {
            self.request(id, Request::Execute(command.as_bytes().to_vec()))
        }

        /// Partitions two nodes from each other.
        fn disconnect(&mut self, a: &str, b: &str) {
            self.disconnected.insert((a.to_string(), b.to_string()));
            self.disconnected.insert((b.to_string(), a.to_string()));
        }

        /// Partitions a node away from all other nodes.
        fn isolate(&mut self, id: &str) {
            for other in self.ids.clone() {
                if other != id {
                    self.disconnect(id, &other);
                }
            }
        }

        /// Heals all partitions.
        fn heal(&mut self) {
            self.disconnected.clear();
        }

        /// Delivers all pending messages until the cluster is quiescent.
        /// Messages across partitions are dropped; client responses are
        /// collected instead of delivered.
        fn deliver_all(&mut self) {
            loop {
                let mut pending = Vec::new();
                for id in &self.ids {
                    while let Ok(envelope) = self.node_rx[id].try_recv() {
                        pending.push(envelope);
                    }
                }
                if pending.is_empty() {
                    return;
                }
                for envelope in pending {
                    self.route(envelope);
                }
            }
        }

        fn route(&mut self, envelope: Envelope) {
            if let Message::ClientResponse { id, response } = envelope.message {
                assert_eq!(envelope.to, envelope.from, "client response to other node");
                self.responses.get_mut(&envelope.to).expect("unknown node").push((id, response));
                return;
            }
            if self.disconnected.contains(&(envelope.from.clone(), envelope.to.clone())) {
                return;
            }
            if !self.nodes.contains_key(&envelope.to) {
                return; // crashed node
            }
            let to = envelope.to.clone();
            self.transition(&to, |n| n.step(envelope));
        }

        /// Returns the applied commands of a node, as strings.
        fn applied(&self, id: &str) -> Vec<String> {
            self.applied[id]
                .lock()
                .expect("journal poisoned")
                .iter()
                .map(|e| String::from_utf8_lossy(&e.command).into_owned())
                .collect()
        }

        /// Returns the responses collected for a node.
        fn responses(&self, id: &str) -> Vec<(RequestID, Result<Response>)> {
            self.responses[id].clone()
        }

        /// Asserts the role and term of a node.
        #[track_caller]
        fn assert_node(&self, id: &str, role: &str, term: Term) {
            let node = self.node(id);
            assert_eq!((id, node.role_name()), (id, role));
            assert_eq!((id, node.term()), (id, term));
        }

        /// Elects the given node as leader by firing its leader timeout and
        /// delivering the resulting messages.
        fn elect(&mut self, id: &str) {
            self.fire(id, Timer::Leader);
            self.deliver_all();
            assert_eq!(self.node(id).role_name(), "leader", "{id} was not elected");
        }
    }

    /// Scenario: happy-path election. Three fresh nodes; a's leader timeout
    /// fires first. It campaigns at term 1, gathers votes from b and c, and
    /// becomes leader. All nodes end at term 1 with empty logs.
    #[test]
    fn happy_path_election() {
        let mut cluster = Cluster::new(3);
        cluster.fire("a", Timer::Leader);
        cluster.assert_node("a", "candidate", 1);

        cluster.deliver_all();
        cluster.assert_node("a", "leader", 1);
        cluster.assert_node("b", "follower", 1);
        cluster.assert_node("c", "follower", 1);

        for id in ["a", "b", "c"] {
            let status = cluster.node(id).test_status();
            assert_eq!(status.leader.as_deref(), Some("a"));
            assert_eq!(status.last_index, 0, "{id} log not empty");
            assert_eq!(status.commit_index, 0);
        }
    }

    /// Scenario: single-command replication. After electing a, a client
    /// submits a command to it. The entry lands at index 1 on all nodes, the
    /// leader commits it after a majority ack, each node applies it exactly
    /// once, and the client callback resolves with the result.
    #[test]
    fn single_command_replication() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");

        let request_id = cluster.execute("a", "new_user alice");
        cluster.deliver_all();

        let status = cluster.node("a").test_status();
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.applied_index, 1);
        assert_eq!(
            cluster.responses("a"),
            vec![(request_id, Ok(Response::Execute(b"new_user alice".to_vec())))]
        );

        // The followers commit and apply once the next heartbeat carries the
        // leader's commit index.
        cluster.fire("a", Timer::Heartbeat("b".into()));
        cluster.fire("a", Timer::Heartbeat("c".into()));
        cluster.deliver_all();

        for id in ["a", "b", "c"] {
            assert_eq!(cluster.applied(id), vec!["new_user alice"], "{id} apply mismatch");
        }
    }

    /// Scenario: log conflict resolution. The leader a is at term 2 with log
    /// [1@1 x, 2@1 y, 3@2 z]; follower b has [1@1 x, 2@1 y'] where y' was
    /// written during a term-1 partition and never committed. Log matching
    /// checks the term, not the value, so b accepts an append based at 2@1
    /// and ends with [x, y', z]: Raft only guarantees equality for committed
    /// entries.
    #[test]
    fn log_conflict_keeps_matching_base() {
        let entry = |index, term, command: &str| Entry {
            index,
            term,
            command: command.as_bytes().to_vec(),
        };

        let (mut node, node_rx) = new_noop("b", &["a", "c"]);
        let log = node.log_mut();
        log.set_term(2, None).unwrap();
        log.splice(vec![entry(1, 1, "x"), entry(2, 1, "y'")]).unwrap();

        let msg = Envelope {
            from: "a".into(),
            to: "b".into(),
            term: 2,
            message: Message::AppendEntries {
                prev_index: 2,
                prev_term: 1,
                entries: vec![entry(3, 2, "z")],
                commit_index: 0,
            },
        };
        let mut node = node.step(msg).expect("step failed");

        let response = node_rx.try_recv().expect("no response");
        assert_eq!(
            response.message,
            Message::AppendEntriesResponse { success: true, match_index: 3 }
        );
        let entries: Vec<_> = node.log_mut().scan(..).collect::<Result<_>>().unwrap();
        assert_eq!(entries, vec![entry(1, 1, "x"), entry(2, 1, "y'"), entry(3, 2, "z")]);
    }

    /// Scenario: leader failover. The leader is partitioned away with an
    /// uncommitted client command pending. A survivor wins the election at
    /// the next term and resumes; when the partition heals, the old leader
    /// steps down and aborts the pending command with Deposed.
    #[test]
    fn leader_failover_deposes_pending_writes() {
        let mut cluster = Cluster::new(5);
        cluster.elect("a");

        cluster.isolate("a");
        let request_id = cluster.execute("a", "new_bid 42");
        cluster.deliver_all(); // appends dropped by the partition
        assert!(cluster.responses("a").is_empty());

        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("b", "leader", 2);

        cluster.heal();
        cluster.fire("b", Timer::Heartbeat("a".into()));
        cluster.deliver_all();

        cluster.assert_node("a", "follower", 2);
        assert_eq!(cluster.responses("a"), vec![(request_id, Err(Error::Deposed))]);
        // The command was never committed anywhere.
        for id in ["a", "b", "c", "d", "e"] {
            assert!(cluster.applied(id).is_empty());
        }
    }

    /// Scenario: split vote. Four nodes; a and b campaign simultaneously and
    /// split the electorate two against two. Neither reaches quorum (3), the
    /// election times out, and a retry at the next term wins.
    #[test]
    fn split_vote_retries_at_higher_term() {
        let mut cluster = Cluster::new(4);
        // a can't reach d and b can't reach c, so each candidate gets
        // exactly one grant: a ← c, b ← d.
        cluster.disconnect("a", "d");
        cluster.disconnect("b", "c");

        cluster.fire("a", Timer::Leader);
        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("a", "candidate", 1);
        cluster.assert_node("b", "candidate", 1);

        // The election times out; a retries at term 2 and wins.
        cluster.heal();
        cluster.fire("a", Timer::Election);
        cluster.deliver_all();
        cluster.assert_node("a", "leader", 2);
        cluster.assert_node("b", "follower", 2);
        cluster.assert_node("c", "follower", 2);
        cluster.assert_node("d", "follower", 2);
    }

    /// Scenario: stale leader returns. The old leader a (term 1) is
    /// partitioned while the term advances to 3. On heal, a's appends are
    /// rejected with the new term, and a steps down.
    #[test]
    fn stale_leader_steps_down() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");
        cluster.isolate("a");

        // Two elections among the survivors: b wins term 2, then c term 3.
        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("b", "leader", 2);
        cluster.fire("c", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("c", "leader", 3);

        cluster.heal();
        // The stale leader heartbeats b; b rejects with term 3.
        cluster.fire("a", Timer::Heartbeat("b".into()));
        cluster.deliver_all();
        cluster.assert_node("a", "follower", 3);
    }

    /// Boundary: a single-node "cluster" becomes leader after one leader
    /// timeout and commits immediately on append.
    #[test]
    fn single_node_cluster() {
        let mut cluster = Cluster::new(1);
        cluster.fire("a", Timer::Leader);
        cluster.assert_node("a", "leader", 1);

        let request_id = cluster.execute("a", "new_user alice");
        cluster.deliver_all();
        assert_eq!(
            cluster.responses("a"),
            vec![(request_id, Ok(Response::Execute(b"new_user alice".to_vec())))]
        );
        assert_eq!(cluster.applied("a"), vec!["new_user alice"]);
        let status = cluster.node("a").test_status();
        assert_eq!((status.last_index, status.commit_index), (1, 1));
    }

    /// Boundary: an empty log grants votes to candidates with an empty log.
    #[test]
    fn empty_log_grants_vote() {
        let (node, node_rx) = new_noop("b", &["a", "c"]);
        let msg = Envelope {
            from: "a".into(),
            to: "b".into(),
            term: 1,
            message: Message::RequestVote { last_index: 0, last_term: 0 },
        };
        node.step(msg).expect("step failed");
        let response = node_rx.try_recv().expect("no response");
        assert_eq!(response.message, Message::RequestVoteResponse { granted: true });
        assert_eq!(response.term, 1);
    }

    /// A node grants at most one vote per term, but re-grants to the same
    /// candidate (e.g. when the response was lost).
    #[test]
    fn at_most_one_vote_per_term() {
        let (node, node_rx) = new_noop("c", &["a", "b"]);
        let vote = |from: &str, term| Envelope {
            from: from.into(),
            to: "c".into(),
            term,
            message: Message::RequestVote { last_index: 0, last_term: 0 },
        };

        let node = node.step(vote("a", 1)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: true }
        );

        // A competing candidate in the same term is denied.
        let node = node.step(vote("b", 1)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: false }
        );

        // A duplicate solicitation from the original candidate is re-granted.
        let node = node.step(vote("a", 1)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: true }
        );

        // A new term clears the vote.
        node.step(vote("b", 2)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: true }
        );
    }

    /// Votes are denied to candidates whose log is less up-to-date, by last
    /// term first and last index second.
    #[test]
    fn vote_requires_up_to_date_log() {
        let entry = |index, term| Entry { index, term, command: vec![] };
        let (mut node, node_rx) = new_noop("b", &["a", "c"]);
        let log = node.log_mut();
        log.set_term(2, None).unwrap();
        log.splice(vec![entry(1, 1), entry(2, 2)]).unwrap();

        let vote = |term, last_index, last_term| Envelope {
            from: "a".into(),
            to: "b".into(),
            term,
            message: Message::RequestVote { last_index, last_term },
        };

        // Shorter log with the same last term: denied.
        let node = node.step(vote(3, 1, 2)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: false }
        );

        // Longer log with a lower last term: denied.
        let node = node.step(vote(4, 5, 1)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: false }
        );

        // Higher last term wins regardless of length.
        node.step(vote(5, 1, 3)).expect("step failed");
        assert_eq!(
            node_rx.try_recv().expect("no response").message,
            Message::RequestVoteResponse { granted: true }
        );
    }

    /// Replaying the same AppendEntries twice leaves the log unchanged and
    /// produces the same response (duplicate leader retries are idempotent).
    #[test]
    fn append_entries_idempotent() {
        let entry = |index, term, command: &str| Entry {
            index,
            term,
            command: command.as_bytes().to_vec(),
        };
        let (node, node_rx) = new_noop("b", &["a", "c"]);
        let msg = Envelope {
            from: "a".into(),
            to: "b".into(),
            term: 1,
            message: Message::AppendEntries {
                prev_index: 0,
                prev_term: 0,
                entries: vec![entry(1, 1, "x"), entry(2, 1, "y")],
                commit_index: 0,
            },
        };

        let node = node.step(msg.clone()).expect("step failed");
        let first = node_rx.try_recv().expect("no response");
        let mut node = node.step(msg).expect("step failed");
        let second = node_rx.try_recv().expect("no response");

        assert_eq!(first.message, second.message);
        assert_eq!(
            first.message,
            Message::AppendEntriesResponse { success: true, match_index: 2 }
        );
        let entries: Vec<_> = node.log_mut().scan(..).collect::<Result<_>>().unwrap();
        assert_eq!(entries, vec![entry(1, 1, "x"), entry(2, 1, "y")]);
    }

    /// A follower missing the base entry rejects the append and reports its
    /// commit index; the leader backs off to it and replicates the full log.
    /// The caught-up entries are from a previous term, so they only commit
    /// once an entry from the new leader's own term reaches quorum.
    #[test]
    fn append_reject_backoff_catches_up() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");

        // Replicate two commands, with c cut off.
        cluster.isolate("c");
        cluster.execute("a", "x");
        cluster.deliver_all();
        cluster.execute("a", "y");
        cluster.deliver_all();
        assert_eq!(cluster.node("a").test_status().commit_index, 2);
        assert_eq!(cluster.node("c").test_status().last_index, 0);

        // b takes over. Its next index for c starts past c's log, so its
        // first append to c is rejected; b backs off to c's commit index (0)
        // and replicates the full log.
        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("b", "leader", 2);
        cluster.heal();
        cluster.fire("b", Timer::Heartbeat("c".into()));
        cluster.deliver_all();
        assert_eq!(cluster.node("c").test_status().last_index, 2);
        assert_eq!(cluster.node("b").test_status().commit_index, 1);

        // A command in b's own term commits everything, and two heartbeat
        // rounds propagate the commit index to the followers.
        cluster.execute("b", "z");
        cluster.deliver_all();
        for _ in 0..2 {
            for peer in ["a", "c"] {
                cluster.fire("b", Timer::Heartbeat(peer.into()));
            }
            cluster.deliver_all();
        }
        for id in ["a", "b", "c"] {
            assert_eq!(cluster.applied(id), vec!["x", "y", "z"], "{id} diverged");
        }
    }

    /// Deterministic state machine errors resolve the client callback with
    /// the error, but the entry still commits and applies on all nodes.
    #[test]
    fn executor_error_is_a_result() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");

        let request_id = cluster.execute("a", "reject");
        cluster.deliver_all();

        assert_eq!(
            cluster.responses("a"),
            vec![(request_id, Err(Error::InvalidInput("command rejected".into())))]
        );
        let status = cluster.node("a").test_status();
        assert_eq!((status.commit_index, status.applied_index), (1, 1));
        assert_eq!(cluster.applied("a"), vec!["reject"]);
    }

    /// Client commands on followers are rejected with a leader hint, and on
    /// candidates without one.
    #[test]
    fn not_leader_rejection() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");

        let request_id = cluster.execute("b", "new_user alice");
        cluster.deliver_all();
        assert_eq!(
            cluster.responses("b"),
            vec![(request_id, Err(Error::NotLeader { leader: Some("a".into()) }))]
        );

        // Candidates have no leader to hint at.
        cluster.isolate("c");
        cluster.fire("c", Timer::Leader);
        let request_id = cluster.execute("c", "new_user bob");
        cluster.deliver_all();
        assert_eq!(
            cluster.responses("c"),
            vec![(request_id, Err(Error::NotLeader { leader: None }))]
        );
    }

    /// The election delay floor suppresses back-to-back elections: an
    /// election timeout inside the delay is ignored and re-armed.
    #[test]
    fn election_delay_floor() {
        let (node_tx, _node_rx) = crossbeam::channel::unbounded();
        let (timer_tx, _timer_rx) = crossbeam::channel::unbounded();
        let log = Log::new(Box::new(storage::Memory::new())).expect("log failed");
        let (state, _) = Journal::new();
        let opts = Options {
            min_election_delay: 60_000,
            seed: Some(17),
            ..Options::default()
        };
        let node = Node::new(
            "a".to_string(),
            ["b".to_string(), "c".to_string()].into(),
            log,
            state,
            node_tx,
            Scheduler::new(timer_tx),
            opts,
        )
        .expect("node failed");

        // The first campaign is allowed (no prior election).
        let node = node.fire(Timer::Leader).expect("fire failed");
        assert_eq!(node.role_name(), "candidate");
        assert_eq!(node.term(), 1);

        // The election timeout fires inside the delay: ignored, re-armed.
        let node = node.fire(Timer::Election).expect("fire failed");
        assert_eq!(node.role_name(), "candidate");
        assert_eq!(node.term(), 1);
        assert!(node.is_armed(&Timer::Election));
    }

    /// Stale timer fires (raced with a reset) are discarded by generation.
    #[test]
    fn stale_timer_fire_ignored() {
        let (node, _node_rx) = new_noop("a", &["b", "c"]);
        let stale = *node.armed().get(&Timer::Leader).expect("leader timeout not armed");

        // Re-arm by stepping a heartbeat from a leader, which resets the
        // leader timeout to a new generation.
        let msg = Envelope {
            from: "b".into(),
            to: "a".into(),
            term: 1,
            message: Message::AppendEntries {
                prev_index: 0,
                prev_term: 0,
                entries: vec![],
                commit_index: 0,
            },
        };
        let node = node.step(msg).expect("step failed");
        assert_ne!(node.armed()[&Timer::Leader], stale);

        // The stale fire no longer triggers an election.
        let node = node
            .on_timer(TimerFire { timer: Timer::Leader, generation: stale })
            .expect("on_timer failed");
        assert_eq!(node.role_name(), "follower");
        assert_eq!(node.term(), 1);
    }

    /// Commit requires an entry from the leader's own term: entries from a
    /// previous term are only committed once a current-term entry reaches
    /// quorum.
    #[test]
    fn commit_requires_current_term_entry() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");

        // a appends a command but is isolated before it can commit.
        cluster.isolate("a");
        cluster.execute("a", "orphan");
        cluster.deliver_all();
        assert_eq!(cluster.node("a").test_status().commit_index, 0);

        // b never saw a's entry. It wins term 2 and commits a command of its
        // own, which supersedes a's uncommitted entry once a rejoins.
        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("b", "leader", 2);
        cluster.execute("b", "winner");
        cluster.deliver_all();
        assert_eq!(cluster.node("b").test_status().commit_index, 1);

        // a rejoins, steps down, and converges on b's log.
        cluster.heal();
        cluster.fire("b", Timer::Heartbeat("a".into()));
        cluster.deliver_all();
        cluster.assert_node("a", "follower", 2);
        assert_eq!(cluster.node("a").test_status().last_index, 1);
        assert_eq!(cluster.applied("a"), vec!["winner"]);
        assert_eq!(cluster.applied("b"), vec!["winner"]);
    }

    /// All nodes apply the same entries in the same order (state machine
    /// safety), across leader changes and partitions.
    #[test]
    fn state_machine_safety() {
        let mut cluster = Cluster::new(3);
        cluster.elect("a");
        cluster.execute("a", "one");
        cluster.deliver_all();

        // Fail over to b and keep writing.
        cluster.isolate("a");
        cluster.fire("b", Timer::Leader);
        cluster.deliver_all();
        cluster.assert_node("b", "leader", 2);
        cluster.execute("b", "two");
        cluster.deliver_all();
        cluster.execute("b", "three");
        cluster.deliver_all();

        // Heal and propagate commits everywhere.
        cluster.heal();
        for peer in ["a", "c"] {
            cluster.fire("b", Timer::Heartbeat(peer.into()));
        }
        cluster.deliver_all();
        for peer in ["a", "c"] {
            cluster.fire("b", Timer::Heartbeat(peer.into()));
        }
        cluster.deliver_all();

        for id in ["a", "b", "c"] {
            assert_eq!(cluster.applied(id), vec!["one", "two", "three"], "{id} diverged");
        }
    }

    /// Snapshot RPCs are reserved but unimplemented: they are dropped
    /// without a response or state change.
    #[test]
    fn snapshot_rpcs_dropped() {
        let (node, node_rx) = new_noop("a", &["b", "c"]);
        let msg = Envelope {
            from: "b".into(),
            to: "a".into(),
            term: 0,
            message: Message::InstallSnapshot { last_index: 1, last_term: 1, data: vec![0xff] },
        };
        let node = node.step(msg).expect("step failed");
        assert_eq!(node.role_name(), "follower");
        assert_eq!(node.term(), 0);
        assert!(node_rx.try_recv().is_err());
    }
}
