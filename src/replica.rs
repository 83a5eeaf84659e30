use crate::cluster::Cluster;
use crate::executor::{Cadence, Executor};
use crate::message::{
    AppendEntryRequest, AppendEntryResponse, Entry, EntryKind, VoteRequest, VoteResponse,
};
use bytes::Bytes;
use log::{debug, info};
use std::cmp;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// ReplicaID is a type alias used to identify Raft nodes. Id 0 is reserved
/// and stands for "no replica" wherever an id is returned.
pub type ReplicaID = usize;

/// Role of a replica within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Constructed but never started.
    None,
    Leader,
    Candidate,
    Follower,
}

/// Protocol cadences. The defaults follow the design targets: a 300 ms
/// tick, a six-tick heartbeat timeout (~1.8 s), and a 100-300 ms randomized
/// pause between campaign rounds.
///
/// Pick the campaign backoff well under the heartbeat timeout so a split
/// vote progresses to a new term before followers give up on the winner.
#[derive(Clone, Debug)]
pub struct Timing {
    /// Interval between periodic replication/timeout ticks.
    pub tick_interval: Duration,
    /// Number of quiet ticks a follower tolerates before campaigning.
    pub heartbeat_timeout_ticks: usize,
    /// Range the pause between campaign rounds is drawn from.
    pub campaign_backoff: (Duration, Duration),
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            tick_interval: Duration::from_millis(300),
            heartbeat_timeout_ticks: 6,
            campaign_backoff: (Duration::from_millis(100), Duration::from_millis(300)),
        }
    }
}

/// Replica is one member of the cluster. It keeps the replicated log
/// consistent with its peers by exchanging vote and append messages through
/// the executor; committed user entries surface in order via
/// [`applied_log`].
///
/// Every handler locks the replica for its full duration, so handlers are
/// linearizable with respect to one another no matter how many workers
/// deliver messages concurrently.
///
/// [`applied_log`]: Replica::applied_log
pub struct Replica {
    /// ID of this replica.
    id: ReplicaID,

    /// Backref to the directory that owns this replica.
    cluster: Weak<Cluster>,

    /// Where ticks, campaign rounds, and message deliveries are scheduled.
    executor: Arc<dyn Executor>,

    /// Protocol cadences.
    timing: Timing,

    /// Everything the protocol mutates, behind one lock.
    state: Mutex<ReplicaState>,
}

struct ReplicaState {
    /// Current role. `Role::None` until the replica is first started.
    role: Role,

    /// When set, every handler returns immediately. Start and restart clear
    /// it.
    stopped: bool,

    /// Current term. Nondecreasing while the replica runs.
    term: usize,

    /// Who the vote in the current term went to; 0 when nobody. Followers
    /// keep their leader's id here, which is what add_log hands back as a
    /// redirect hint.
    voted_for: ReplicaID,

    /// The entries this replica is aware of. Entry i sits at position i.
    log: Vec<Entry>,

    /// Index of the highest entry known to be committed.
    commit_index: usize,

    /// Index of the highest entry handed to the apply sink.
    applied_index: usize,

    /// Ticks since the last believable append from a leader.
    heartbeat_ticks: usize,

    /// Votes collected in the current campaign, own vote included.
    votes_received: usize,

    /// For each peer, the next log index to send. Leaders only.
    next_index: BTreeMap<ReplicaID, usize>,

    /// For each peer, the highest index known to be replicated there.
    /// Leaders only.
    match_index: BTreeMap<ReplicaID, usize>,

    /// Applied user entries, in apply order. This is the apply sink.
    applied: Vec<Entry>,
}

impl ReplicaState {
    fn last_log_term(&self) -> usize {
        self.log.last().map_or(0, |entry| entry.term)
    }
}

impl Replica {
    pub(crate) fn new(
        id: ReplicaID,
        cluster: Weak<Cluster>,
        executor: Arc<dyn Executor>,
        timing: Timing,
    ) -> Arc<Replica> {
        Arc::new(Replica {
            id,
            cluster,
            executor,
            timing,
            state: Mutex::new(ReplicaState {
                role: Role::None,
                stopped: true,
                term: 0,
                voted_for: 0,
                log: Vec::new(),
                commit_index: 0,
                applied_index: 0,
                heartbeat_ticks: 0,
                votes_received: 0,
                next_index: BTreeMap::new(),
                match_index: BTreeMap::new(),
                applied: Vec::new(),
            }),
        })
    }

    /// Brings the replica online for the first time: resets the whole
    /// state, seeds the log with the term-0 start marker, and installs the
    /// periodic tick.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.stopped = false;
            state.heartbeat_ticks = 0;
            state.votes_received = 0;
            state.role = Role::Follower;
            state.term = 0;
            state.voted_for = 0;
            state.log.clear();
            state.log.push(Entry {
                index: 0,
                term: 0,
                kind: EntryKind::System,
                payload: Bytes::from_static(b"Start"),
            });
            state.commit_index = 0;
            state.applied_index = 0;
            state.next_index.clear();
            state.match_index.clear();
            state.applied.clear();
        }
        info!("replica {} starting", self.id);

        let ticker = Arc::downgrade(self);
        self.executor.spawn_periodic(
            Cadence::Fixed(self.timing.tick_interval),
            Box::new(move || match ticker.upgrade() {
                Some(replica) => replica.tick(),
                None => false,
            }),
        );
    }

    /// Takes the replica offline. Handlers observe the flag and
    /// short-circuit; durable state is preserved and timers keep firing
    /// idle.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        info!("replica {} stopping", self.id);
    }

    /// Rejoins the running set after a stop. Leader progress vectors and
    /// campaign counters are volatile and reset; term, vote, log, and
    /// commit/apply progress carry over.
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = false;
        state.heartbeat_ticks = 0;
        state.votes_received = 0;
        state.next_index.clear();
        state.match_index.clear();
        info!("replica {} restarting", self.id);
    }

    /// Appends a user payload to the log if this replica currently leads
    /// and returns 0. Otherwise returns the id of the leader this replica
    /// last heard from, or 0 when it knows of none, as a redirect hint.
    /// Dissemination is asynchronous: the next tick carries the entry out.
    pub fn add_log(&self, payload: Bytes) -> ReplicaID {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.role != Role::Leader {
            return state.voted_for;
        }
        let entry = Entry {
            index: state.log.len(),
            term: state.term,
            kind: EntryKind::User,
            payload,
        };
        debug!(
            "replica {} accepted entry {} in term {}",
            self.id, entry.index, entry.term
        );
        state.log.push(entry);
        0
    }

    pub fn id(&self) -> ReplicaID {
        self.id
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn term(&self) -> usize {
        self.state.lock().unwrap().term
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().role == Role::Leader
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn commit_index(&self) -> usize {
        self.state.lock().unwrap().commit_index
    }

    pub fn applied_index(&self) -> usize {
        self.state.lock().unwrap().applied_index
    }

    /// Snapshot of the applied user entries, in apply order. System entries
    /// never show up here.
    pub fn applied_log(&self) -> Vec<Entry> {
        self.state.lock().unwrap().applied.clone()
    }

    /// Snapshot of the whole log, system entries included.
    pub fn log_entries(&self) -> Vec<Entry> {
        self.state.lock().unwrap().log.clone()
    }

    // The term this replica currently leads in, if it is running and leads.
    pub(crate) fn leadership(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        if !state.stopped && state.role == Role::Leader {
            Some(state.term)
        } else {
            None
        }
    }

    // One firing of the periodic tick. Returns false once the cluster is
    // gone and the timer should wind down.
    fn tick(&self) -> bool {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return false,
        };
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return true;
        }

        match state.role {
            Role::None => return false,
            Role::Leader => self.replicate(&cluster, &mut state),
            Role::Follower => {
                state.heartbeat_ticks += 1;
                if state.heartbeat_ticks >= self.timing.heartbeat_timeout_ticks {
                    state.heartbeat_ticks = 0;
                    state.role = Role::Candidate;
                    info!(
                        "replica {} saw no heartbeat for {} ticks, campaigning",
                        self.id, self.timing.heartbeat_timeout_ticks
                    );
                    let candidate = cluster.get(self.id);
                    let (lo, hi) = self.timing.campaign_backoff;
                    self.executor.spawn_periodic(
                        Cadence::Jittered(lo, hi),
                        Box::new(move || candidate.campaign()),
                    );
                }
            }
            // Candidates idle in the tick; the campaign timer drives them.
            Role::Candidate => {}
        }

        if state.role == Role::Leader {
            self.advance_commit_index(&mut state);
        }
        self.apply_ready_entries(&mut state);
        true
    }

    // Send each peer its outstanding log tail. An empty tail doubles as the
    // heartbeat. Absent replies are tolerated; the next tick resends.
    fn replicate(&self, cluster: &Arc<Cluster>, state: &mut ReplicaState) {
        for id in cluster.peer_ids(self.id) {
            let next = match state.next_index.get(&id) {
                Some(&next) => next,
                None => continue,
            };
            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index < state.log.len() {
                state.log[prev_log_index].term
            } else {
                0
            };
            let request = AppendEntryRequest {
                term: state.term,
                from_id: self.id,
                prev_log_index,
                prev_log_term,
                commit_index: state.commit_index,
                entries: if next < state.log.len() {
                    state.log[next..].to_vec()
                } else {
                    Vec::new()
                },
            };
            let peer = cluster.get(id);
            self.executor
                .submit(Box::new(move || peer.handle_append_entry_request(request)));
        }
    }

    // One campaign round: bump the term, vote for self, solicit everyone
    // else. Returns false once this replica is no longer a candidate so the
    // campaign timer winds down.
    fn campaign(&self) -> bool {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return false,
        };
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.role != Role::Candidate {
            return false;
        }

        state.term += 1;
        state.voted_for = self.id;
        state.votes_received = 1;
        debug!("replica {} campaigning in term {}", self.id, state.term);

        if state.votes_received * 2 > cluster.size() {
            // Single-replica cluster; the self-vote already carries it.
            let peers = cluster.peer_ids(self.id);
            self.become_leader(&mut state, &peers);
            return false;
        }

        let request = VoteRequest {
            term: state.term,
            from_id: self.id,
            last_log_index: state.log.len() - 1,
            last_log_term: state.last_log_term(),
        };
        for id in cluster.peer_ids(self.id) {
            let peer = cluster.get(id);
            let request = request.clone();
            self.executor
                .submit(Box::new(move || peer.handle_vote_request(request)));
        }
        true
    }

    /// Receiver side of vote solicitation. Grants when the candidate's term
    /// is current (or this replica has no conflicting vote) and the
    /// candidate's log is at least as up to date as the local one.
    pub fn handle_vote_request(&self, request: VoteRequest) {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return,
        };
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }

        let mut vote_granted = false;
        if request.term >= state.term
            || state.voted_for == 0
            || state.voted_for == request.from_id
        {
            let last_log_term = state.last_log_term();
            if request.last_log_term > last_log_term
                || (request.last_log_term == last_log_term
                    && request.last_log_index + 1 >= state.log.len())
            {
                self.become_follower(&mut state, request.term, request.from_id);
                vote_granted = true;
            }
        }

        // A leader that refuses a vote steps down all the same; the refused
        // candidate's next round finds a plain follower.
        if !vote_granted && state.role == Role::Leader {
            self.become_follower(&mut state, request.term, 0);
        }

        debug!(
            "replica {} {} the vote for {} in term {}",
            self.id,
            if vote_granted { "grants" } else { "denies" },
            request.from_id,
            request.term
        );

        let response = VoteResponse {
            term: state.term,
            vote_granted,
        };
        let candidate = cluster.get(request.from_id);
        self.executor
            .submit(Box::new(move || candidate.handle_vote_response(response)));
    }

    /// Candidate side of the vote tally. A strict majority of the
    /// configured cluster size, own vote included, wins the election.
    pub fn handle_vote_response(&self, response: VoteResponse) {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return,
        };
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.role != Role::Candidate {
            return;
        }

        if response.vote_granted {
            state.votes_received += 1;
            if state.votes_received * 2 > cluster.size() {
                let peers = cluster.peer_ids(self.id);
                self.become_leader(&mut state, &peers);
            }
        } else if response.term > state.term {
            self.become_follower(&mut state, response.term, 0);
        }
    }

    /// Follower side of log replication. Resets the heartbeat clock, checks
    /// the consistency point, and splices the offered tail over anything
    /// that diverges. Heartbeats (no entries) are not acknowledged.
    pub fn handle_append_entry_request(&self, request: AppendEntryRequest) {
        let cluster = match self.cluster.upgrade() {
            Some(cluster) => cluster,
            None => return,
        };
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }

        let mut success = false;
        if request.term < state.term {
            debug!(
                "replica {} ignoring append from {}: term {} behind {}",
                self.id, request.from_id, request.term, state.term
            );
        } else {
            state.heartbeat_ticks = 0;
            state.term = request.term;
            if state.role != Role::Follower {
                self.become_follower(&mut state, request.term, request.from_id);
            }

            if request.entries.is_empty() {
                // Adopt the leader's commit progress when its record of
                // this log matches reality.
                if state.commit_index < request.commit_index
                    && request.prev_log_index < state.log.len()
                    && state.log[request.prev_log_index].term == request.prev_log_term
                {
                    state.commit_index =
                        cmp::min(request.prev_log_index, request.commit_index);
                }
                return;
            }

            if state.commit_index >= request.prev_log_index + request.entries.len() {
                // Everything offered is already inside the commit horizon.
                success = true;
            } else if request.prev_log_index >= state.log.len()
                || state.log[request.prev_log_index].term != request.prev_log_term
            {
                debug!(
                    "replica {} rejecting append from {}: nothing matches index {} term {}",
                    self.id, request.from_id, request.prev_log_index, request.prev_log_term
                );
            } else {
                // Drop whatever diverges past the agreed point and adopt
                // the leader's tail. Replaying the same request leaves the
                // log unchanged.
                state.log.truncate(request.prev_log_index + 1);
                state.log.extend(request.entries.iter().cloned());
                if state.commit_index < request.commit_index {
                    state.commit_index = cmp::min(
                        request.commit_index,
                        cmp::max(request.prev_log_index, state.commit_index),
                    );
                }
                debug_assert!(state.log.iter().enumerate().all(|(i, e)| e.index == i));
                success = true;
            }
        }

        let response = AppendEntryResponse {
            from_id: self.id,
            term: state.term,
            entry_count: request.entries.len(),
            success,
            commit_index: state.commit_index,
        };
        let leader = cluster.get(request.from_id);
        self.executor
            .submit(Box::new(move || leader.handle_append_entry_response(response)));
    }

    /// Leader side of the replication round trip: advance the peer's
    /// progress on success, or fall back to the peer's reported commit
    /// point on rejection instead of probing back one entry at a time.
    pub fn handle_append_entry_response(&self, response: AppendEntryResponse) {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.role != Role::Leader {
            return;
        }
        let next = match state.next_index.get(&response.from_id) {
            Some(&next) => next,
            // Not a peer this leadership tracks.
            None => return,
        };

        if response.success {
            let matched = cmp::max(
                state.match_index[&response.from_id],
                next + response.entry_count - 1,
            );
            state.match_index.insert(response.from_id, matched);
            state.next_index.insert(response.from_id, next + response.entry_count);
        } else if response.term <= state.term {
            debug!(
                "replica {} resending to {} from index {}",
                self.id,
                response.from_id,
                response.commit_index + 1
            );
            state.next_index.insert(response.from_id, response.commit_index + 1);
        }
        // A rejection carrying a higher term is left alone; the next vote
        // request or higher-term append forces the step-down.
    }

    fn become_leader(&self, state: &mut ReplicaState, peers: &[ReplicaID]) {
        state.role = Role::Leader;
        state.heartbeat_ticks = 0;
        state.votes_received = 0;
        state.voted_for = 0;
        state.next_index.clear();
        state.match_index.clear();
        for &peer in peers {
            state.next_index.insert(peer, 1);
            state.match_index.insert(peer, 0);
        }

        // The no-op gives this leadership an entry of its own term, without
        // which nothing from earlier terms could ever be committed.
        let marker = format!("ToLeader:{}", self.id);
        state.log.push(Entry {
            index: state.log.len(),
            term: state.term,
            kind: EntryKind::System,
            payload: Bytes::from(marker),
        });
        info!("replica {} is now leader in term {}", self.id, state.term);
    }

    // Callers only hand in terms at or above the current one.
    fn become_follower(&self, state: &mut ReplicaState, term: usize, voted_for: ReplicaID) {
        state.role = Role::Follower;
        state.heartbeat_ticks = 0;
        state.votes_received = 0;
        state.term = term;
        state.voted_for = voted_for;
        debug!("replica {} following in term {}", self.id, term);
    }

    // The median match across peers is replicated on a strict majority once
    // self is counted. Entries from earlier terms are never committed by
    // counting, only in the wake of a current-term commit.
    fn advance_commit_index(&self, state: &mut ReplicaState) {
        if state.match_index.is_empty() {
            return;
        }
        let mut matches: Vec<usize> = state.match_index.values().cloned().collect();
        matches.sort_unstable();
        let median = matches[matches.len() / 2];
        if median < state.log.len()
            && state.log[median].term == state.term
            && median > state.commit_index
        {
            debug!(
                "replica {} commit index {} -> {}",
                self.id, state.commit_index, median
            );
            state.commit_index = median;
        }
    }

    // Feed newly committed entries to the apply sink in index order. Only
    // user entries surface.
    fn apply_ready_entries(&self, state: &mut ReplicaState) {
        while state.applied_index < state.commit_index
            && state.applied_index + 1 < state.log.len()
        {
            state.applied_index += 1;
            let entry = state.log[state.applied_index].clone();
            debug_assert_eq!(entry.index, state.applied_index);
            if entry.is_user() {
                debug!(
                    "replica {} applying entry {} from term {}",
                    self.id, entry.index, entry.term
                );
                state.applied.push(entry);
            }
        }
        debug_assert!(state.applied_index <= state.commit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DeferredExecutor;

    fn harness(size: usize) -> (Arc<DeferredExecutor>, Arc<Cluster>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let exec = Arc::new(DeferredExecutor::new());
        let cluster = Cluster::new(size, exec.clone());
        for id in 1..=size {
            cluster.get(id).start();
        }
        (exec, cluster)
    }

    // Ticks replica `id` through a full heartbeat timeout and one campaign
    // round, then delivers everything in flight.
    fn elect(exec: &DeferredExecutor, cluster: &Arc<Cluster>, id: ReplicaID) {
        let replica = cluster.get(id);
        for _ in 0..Timing::default().heartbeat_timeout_ticks {
            replica.tick();
        }
        assert_eq!(replica.role(), Role::Candidate);
        replica.campaign();
        exec.run_until_idle();
        assert!(replica.is_leader());
    }

    // One cluster-wide tick round followed by full message delivery,
    // repeated `rounds` times.
    fn settle(exec: &DeferredExecutor, cluster: &Arc<Cluster>, rounds: usize) {
        for _ in 0..rounds {
            for id in cluster.all_keys() {
                cluster.get(id).tick();
            }
            exec.run_until_idle();
        }
    }

    fn user_entry(index: usize, term: usize, payload: &'static [u8]) -> Entry {
        Entry {
            index,
            term,
            kind: EntryKind::User,
            payload: Bytes::from_static(payload),
        }
    }

    fn system_entry(index: usize, term: usize) -> Entry {
        Entry {
            index,
            term,
            kind: EntryKind::System,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn start_initializes_a_follower_with_the_log_marker() {
        let (_exec, cluster) = harness(3);
        let replica = cluster.get(1);
        assert_eq!(replica.role(), Role::Follower);
        assert_eq!(replica.term(), 0);
        assert!(!replica.is_stopped());

        let log = replica.log_entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 0);
        assert_eq!(log[0].term, 0);
        assert_eq!(log[0].kind, EntryKind::System);
        assert!(replica.applied_log().is_empty());
    }

    #[test]
    fn follower_turns_candidate_after_quiet_ticks() {
        let (_exec, cluster) = harness(3);
        let replica = cluster.get(1);
        for _ in 0..Timing::default().heartbeat_timeout_ticks - 1 {
            replica.tick();
            assert_eq!(replica.role(), Role::Follower);
        }
        replica.tick();
        assert_eq!(replica.role(), Role::Candidate);
    }

    #[test]
    fn election_reaches_quorum_and_installs_the_noop() {
        let (exec, cluster) = harness(5);
        elect(&exec, &cluster, 1);

        let leader = cluster.get(1);
        assert_eq!(leader.term(), 1);
        assert_eq!(cluster.leader_id(), 1);

        let log = leader.log_entries();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 1);
        assert_eq!(log[1].kind, EntryKind::System);

        for id in cluster.peer_ids(1) {
            let peer = cluster.get(id);
            assert_eq!(peer.role(), Role::Follower);
            assert_eq!(peer.term(), 1);
        }
    }

    #[test]
    fn replication_commits_and_applies_user_entries() {
        let (exec, cluster) = harness(5);
        elect(&exec, &cluster, 1);

        let leader = cluster.get(1);
        assert_eq!(leader.add_log(Bytes::from_static(b"set x=1")), 0);
        settle(&exec, &cluster, 4);

        assert_eq!(leader.commit_index(), 2);
        assert_eq!(leader.applied_index(), 2);
        for id in cluster.all_keys() {
            let applied = cluster.get(id).applied_log();
            assert_eq!(applied.len(), 1, "replica {} lagging", id);
            assert_eq!(&applied[0].payload[..], b"set x=1");
        }
    }

    #[test]
    fn entries_do_not_commit_without_a_majority() {
        let (exec, cluster) = harness(5);
        elect(&exec, &cluster, 1);
        for id in 3..=5 {
            cluster.get(id).stop();
        }

        let leader = cluster.get(1);
        assert_eq!(leader.add_log(Bytes::from_static(b"doomed")), 0);
        settle(&exec, &cluster, 4);

        assert_eq!(leader.commit_index(), 0);
        for id in cluster.all_keys() {
            assert!(cluster.get(id).applied_log().is_empty());
        }
    }

    #[test]
    fn add_log_redirects_to_the_last_known_leader() {
        let (exec, cluster) = harness(3);
        assert_eq!(cluster.get(2).add_log(Bytes::from_static(b"early")), 0);

        elect(&exec, &cluster, 1);
        assert_eq!(cluster.get(2).add_log(Bytes::from_static(b"late")), 1);
        // The rejected payloads never entered any log.
        assert_eq!(cluster.get(2).log_entries().len(), 1);
    }

    #[test]
    fn duplicate_append_requests_are_idempotent() {
        let (exec, cluster) = harness(3);
        elect(&exec, &cluster, 1);

        let request = AppendEntryRequest {
            term: 1,
            from_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            commit_index: 0,
            entries: vec![system_entry(1, 1), user_entry(2, 1, b"twice")],
        };
        let follower = cluster.get(2);
        follower.handle_append_entry_request(request.clone());
        let once = follower.log_entries();
        follower.handle_append_entry_request(request);
        assert_eq!(follower.log_entries(), once);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn append_with_a_stale_term_is_rejected() {
        let (exec, cluster) = harness(3);
        let follower = cluster.get(2);

        // Push the follower to term 5 by granting a vote there.
        follower.handle_vote_request(VoteRequest {
            term: 5,
            from_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });
        exec.run_until_idle();
        assert_eq!(follower.term(), 5);

        follower.handle_append_entry_request(AppendEntryRequest {
            term: 3,
            from_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            commit_index: 0,
            entries: vec![user_entry(1, 3, b"old news")],
        });
        exec.run_until_idle();
        assert_eq!(follower.term(), 5);
        assert_eq!(follower.log_entries().len(), 1);
    }

    #[test]
    fn rejected_append_backs_the_leader_off_to_the_follower_commit() {
        let (exec, cluster) = harness(3);
        elect(&exec, &cluster, 1);
        let leader = cluster.get(1);
        settle(&exec, &cluster, 1);
        assert_eq!(leader.state.lock().unwrap().next_index[&2], 2);

        // A request far past the follower's log is refused and the refusal
        // carries the follower's commit progress back.
        cluster.get(2).handle_append_entry_request(AppendEntryRequest {
            term: 1,
            from_id: 1,
            prev_log_index: 7,
            prev_log_term: 1,
            commit_index: 7,
            entries: vec![user_entry(8, 1, b"gap")],
        });
        exec.run_until_idle();
        assert_eq!(
            leader.state.lock().unwrap().next_index[&2],
            cluster.get(2).commit_index() + 1
        );
    }

    #[test]
    fn heartbeat_advances_commit_without_acknowledgement() {
        let (exec, cluster) = harness(3);
        elect(&exec, &cluster, 1);
        let leader = cluster.get(1);
        let follower = cluster.get(2);

        // Round one replicates the noop; the next tick advances the
        // leader's commit; the heartbeat after that hands the point over.
        settle(&exec, &cluster, 1);
        leader.tick();
        exec.run_until_idle();
        assert_eq!(leader.commit_index(), 1);
        assert_eq!(follower.commit_index(), 0);
        leader.tick();
        exec.run_until_idle();
        assert_eq!(follower.commit_index(), 1);

        // A heartbeat whose consistency point does not match moves nothing
        // and is never acknowledged.
        let third = cluster.get(3);
        let commit_before = third.commit_index();
        third.handle_append_entry_request(AppendEntryRequest {
            term: 1,
            from_id: 1,
            prev_log_index: 1,
            prev_log_term: 9,
            commit_index: 1,
            entries: Vec::new(),
        });
        assert_eq!(third.commit_index(), commit_before);
        assert_eq!(exec.pending(), 0);
    }

    #[test]
    fn stale_candidate_cannot_steal_a_granted_vote() {
        let (exec, cluster) = harness(3);
        let follower = cluster.get(2);
        follower.handle_vote_request(VoteRequest {
            term: 5,
            from_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });
        exec.run_until_idle();
        assert_eq!(follower.state.lock().unwrap().voted_for, 3);

        follower.handle_vote_request(VoteRequest {
            term: 4,
            from_id: 1,
            last_log_index: 9,
            last_log_term: 9,
        });
        exec.run_until_idle();
        assert_eq!(follower.state.lock().unwrap().voted_for, 3);
        assert_eq!(follower.term(), 5);
    }

    #[test]
    fn leader_steps_down_when_denying_a_fresher_candidate() {
        let (exec, cluster) = harness(3);
        elect(&exec, &cluster, 1);
        let leader = cluster.get(1);

        // The candidate's term is newer but its log is not up to date, so
        // the vote is denied; the leader abdicates anyway.
        leader.handle_vote_request(VoteRequest {
            term: 2,
            from_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        exec.run_until_idle();
        assert_eq!(leader.role(), Role::Follower);
        assert_eq!(leader.term(), 2);
        assert_eq!(leader.state.lock().unwrap().voted_for, 0);
    }

    #[test]
    fn commit_skips_earlier_term_entries_until_covered() {
        let (_exec, cluster) = harness(3);
        let leader = cluster.get(1);
        {
            let mut state = leader.state.lock().unwrap();
            state.role = Role::Leader;
            state.term = 2;
            state.log = vec![
                system_entry(0, 0),
                user_entry(1, 1, b"inherited"),
                system_entry(2, 2),
            ];
            state.commit_index = 0;
            state.next_index = vec![(2, 3), (3, 3)].into_iter().collect();
            state.match_index = vec![(2, 1), (3, 1)].into_iter().collect();
        }

        // The majority holds index 1, but it belongs to term 1.
        {
            let mut state = leader.state.lock().unwrap();
            leader.advance_commit_index(&mut state);
            assert_eq!(state.commit_index, 0);
        }

        // Once a current-term entry reaches the majority, everything below
        // it commits with it.
        {
            let mut state = leader.state.lock().unwrap();
            state.match_index.insert(2, 2);
            leader.advance_commit_index(&mut state);
            assert_eq!(state.commit_index, 2);
            leader.apply_ready_entries(&mut state);
            assert_eq!(state.applied_index, 2);
            assert_eq!(state.applied.len(), 1);
            assert_eq!(&state.applied[0].payload[..], b"inherited");
        }
    }

    #[test]
    fn stop_and_restart_preserve_durable_state() {
        let (exec, cluster) = harness(3);
        elect(&exec, &cluster, 1);
        let leader = cluster.get(1);
        leader.add_log(Bytes::from_static(b"kept"));
        settle(&exec, &cluster, 4);
        assert_eq!(leader.applied_log().len(), 1);

        leader.stop();
        assert!(leader.is_stopped());
        let log_before = leader.log_entries();
        leader.tick();
        assert_eq!(exec.pending(), 0);

        leader.restart();
        assert!(!leader.is_stopped());
        assert_eq!(leader.term(), 1);
        assert_eq!(leader.log_entries(), log_before);
        assert_eq!(leader.commit_index(), 2);
        assert_eq!(leader.applied_index(), 2);
        assert_eq!(leader.applied_log().len(), 1);
        // Leader progress vectors are volatile and come back empty.
        assert!(leader.state.lock().unwrap().next_index.is_empty());
        assert!(leader.state.lock().unwrap().match_index.is_empty());
    }
}
