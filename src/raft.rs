//! Ordering Core — Raft family.
//!
//! Crash-fault-tolerant leader election and log replication. Unlike the
//! BFT families, Raft tolerates `f = ⌊(n−1)/2⌋` crashed (not malicious)
//! replicas and requires only a plain majority, `⌊n/2⌋+1`.
//!
//! Grounded on the source system's `raft::algorithm::Raft` header: the
//! `Role`/`TermRelation` split, `next_index_`/`match_index_` vectors, and
//! the log-matching consistency check carry over directly. In-flight
//! `AppendEntries` pipelining (`InFlightMsg`, a bounded window of
//! unacknowledged RPCs per follower) is an optimization beyond this
//! core's scope and is not implemented — every follower is driven by one
//! outstanding RPC at a time.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::ReplicaId;
use crate::{raft_quorum, ConsensusError, Result};

/// Minimum randomized election timeout, in milliseconds.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 1200;
/// Maximum randomized election timeout, in milliseconds.
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 2400;
/// Leader heartbeat interval, in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;

/// A replica's role in the Raft term state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaftRole {
    /// Passively replicating the leader's log.
    Follower,
    /// Soliciting votes for the current term.
    Candidate,
    /// Driving `AppendEntries` to every follower.
    Leader,
}

/// How an incoming term compares to this replica's `current_term`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TermRelation {
    /// The incoming term is behind ours; the message is rejected.
    Stale,
    /// The incoming term equals ours.
    Current,
    /// The incoming term is ahead of ours; we step down to `Follower`.
    New,
}

/// One committed-or-proposed log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based log index.
    pub index: u64,
    /// Term the entry was appended in.
    pub term: u64,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

/// `RequestVote` RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_id: ReplicaId,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// `RequestVote` RPC reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Responder's (possibly updated) term.
    pub term: u64,
    /// Whether the vote was granted.
    pub vote_granted: bool,
    /// The responding replica.
    pub voter: ReplicaId,
}

/// `AppendEntries` RPC arguments (also used as the heartbeat when
/// `entries` is empty).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term.
    pub term: u64,
    /// Leader's id, so followers can redirect clients.
    pub leader_id: ReplicaId,
    /// Index of the log entry immediately preceding `entries`.
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// New entries to append (empty for a heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's `commit_index`.
    pub leader_commit: u64,
}

/// `AppendEntries` RPC reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Responder's (possibly updated) term.
    pub term: u64,
    /// Whether the consistency check passed and entries were appended.
    pub success: bool,
    /// The responding replica.
    pub responder: ReplicaId,
    /// The responder's log length after applying this RPC, used by the
    /// leader to fast-advance `next_index` on success.
    pub match_index: u64,
}

/// The Raft engine for one replica.
pub struct RaftEngine {
    self_id: ReplicaId,
    total_nodes: usize,
    role: Mutex<RaftRole>,
    current_term: AtomicU64,
    voted_for: Mutex<Option<ReplicaId>>,
    log: Mutex<Vec<LogEntry>>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    leader_id: Mutex<Option<ReplicaId>>,
    next_index: DashMap<ReplicaId, u64>,
    match_index: DashMap<ReplicaId, u64>,
    votes_received: Mutex<HashSet<ReplicaId>>,
}

impl RaftEngine {
    /// Build a fresh engine, starting as `Follower` at term 0.
    pub fn new(self_id: ReplicaId, total_nodes: usize) -> Self {
        Self {
            self_id,
            total_nodes,
            role: Mutex::new(RaftRole::Follower),
            current_term: AtomicU64::new(0),
            voted_for: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            leader_id: Mutex::new(None),
            next_index: DashMap::new(),
            match_index: DashMap::new(),
            votes_received: Mutex::new(HashSet::new()),
        }
    }

    /// Current role.
    pub fn role(&self) -> RaftRole {
        *self.role.lock()
    }

    /// Current term.
    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    fn majority(&self) -> usize {
        raft_quorum(self.total_nodes)
    }

    fn last_log_index_term(&self) -> (u64, u64) {
        let log = self.log.lock();
        log.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    /// Classify `term` against `current_term`. Any term strictly greater
    /// than ours causes an immediate unconditional step-down to
    /// `Follower` (Raft's "all servers" rule), before returning
    /// [`TermRelation::New`].
    pub fn observe_term(&self, term: u64) -> TermRelation {
        let current = self.current_term();
        if term < current {
            return TermRelation::Stale;
        }
        if term == current {
            return TermRelation::Current;
        }
        self.current_term.store(term, Ordering::Release);
        *self.voted_for.lock() = None;
        *self.role.lock() = RaftRole::Follower;
        self.votes_received.lock().clear();
        TermRelation::New
    }

    /// Begin an election: increment the term, become `Candidate`, vote
    /// for self, and return the `RequestVote` args to broadcast.
    pub fn start_election(&self) -> RequestVoteArgs {
        let term = self.current_term.fetch_add(1, Ordering::AcqRel) + 1;
        *self.role.lock() = RaftRole::Candidate;
        *self.voted_for.lock() = Some(self.self_id);
        let mut votes = self.votes_received.lock();
        votes.clear();
        votes.insert(self.self_id);
        let (last_log_index, last_log_term) = self.last_log_index_term();
        RequestVoteArgs { term, candidate_id: self.self_id, last_log_index, last_log_term }
    }

    /// Handle an incoming `RequestVote`: grant iff the term is at least
    /// current, we have not already voted for someone else this term,
    /// and the candidate's log is at least as up to date as ours.
    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let relation = self.observe_term(args.term);
        if relation == TermRelation::Stale {
            return RequestVoteReply { term: self.current_term(), vote_granted: false, voter: self.self_id };
        }
        let (our_last_index, our_last_term) = self.last_log_index_term();
        let log_up_to_date = args.last_log_term > our_last_term
            || (args.last_log_term == our_last_term && args.last_log_index >= our_last_index);

        let mut voted_for = self.voted_for.lock();
        let can_vote = voted_for.is_none() || *voted_for == Some(args.candidate_id);
        let grant = can_vote && log_up_to_date;
        if grant {
            *voted_for = Some(args.candidate_id);
        }
        RequestVoteReply { term: self.current_term(), vote_granted: grant, voter: self.self_id }
    }

    /// Accumulate a `RequestVote` reply; returns `true` the instant this
    /// reply pushes the candidate over a majority (idempotent past that
    /// point — the role is already `Leader` on subsequent calls).
    pub fn on_vote_reply(&self, reply: RequestVoteReply) -> bool {
        if self.observe_term(reply.term) == TermRelation::New {
            return false; // stepped down to Follower, election abandoned
        }
        if self.role() != RaftRole::Candidate || !reply.vote_granted {
            return false;
        }
        let became_leader = {
            let mut votes = self.votes_received.lock();
            votes.insert(reply.voter);
            votes.len() >= self.majority() && self.role() == RaftRole::Candidate
        };
        if became_leader {
            self.become_leader();
        }
        became_leader
    }

    fn become_leader(&self) {
        *self.role.lock() = RaftRole::Leader;
        *self.leader_id.lock() = Some(self.self_id);
        let next = self.log.lock().len() as u64 + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in 1..=self.total_nodes as ReplicaId {
            if peer == self.self_id {
                continue;
            }
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
    }

    /// Append a new entry to the leader's log (leader-only).
    pub fn append_entry(&self, payload: Vec<u8>) -> Result<u64> {
        if self.role() != RaftRole::Leader {
            return Err(ConsensusError::ProtocolViolation("append_entry called on a non-leader replica".to_string()));
        }
        let mut log = self.log.lock();
        let index = log.len() as u64 + 1;
        log.push(LogEntry { index, term: self.current_term(), payload });
        Ok(index)
    }

    /// Build the `AppendEntries` args to send to `peer`, based on its
    /// tracked `next_index`.
    pub fn make_append_entries(&self, peer: ReplicaId) -> AppendEntriesArgs {
        let next = self.next_index.get(&peer).map(|v| *v).unwrap_or(1);
        let log = self.log.lock();
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 { 0 } else { log.get((prev_log_index - 1) as usize).map(|e| e.term).unwrap_or(0) };
        let entries = log.iter().filter(|e| e.index >= next).cloned().collect();
        AppendEntriesArgs {
            term: self.current_term(),
            leader_id: self.self_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index.load(Ordering::Acquire),
        }
    }

    /// Handle an incoming `AppendEntries`: the log matching property
    /// check (does `prev_log_index`/`prev_log_term` agree with our log?)
    /// gates whether entries are accepted; conflicting suffixes are
    /// truncated before appending.
    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let relation = self.observe_term(args.term);
        if relation == TermRelation::Stale {
            return AppendEntriesReply { term: self.current_term(), success: false, responder: self.self_id, match_index: 0 };
        }
        // A valid leader in our term demotes a lingering Candidate.
        if self.role() == RaftRole::Candidate {
            *self.role.lock() = RaftRole::Follower;
        }
        *self.leader_id.lock() = Some(args.leader_id);

        let mut log = self.log.lock();
        if args.prev_log_index > 0 {
            let matches = log
                .get((args.prev_log_index - 1) as usize)
                .map(|e| e.term == args.prev_log_term)
                .unwrap_or(false);
            if !matches {
                return AppendEntriesReply {
                    term: self.current_term(),
                    success: false,
                    responder: self.self_id,
                    match_index: log.len() as u64,
                };
            }
        }
        log.truncate(args.prev_log_index as usize);
        log.extend(args.entries.iter().cloned());
        let new_len = log.len() as u64;
        drop(log);

        if args.leader_commit > self.commit_index.load(Ordering::Acquire) {
            self.commit_index.store(args.leader_commit.min(new_len), Ordering::Release);
        }
        AppendEntriesReply { term: self.current_term(), success: true, responder: self.self_id, match_index: new_len }
    }

    /// Leader-side: process an `AppendEntries` reply, advancing
    /// `next_index`/`match_index` on success (or backing off
    /// `next_index` by one on failure), then advance `commit_index` if a
    /// majority now match an entry from the *current* term (Raft's
    /// safety rule: a leader never commits an entry from a prior term by
    /// counting replicas alone).
    pub fn on_append_entries_reply(&self, peer: ReplicaId, reply: &AppendEntriesReply) {
        if self.observe_term(reply.term) == TermRelation::New {
            return;
        }
        if self.role() != RaftRole::Leader {
            return;
        }
        if reply.success {
            self.match_index.insert(peer, reply.match_index);
            self.next_index.insert(peer, reply.match_index + 1);
            self.try_advance_commit_index();
        } else {
            let mut next = self.next_index.entry(peer).or_insert(1);
            *next = next.saturating_sub(1).max(1);
        }
    }

    fn try_advance_commit_index(&self) {
        let log = self.log.lock();
        let current_term = self.current_term();
        let mut candidate = self.commit_index.load(Ordering::Acquire);
        for n in (candidate + 1..=log.len() as u64).rev() {
            let entry_term = log[(n - 1) as usize].term;
            if entry_term != current_term {
                continue; // never commit a prior-term entry by count alone
            }
            let mut agreeing = 1; // the leader itself
            for entry in self.match_index.iter() {
                if *entry.value() >= n {
                    agreeing += 1;
                }
            }
            if agreeing >= self.majority() {
                candidate = n;
                break;
            }
        }
        if candidate > self.commit_index.load(Ordering::Acquire) {
            self.commit_index.store(candidate, Ordering::Release);
        }
    }

    /// Apply committed-but-not-yet-applied entries, returning them in
    /// order for the caller to hand to the executor.
    pub fn take_newly_committed(&self) -> Vec<LogEntry> {
        let log = self.log.lock();
        let commit = self.commit_index.load(Ordering::Acquire);
        let applied = self.last_applied.load(Ordering::Acquire);
        if commit <= applied {
            return Vec::new();
        }
        let entries: Vec<LogEntry> = log[(applied as usize)..(commit as usize)].to_vec();
        self.last_applied.store(commit, Ordering::Release);
        entries
    }

    /// The currently known leader, if any.
    pub fn leader_id(&self) -> Option<ReplicaId> {
        *self.leader_id.lock()
    }

    /// Current commit index.
    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }
}
