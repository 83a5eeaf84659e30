use crate::replica::ReplicaID;
use bytes::Bytes;

// Entry is a single record in the replicated log. The index is the entry's
// position in the log (logs are dense, so position and index always agree),
// and the term is the election epoch in which the entry was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub index: usize,
    pub term: usize,
    pub kind: EntryKind,
    pub payload: Bytes,
}

// Who put the entry in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    // Entry appended on behalf of a user through add_log. These are the
    // entries surfaced by applied_log once committed.
    User,
    // Entry inserted by the protocol itself, such as the start marker and
    // the no-op a fresh leader appends. Never surfaced to consumers.
    System,
}

impl Entry {
    pub fn is_user(&self) -> bool {
        self.kind == EntryKind::User
    }
}

// VoteRequest is sent by candidates to solicit votes for themselves.
#[derive(Clone, Debug)]
pub struct VoteRequest {
    pub term: usize,
    pub from_id: ReplicaID,
    pub last_log_index: usize,
    pub last_log_term: usize,
}

// VoteResponse answers a VoteRequest. It intentionally carries no sender id;
// candidates only tally grants.
#[derive(Clone, Copy, Debug)]
pub struct VoteResponse {
    pub term: usize,
    pub vote_granted: bool,
}

// AppendEntryRequest is sent by leaders to replicate their log tail. With no
// entries it doubles as a heartbeat, which followers do not acknowledge.
#[derive(Clone, Debug)]
pub struct AppendEntryRequest {
    pub term: usize,
    pub from_id: ReplicaID,
    pub prev_log_index: usize,
    pub prev_log_term: usize,
    pub commit_index: usize,
    pub entries: Vec<Entry>,
}

// AppendEntryResponse answers a non-empty AppendEntryRequest (or any request
// carrying a stale term). commit_index reports the follower's own commit
// progress so a rejected leader can resend from a safe point.
#[derive(Clone, Copy, Debug)]
pub struct AppendEntryResponse {
    pub from_id: ReplicaID,
    pub term: usize,
    pub entry_count: usize,
    pub success: bool,
    pub commit_index: usize,
}
