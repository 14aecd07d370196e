//! Wire model, topology snapshots and the coordinator's trait seams.
//!
//! The framed envelope encoding is supplied by the transport; these types
//! are the schema. Every constructor sets the message variant exactly once
//! and copies the transaction id bytewise.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use tessera_txn::engine::{
    Ballot, BootCount, Outcome, RMId, TxnBody, TxnId, VarId, TXN_ID_LEN,
};

/// Length of a Paxos instance key: transaction id followed by the proposing
/// RM id, big-endian.
pub const INSTANCE_ID_LEN: usize = TXN_ID_LEN + 4;

/// Key of one Paxos instance: `TxnId ∥ big-endian(RM id)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId([u8; INSTANCE_ID_LEN]);

impl InstanceId {
    pub fn new(txn_id: TxnId, rm_id: RMId) -> Self {
        let mut bytes = [0u8; INSTANCE_ID_LEN];
        bytes[..TXN_ID_LEN].copy_from_slice(txn_id.as_bytes());
        bytes[TXN_ID_LEN..].copy_from_slice(&rm_id.to_be_bytes());
        Self(bytes)
    }

    pub fn txn_id(&self) -> TxnId {
        let mut bytes = [0u8; TXN_ID_LEN];
        bytes.copy_from_slice(&self.0[..TXN_ID_LEN]);
        TxnId::from_bytes(bytes)
    }

    pub fn rm_id(&self) -> RMId {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[TXN_ID_LEN..]);
        RMId::from_be_bytes(bytes)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({:?}, rm {})", self.txn_id(), self.rm_id())
    }
}

/// Per-variable Paxos round number, ordered by (counter, rm).
///
/// The instance owner proposes at the zero round without a prepare phase;
/// every other proposer starts at counter one so owner values win ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Round {
    pub counter: u32,
    pub rm_id: RMId,
}

impl Round {
    pub const fn zero(rm_id: RMId) -> Self {
        Self { counter: 0, rm_id }
    }

    pub const fn initial(rm_id: RMId) -> Self {
        Self { counter: 1, rm_id }
    }

    /// The lowest round owned by `rm_id` that beats `promised`.
    pub fn above(promised: Round, rm_id: RMId) -> Self {
        Self {
            counter: promised.counter + 1,
            rm_id,
        }
    }
}

impl Ord for Round {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.counter, self.rm_id).cmp(&(other.counter, other.rm_id))
    }
}

impl PartialOrd for Round {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Immutable topology snapshot published by the membership layer.
///
/// Two successive topologies form a barrier: an RM must not vote on a
/// transaction whose topology version is neither the current nor the next
/// version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub version: u32,
    pub next: Option<NextTopology>,
    pub rms_removed: HashSet<RMId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTopology {
    pub version: u32,
}

impl Topology {
    pub fn accepts_version(&self, version: u32) -> bool {
        match &self.next {
            None => self.version == version,
            Some(next) => self.version == version || next.version == version,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRound {
    pub var_id: VarId,
    pub round: Round,
}

/// Phase 1 request: prepare the listed variables of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneATxnVotes {
    /// Whose instance this is (not necessarily the sender).
    pub rm_id: RMId,
    pub proposals: Vec<VarRound>,
}

/// An acceptor's phase 1 answer for one variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarPromise {
    /// Promised the requested round; nothing accepted yet.
    FreeChoice { round: Round },
    /// Promised the requested round; an earlier value was accepted at
    /// `round`.
    Accepted { round: Round, ballot: Ballot },
    /// The acceptor already promised a higher round.
    RoundTooLow { promised: Round },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarPromiseEntry {
    pub var_id: VarId,
    pub promise: VarPromise,
}

/// Phase 1 response for one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneBTxnVotes {
    pub rm_id: RMId,
    pub promises: Vec<VarPromiseEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarAcceptance {
    pub var_id: VarId,
    pub round: Round,
    pub ballot: Ballot,
}

/// Phase 2 request: accept the listed ballots for one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoATxnVotes {
    pub rm_id: RMId,
    pub acceptances: Vec<VarAcceptance>,
}

/// Per-variable phase 2 rejections for one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarFailure {
    pub var_id: VarId,
    pub promised: Round,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoBFailures {
    pub rm_id: RMId,
    pub failures: Vec<VarFailure>,
}

/// Phase 2 response: either the consensus outcome computed by the acceptor,
/// or per-variable rejections for one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoBTxnVotes {
    Outcome { outcome: Outcome },
    Failures(TwoBFailures),
}

/// Schema of the framed coordination envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    TxnSubmission { txn: TxnBody },
    TxnSubmissionComplete { txn_id: TxnId },
    TxnSubmissionAbort { txn_id: TxnId },
    OneATxnVotes { txn_id: TxnId, votes: OneATxnVotes },
    OneBTxnVotes { txn_id: TxnId, votes: OneBTxnVotes },
    TwoATxnVotes { txn_id: TxnId, txn: TxnBody, votes: TwoATxnVotes },
    TwoBTxnVotes { txn_id: TxnId, txn: TxnBody, votes: TwoBTxnVotes },
    TxnLocallyComplete { txn_id: TxnId },
    TxnGloballyComplete { txn_id: TxnId },
}

impl Message {
    pub fn txn_locally_complete(txn_id: TxnId) -> Self {
        Message::TxnLocallyComplete { txn_id }
    }

    pub fn txn_globally_complete(txn_id: TxnId) -> Self {
        Message::TxnGloballyComplete { txn_id }
    }

    pub fn txn_submission_complete(txn_id: TxnId) -> Self {
        Message::TxnSubmissionComplete { txn_id }
    }

    pub fn txn_submission_abort(txn_id: TxnId) -> Self {
        Message::TxnSubmissionAbort { txn_id }
    }

    pub fn txn_id(&self) -> TxnId {
        match self {
            Message::TxnSubmission { txn } => txn.id,
            Message::TxnSubmissionComplete { txn_id }
            | Message::TxnSubmissionAbort { txn_id }
            | Message::OneATxnVotes { txn_id, .. }
            | Message::OneBTxnVotes { txn_id, .. }
            | Message::TwoATxnVotes { txn_id, .. }
            | Message::TwoBTxnVotes { txn_id, .. }
            | Message::TxnLocallyComplete { txn_id }
            | Message::TxnGloballyComplete { txn_id } => *txn_id,
        }
    }
}

/// Outbound fire-and-forget message transport.
///
/// The coordination engine is transport-agnostic; concrete implementations
/// can use RPC pipelines, in-memory channels, or test harnesses. Delivery
/// retries for protocol traffic are the transport's concern.
pub trait Sender: Send + Sync {
    fn send(&self, to: RMId, msg: Message) -> anyhow::Result<()>;
}

/// Durable store for proposer snapshots, keyed by transaction id.
///
/// Implementations persist opaque snapshot payloads and return them on
/// startup for replay. A payload that fails to decode on reload must abort
/// startup: serving with missing proposers loses locally-complete
/// acknowledgements.
pub trait ProposerStore: Send + Sync {
    fn save(&self, txn_id: TxnId, data: Vec<u8>) -> anyhow::Result<()>;
    fn remove(&self, txn_id: TxnId) -> anyhow::Result<()>;
    fn load_all(&self) -> anyhow::Result<Vec<(TxnId, Vec<u8>)>>;
}

/// Identity of this replica.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub rm_id: RMId,
    pub boot_count: BootCount,
}
