//! Coordinator module wiring.
//!
//! `manager` routes inbound events and owns the maps, `proposal` runs one
//! Paxos instance per (transaction, RM), `proposer` drives the transaction
//! lifecycle per role, `sender` is the fire-and-forget retry sender, and
//! `types` holds the wire model and the trait contracts.

mod manager;
mod proposal;
mod proposer;
mod sender;
mod types;

pub use manager::{acceptors_from, CoordinatorStats, ProposerManager};
pub use proposal::ProposalStatusSnapshot;
pub use proposer::{ProposerStatusSnapshot, Role};
pub use sender::OneShotSender;
pub use types::{
    Config, InstanceId, Message, NextTopology, OneATxnVotes, OneBTxnVotes, ProposerStore, Round,
    Sender, Topology, TwoATxnVotes, TwoBFailures, TwoBTxnVotes, VarAcceptance, VarFailure,
    VarPromise, VarPromiseEntry, VarRound, INSTANCE_ID_LEN,
};
