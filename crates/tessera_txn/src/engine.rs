//! Engine module wiring.
//!
//! `types` defines the identifier and transaction body model, `clock` and
//! `ballot` the consensus value types, `txn` the transaction state machine,
//! and `var` the variable dispatcher plus the storage-facing contracts.

mod ballot;
mod clock;
mod txn;
mod types;
mod var;

pub use ballot::{abort_ballots_for, BadReadEvidence, Ballot, Outcome, Subscriptions, Vote};
pub use clock::VectorClock;
pub use txn::{ActionRef, Txn, TxnLocalStateChange, TxnStatusSnapshot};
pub use types::{
    Action, ActionKind, ActionMeta, Allocation, BootCount, Modify, Positions, RMId, TxnBody,
    TxnId, VarCap, VarId, TXN_ID_LEN, VAR_ID_LEN,
};
pub use var::{Frame, Var, VarDispatcher, VarFactory};
