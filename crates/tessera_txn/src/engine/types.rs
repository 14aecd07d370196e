//! Shared identifier and transaction body types.
//!
//! These are kept in a small, dependency-light module because they are used
//! by both the transaction engine and the coordination layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::clock::VectorClock;

/// Length in bytes of a transaction identifier.
pub const TXN_ID_LEN: usize = 16;
/// Length in bytes of a variable identifier.
pub const VAR_ID_LEN: usize = 16;

/// Logical identifier for a resource manager (replica).
pub type RMId = u32;

/// Epoch incremented on each process start of an RM. Messages referencing a
/// prior boot count are stale and must not be voted on.
pub type BootCount = u32;

/// Replica placement vector for a variable, opaque to the engine.
pub type Positions = Vec<u8>;

/// Fixed-length opaque transaction identifier, totally ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub [u8; TXN_ID_LEN]);

impl TxnId {
    pub const fn from_bytes(bytes: [u8; TXN_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TXN_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Fixed-length opaque identifier of a logical variable in the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub [u8; VAR_ID_LEN]);

impl VarId {
    pub const fn from_bytes(bytes: [u8; VAR_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VAR_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarId(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Per-RM binding inside a transaction.
///
/// `active` is the boot count the transaction was addressed to: zero marks a
/// passive learner, anything else a voter. `action_indices` index into the
/// transaction's actions array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub rm_id: RMId,
    pub active: BootCount,
    pub action_indices: Vec<u16>,
}

/// How an action touches an existing variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modify {
    Not,
    Write,
    Roll,
}

/// Value part of an action: either creating the variable or operating on an
/// existing one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Create { positions: Positions },
    Existing { read: Option<TxnId>, modify: Modify },
}

/// Subscription metadata carried alongside an action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMeta {
    pub add_sub: bool,
    pub del_sub: Option<TxnId>,
}

/// Atomic unit of a transaction against one variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub var_id: VarId,
    pub kind: ActionKind,
    pub meta: ActionMeta,
}

impl Action {
    /// Writes include creation, plain writes, rolls, and any subscription
    /// change.
    pub fn is_write(&self) -> bool {
        let value_write = match &self.kind {
            ActionKind::Create { .. } => true,
            ActionKind::Existing { modify, .. } => *modify != Modify::Not,
        };
        value_write || self.meta.add_sub || self.meta.del_sub.is_some()
    }
}

/// The transaction body as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnBody {
    pub id: TxnId,
    pub topology_version: u32,
    /// One more than the failure tolerance; the acceptor set holds
    /// `2 * f_inc - 1` entries.
    pub f_inc: u32,
    pub allocations: Vec<Allocation>,
    pub actions: Vec<Action>,
}

impl TxnBody {
    pub fn allocation_for(&self, rm_id: RMId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.rm_id == rm_id)
    }
}

/// Snapshot of a variable handed over when topology reassigns it to a
/// different RM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarCap {
    pub id: VarId,
    pub positions: Positions,
    pub write_txn_id: TxnId,
    pub write_txn_clock: VectorClock,
    pub writes_clock: VectorClock,
}

#[cfg(test)]
pub(crate) fn txn_id(n: u8) -> TxnId {
    TxnId([n; TXN_ID_LEN])
}

#[cfg(test)]
pub(crate) fn var_id(n: u8) -> VarId {
    VarId([n; VAR_ID_LEN])
}
