//! Per-variable votes and consensus outcomes.

use serde::{Deserialize, Serialize};

use super::clock::VectorClock;
use super::types::{Action, Allocation, TxnBody, TxnId, VarId};

/// Transactions that read the aborting variable and should be re-examined by
/// the submitter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriptions(pub Vec<TxnId>);

/// Evidence attached to a bad-read abort: the transaction whose write the
/// reader missed, with its actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadReadEvidence {
    pub txn_id: TxnId,
    pub actions: Vec<Action>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    AbortDeadlock,
    AbortBadRead(BadReadEvidence),
}

/// One variable's vote on a transaction, with the clock observed at vote
/// time and, for commits, the variable's subscription set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub var_id: VarId,
    pub vote: Vote,
    pub clock: VectorClock,
    pub subscriptions: Option<Subscriptions>,
}

impl Ballot {
    pub fn commit(var_id: VarId, clock: VectorClock, subscriptions: Option<Subscriptions>) -> Self {
        Self {
            var_id,
            vote: Vote::Commit,
            clock,
            subscriptions,
        }
    }

    pub fn abort_deadlock(var_id: VarId, clock: VectorClock) -> Self {
        Self {
            var_id,
            vote: Vote::AbortDeadlock,
            clock,
            subscriptions: None,
        }
    }

    pub fn abort_bad_read(var_id: VarId, clock: VectorClock, evidence: BadReadEvidence) -> Self {
        Self {
            var_id,
            vote: Vote::AbortBadRead(evidence),
            clock,
            subscriptions: None,
        }
    }

    pub fn is_abort(&self) -> bool {
        !matches!(self.vote, Vote::Commit)
    }
}

/// Consensus outcome for a transaction.
///
/// A commit carries the merged outcome clock; an abort carries the ballots
/// that forced it (bad-read evidence included) for the submitter's retry
/// logic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Commit { clock: VectorClock },
    Abort { ballots: Vec<Ballot> },
}

impl Outcome {
    pub fn is_commit(&self) -> bool {
        matches!(self, Outcome::Commit { .. })
    }
}

/// Build an all-AbortDeadlock ballot list covering `alloc`'s actions.
///
/// Used when an RM must force a transaction down without consulting its
/// variables: topology rejections, recovery after a crash, and submission
/// aborts.
pub fn abort_ballots_for(body: &TxnBody, alloc: &Allocation) -> Vec<Ballot> {
    alloc
        .action_indices
        .iter()
        .filter_map(|idx| body.actions.get(*idx as usize))
        .map(|action| Ballot::abort_deadlock(action.var_id, VectorClock::new()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::types::{var_id, ActionKind, ActionMeta, Positions};
    use super::*;

    fn body_with_actions(vars: &[u8]) -> TxnBody {
        TxnBody {
            id: super::super::types::txn_id(1),
            topology_version: 1,
            f_inc: 1,
            allocations: vec![Allocation {
                rm_id: 1,
                active: 1,
                action_indices: (0..vars.len() as u16).collect(),
            }],
            actions: vars
                .iter()
                .map(|v| Action {
                    var_id: var_id(*v),
                    kind: ActionKind::Create {
                        positions: Positions::new(),
                    },
                    meta: ActionMeta::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn abort_ballots_cover_every_allocated_action() {
        let body = body_with_actions(&[1, 2, 3]);
        let ballots = abort_ballots_for(&body, &body.allocations[0]);
        assert_eq!(ballots.len(), 3);
        assert!(ballots.iter().all(Ballot::is_abort));
        assert_eq!(ballots[1].var_id, var_id(2));
    }

    #[test]
    fn out_of_range_indices_are_skipped() {
        let body = body_with_actions(&[1]);
        let alloc = Allocation {
            rm_id: 1,
            active: 1,
            action_indices: vec![0, 7],
        };
        assert_eq!(abort_ballots_for(&body, &alloc).len(), 1);
    }
}
