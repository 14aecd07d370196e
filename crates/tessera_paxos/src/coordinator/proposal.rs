//! One Paxos instance for one (transaction, proposing RM) pair.
//!
//! Each variable of the instance's allocation is its own sub-instance with
//! its own value and round. The instance owner proposes at the zero round
//! without a prepare phase; recovery proposals run the full two-phase
//! algorithm. Acceptors compute the transaction outcome themselves, so
//! phase 2 only ever answers with failures; success is observed by the
//! proposer as a 2B outcome.

use std::collections::{BTreeMap, HashMap, HashSet};

use tessera_txn::engine::{Ballot, RMId, TxnBody, TxnId, VarId};

use super::types::{
    Message, OneATxnVotes, OneBTxnVotes, Round, Sender, TwoATxnVotes, TwoBFailures, VarAcceptance,
    VarPromise, VarRound,
};

enum VarPhase {
    /// Gathering promises for the current round.
    One {
        promises: HashMap<RMId, Option<(Round, Ballot)>>,
    },
    /// Value sent for acceptance.
    Two,
}

struct VarInstance {
    round: Round,
    ballot: Ballot,
    phase: VarPhase,
}

/// Point-in-time view of a Paxos instance.
#[derive(Clone, Debug)]
pub struct ProposalStatusSnapshot {
    pub txn_id: TxnId,
    pub instance_rm: RMId,
    pub vars: usize,
    pub finished: bool,
}

pub(super) struct Proposal {
    txn: TxnBody,
    instance_rm: RMId,
    proposer_rm: RMId,
    f_inc: u32,
    acceptors: Vec<RMId>,
    skip_phase1: bool,
    vars: BTreeMap<VarId, VarInstance>,
    abort_instances: HashSet<RMId>,
    finished: bool,
}

impl Proposal {
    pub(super) fn new(
        txn: TxnBody,
        f_inc: u32,
        ballots: Vec<Ballot>,
        instance_rm: RMId,
        acceptors: Vec<RMId>,
        skip_phase1: bool,
        proposer_rm: RMId,
    ) -> Self {
        let mut proposal = Self {
            txn,
            instance_rm,
            proposer_rm,
            f_inc,
            acceptors,
            skip_phase1,
            vars: BTreeMap::new(),
            abort_instances: HashSet::new(),
            finished: false,
        };
        for ballot in ballots {
            proposal.insert_var(ballot);
        }
        proposal
    }

    fn insert_var(&mut self, ballot: Ballot) {
        let (round, phase) = if self.skip_phase1 {
            (Round::zero(self.proposer_rm), VarPhase::Two)
        } else {
            (
                Round::initial(self.proposer_rm),
                VarPhase::One {
                    promises: HashMap::new(),
                },
            )
        };
        self.vars.insert(
            ballot.var_id,
            VarInstance {
                round,
                ballot,
                phase,
            },
        );
    }

    fn quorum(&self) -> usize {
        self.f_inc as usize
    }

    /// Record that this instance caused an abort instance to be opened on
    /// behalf of `rm_id`, so `finish_proposing` can hand it back for
    /// garbage collection.
    pub(super) fn note_abort_instance(&mut self, rm_id: RMId) {
        self.abort_instances.insert(rm_id);
    }

    /// Begin the instance: phase 2 immediately when the value is known to
    /// be safe, phase 1 otherwise.
    pub(super) fn start(&mut self, sender: &dyn Sender) {
        let all: Vec<VarId> = self.vars.keys().copied().collect();
        if self.skip_phase1 {
            self.send_two_a(sender, &all);
        } else {
            self.send_one_a(sender, &all);
        }
    }

    /// Merge additional per-variable ballots into the in-flight instance.
    ///
    /// New variables join at the instance's current mode. For variables
    /// still in phase 1, an abort ballot replaces a commit value: the local
    /// decision has hardened and proposing the stale commit would only be
    /// overturned later.
    pub(super) fn add_ballots(&mut self, ballots: Vec<Ballot>, sender: &dyn Sender) {
        if self.finished {
            return;
        }
        let mut added = Vec::new();
        for ballot in ballots {
            match self.vars.get_mut(&ballot.var_id) {
                None => {
                    added.push(ballot.var_id);
                    self.insert_var(ballot);
                }
                Some(var) => {
                    if matches!(var.phase, VarPhase::One { .. })
                        && ballot.is_abort()
                        && !var.ballot.is_abort()
                    {
                        var.ballot = ballot;
                    }
                }
            }
        }
        if added.is_empty() {
            return;
        }
        if self.skip_phase1 {
            self.send_two_a(sender, &added);
        } else {
            self.send_one_a(sender, &added);
        }
    }

    /// Advance phase 1 bookkeeping with one acceptor's promises.
    pub(super) fn one_b_received(&mut self, from: RMId, votes: OneBTxnVotes, sender: &dyn Sender) {
        if self.finished {
            return;
        }
        debug_assert_eq!(votes.rm_id, self.instance_rm);
        let mut retry = Vec::new();
        for entry in votes.promises {
            let Some(var) = self.vars.get_mut(&entry.var_id) else {
                continue;
            };
            match entry.promise {
                VarPromise::RoundTooLow { promised } => {
                    if promised >= var.round {
                        var.round = Round::above(promised, self.proposer_rm);
                        var.phase = VarPhase::One {
                            promises: HashMap::new(),
                        };
                        retry.push(entry.var_id);
                    }
                }
                VarPromise::FreeChoice { round } => {
                    if let VarPhase::One { promises } = &mut var.phase {
                        if round == var.round {
                            promises.insert(from, None);
                        }
                    }
                }
                VarPromise::Accepted { round, ballot } => {
                    if let VarPhase::One { promises } = &mut var.phase {
                        promises.insert(from, Some((round, ballot)));
                    }
                }
            }
        }
        self.advance_ready(sender);
        if !retry.is_empty() {
            tracing::debug!(txn = ?self.txn.id, instance = self.instance_rm, vars = retry.len(), "phase 1 superseded, escalating round");
            self.send_one_a(sender, &retry);
        }
    }

    /// Phase 2 rejections: escalate the round and return to phase 1.
    pub(super) fn two_b_failures_received(
        &mut self,
        _from: RMId,
        failures: TwoBFailures,
        sender: &dyn Sender,
    ) {
        if self.finished {
            return;
        }
        debug_assert_eq!(failures.rm_id, self.instance_rm);
        let mut retry = Vec::new();
        for failure in failures.failures {
            let Some(var) = self.vars.get_mut(&failure.var_id) else {
                continue;
            };
            if failure.promised >= var.round {
                var.round = Round::above(failure.promised, self.proposer_rm);
                var.phase = VarPhase::One {
                    promises: HashMap::new(),
                };
                retry.push(failure.var_id);
            }
        }
        if !retry.is_empty() {
            tracing::debug!(txn = ?self.txn.id, instance = self.instance_rm, vars = retry.len(), "phase 2 superseded, escalating round");
            self.send_one_a(sender, &retry);
        }
    }

    // Move every variable with a promise quorum into phase 2, adopting the
    // highest accepted value where one exists.
    fn advance_ready(&mut self, sender: &dyn Sender) {
        let quorum = self.quorum();
        let mut ready = Vec::new();
        for (var_id, var) in self.vars.iter_mut() {
            let VarPhase::One { promises } = &var.phase else {
                continue;
            };
            if promises.len() < quorum {
                continue;
            }
            if let Some((_, ballot)) = promises
                .values()
                .flatten()
                .max_by_key(|(round, _)| *round)
            {
                var.ballot = ballot.clone();
            }
            var.phase = VarPhase::Two;
            ready.push(*var_id);
        }
        if !ready.is_empty() {
            self.send_two_a(sender, &ready);
        }
    }

    /// Stop the instance. Returns the RM ids whose abort instances this one
    /// opened, so the caller can reap them too.
    pub(super) fn finish_proposing(&mut self) -> Vec<RMId> {
        self.finished = true;
        self.abort_instances.drain().collect()
    }

    pub(super) fn status(&self) -> ProposalStatusSnapshot {
        ProposalStatusSnapshot {
            txn_id: self.txn.id,
            instance_rm: self.instance_rm,
            vars: self.vars.len(),
            finished: self.finished,
        }
    }

    fn send_one_a(&self, sender: &dyn Sender, vars: &[VarId]) {
        let proposals = vars
            .iter()
            .filter_map(|v| self.vars.get(v).map(|var| VarRound {
                var_id: *v,
                round: var.round,
            }))
            .collect();
        let msg = Message::OneATxnVotes {
            txn_id: self.txn.id,
            votes: OneATxnVotes {
                rm_id: self.instance_rm,
                proposals,
            },
        };
        self.send_to_acceptors(sender, msg);
    }

    fn send_two_a(&self, sender: &dyn Sender, vars: &[VarId]) {
        let acceptances = vars
            .iter()
            .filter_map(|v| self.vars.get(v).map(|var| VarAcceptance {
                var_id: *v,
                round: var.round,
                ballot: var.ballot.clone(),
            }))
            .collect();
        let msg = Message::TwoATxnVotes {
            txn_id: self.txn.id,
            txn: self.txn.clone(),
            votes: TwoATxnVotes {
                rm_id: self.instance_rm,
                acceptances,
            },
        };
        self.send_to_acceptors(sender, msg);
    }

    fn send_to_acceptors(&self, sender: &dyn Sender, msg: Message) {
        for acceptor in &self.acceptors {
            if let Err(err) = sender.send(*acceptor, msg.clone()) {
                tracing::warn!(error = ?err, acceptor, "failed to send to acceptor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::VarPromiseEntry;
    use super::*;
    use std::sync::Mutex;
    use tessera_txn::engine::{
        Action, ActionKind, ActionMeta, Allocation, Positions, VectorClock, TXN_ID_LEN, VAR_ID_LEN,
    };

    #[derive(Default)]
    struct RecSender {
        sent: Mutex<Vec<(RMId, Message)>>,
    }

    impl Sender for RecSender {
        fn send(&self, to: RMId, msg: Message) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((to, msg));
            Ok(())
        }
    }

    impl RecSender {
        fn take(&self) -> Vec<(RMId, Message)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    fn vid(n: u8) -> VarId {
        VarId([n; VAR_ID_LEN])
    }

    fn body() -> TxnBody {
        TxnBody {
            id: TxnId([1; TXN_ID_LEN]),
            topology_version: 1,
            f_inc: 2,
            allocations: vec![Allocation {
                rm_id: 1,
                active: 1,
                action_indices: vec![0],
            }],
            actions: vec![Action {
                var_id: vid(1),
                kind: ActionKind::Create {
                    positions: Positions::new(),
                },
                meta: ActionMeta::default(),
            }],
        }
    }

    fn abort(var: u8) -> Ballot {
        Ballot::abort_deadlock(vid(var), VectorClock::new())
    }

    fn promise_entry(var: u8, promise: VarPromise) -> OneBTxnVotes {
        OneBTxnVotes {
            rm_id: 1,
            promises: vec![VarPromiseEntry {
                var_id: vid(var),
                promise,
            }],
        }
    }

    #[test]
    fn skipping_phase_one_sends_acceptances_immediately() {
        let sender = RecSender::default();
        let mut proposal = Proposal::new(body(), 2, vec![abort(1)], 1, vec![1, 2, 3], true, 1);
        proposal.start(&sender);
        let sent = sender.take();
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, Message::TwoATxnVotes { .. })));
    }

    #[test]
    fn promise_quorum_moves_to_phase_two_adopting_highest_accepted() {
        let sender = RecSender::default();
        let mut proposal = Proposal::new(body(), 2, vec![abort(1)], 1, vec![1, 2, 3], false, 4);
        proposal.start(&sender);
        sender.take();

        let accepted = Ballot::commit(vid(1), VectorClock::new(), None);
        proposal.one_b_received(
            1,
            promise_entry(
                1,
                VarPromise::FreeChoice {
                    round: Round::initial(4),
                },
            ),
            &sender,
        );
        assert!(sender.take().is_empty());
        proposal.one_b_received(
            2,
            promise_entry(
                1,
                VarPromise::Accepted {
                    round: Round::zero(1),
                    ballot: accepted.clone(),
                },
            ),
            &sender,
        );
        let sent = sender.take();
        assert_eq!(sent.len(), 3);
        for (_, msg) in sent {
            let Message::TwoATxnVotes { votes, .. } = msg else {
                panic!("expected 2A, got {msg:?}");
            };
            assert_eq!(votes.acceptances.len(), 1);
            assert_eq!(votes.acceptances[0].ballot, accepted);
        }
    }

    #[test]
    fn superseded_promise_escalates_the_round() {
        let sender = RecSender::default();
        let mut proposal = Proposal::new(body(), 2, vec![abort(1)], 1, vec![1, 2, 3], false, 4);
        proposal.start(&sender);
        sender.take();

        let promised = Round {
            counter: 6,
            rm_id: 2,
        };
        proposal.one_b_received(3, promise_entry(1, VarPromise::RoundTooLow { promised }), &sender);
        let sent = sender.take();
        assert_eq!(sent.len(), 3);
        let Message::OneATxnVotes { votes, .. } = &sent[0].1 else {
            panic!("expected 1A");
        };
        assert_eq!(votes.proposals[0].round, Round { counter: 7, rm_id: 4 });
    }

    #[test]
    fn phase_two_failure_returns_to_phase_one_with_higher_round() {
        let sender = RecSender::default();
        let mut proposal = Proposal::new(body(), 2, vec![abort(1)], 1, vec![1, 2, 3], true, 1);
        proposal.start(&sender);
        sender.take();

        proposal.two_b_failures_received(
            2,
            TwoBFailures {
                rm_id: 1,
                failures: vec![super::super::types::VarFailure {
                    var_id: vid(1),
                    promised: Round {
                        counter: 2,
                        rm_id: 3,
                    },
                }],
            },
            &sender,
        );
        let sent = sender.take();
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, Message::OneATxnVotes { .. })));
        let Message::OneATxnVotes { votes, .. } = &sent[0].1 else {
            panic!("expected 1A");
        };
        assert_eq!(votes.proposals[0].round, Round { counter: 3, rm_id: 1 });
    }

    #[test]
    fn finish_proposing_hands_back_opened_abort_instances() {
        let sender = RecSender::default();
        let mut proposal = Proposal::new(body(), 2, vec![abort(1)], 1, vec![1, 2, 3], false, 1);
        proposal.note_abort_instance(2);
        proposal.note_abort_instance(3);
        let mut reaped = proposal.finish_proposing();
        reaped.sort_unstable();
        assert_eq!(reaped, vec![2, 3]);
        // Finished instances ignore further traffic.
        proposal.one_b_received(
            1,
            promise_entry(
                1,
                VarPromise::FreeChoice {
                    round: Round::initial(1),
                },
            ),
            &sender,
        );
        assert!(sender.take().is_empty());
    }
}
