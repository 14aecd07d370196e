//! Per-transaction proposer/learner.
//!
//! An ActiveVoter owns a live voting transaction and pushes its ballots
//! into Paxos; an ActiveLearner has local actions but must not vote (it
//! exists to collect the 2Bs after recovery or a topology rejection); a
//! PassiveLearner has no vote and only records the outcome for its local
//! variables. Whatever the role, the proposer accumulates 2B outcomes,
//! fans TxnLocallyComplete out to the acceptors, collects
//! TxnGloballyComplete from them, and reports TxnFinished to the manager
//! when both the transaction and the acceptor set are done.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tessera_dispatch::executor::Executor;
use tessera_txn::engine::{
    abort_ballots_for, Ballot, Outcome, RMId, Txn, TxnBody, TxnId, TxnLocalStateChange,
    TxnStatusSnapshot, VarDispatcher,
};

use super::manager::PaxosCtx;
use super::types::{Message, Sender, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    ActiveVoter,
    ActiveLearner,
    PassiveLearner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitBallots,
    AwaitOutcome,
    AwaitLocallyComplete,
    AwaitGloballyComplete,
    Finished,
}

/// What a proposer writes to the store once the transaction is locally
/// complete: enough to resume the TLC/TGC exchange after a crash.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ProposerSnapshot {
    pub role: Role,
    pub acceptors: Vec<RMId>,
    pub pending_tgc: Vec<RMId>,
    pub outcome: Outcome,
}

const SNAPSHOT_VERSION: u16 = 1;

pub(super) fn encode_snapshot(snapshot: &ProposerSnapshot) -> Vec<u8> {
    let payload = serde_json::to_vec(snapshot).expect("proposer snapshot serializes");
    let mut data = Vec::with_capacity(2 + payload.len());
    data.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    data.extend_from_slice(&payload);
    data
}

pub(super) fn decode_snapshot(data: &[u8]) -> anyhow::Result<ProposerSnapshot> {
    anyhow::ensure!(data.len() >= 2, "proposer snapshot truncated");
    let version = u16::from_be_bytes([data[0], data[1]]);
    anyhow::ensure!(
        version == SNAPSHOT_VERSION,
        "unknown proposer snapshot version {version}"
    );
    Ok(serde_json::from_slice(&data[2..])?)
}

/// Collaborators a proposer needs to start its transaction.
pub(super) struct ProposerEnv {
    pub exe: Executor,
    pub dispatcher: VarDispatcher,
    pub state_change: Arc<dyn TxnLocalStateChange>,
}

/// Point-in-time view of a proposer.
#[derive(Clone, Debug)]
pub struct ProposerStatusSnapshot {
    pub txn_id: TxnId,
    pub role: Role,
    pub state: &'static str,
    pub outcome_known: bool,
    pub pending_tgc: usize,
    pub txn: Option<TxnStatusSnapshot>,
}

pub(super) struct Proposer {
    role: Role,
    state: State,
    txn_id: TxnId,
    body: Option<TxnBody>,
    acceptors: Vec<RMId>,
    txn: Option<Arc<Txn>>,
    outcome: Option<Outcome>,
    /// Acceptors that have reported the outcome; TLCs go to these.
    outcome_reported: HashSet<RMId>,
    /// Acceptors we still owe a TGC from before the proposer may die.
    pending_tgc: HashSet<RMId>,
    /// The transaction is past its voting stages and can accept an
    /// outcome. True from the start for learners.
    ballots_done: bool,
    txn_terminal: bool,
    tlc_sent: bool,
}

impl Proposer {
    pub(super) fn new(
        role: Role,
        body: TxnBody,
        topology: Option<Topology>,
        acceptors: Vec<RMId>,
    ) -> Self {
        let mut pending_tgc: HashSet<RMId> = acceptors.iter().copied().collect();
        if let Some(topology) = &topology {
            for removed in &topology.rms_removed {
                pending_tgc.remove(removed);
            }
        }
        Self {
            role,
            state: if role == Role::ActiveVoter {
                State::AwaitBallots
            } else {
                State::AwaitOutcome
            },
            txn_id: body.id,
            body: Some(body),
            acceptors,
            txn: None,
            outcome: None,
            outcome_reported: HashSet::new(),
            pending_tgc,
            ballots_done: role != Role::ActiveVoter,
            txn_terminal: false,
            tlc_sent: false,
        }
    }

    /// Rebuild a proposer from its persisted snapshot. The transaction's
    /// local effects were already applied before the snapshot was written,
    /// so the restored proposer only resumes the TLC/TGC exchange.
    pub(super) fn restore(txn_id: TxnId, snapshot: ProposerSnapshot) -> Self {
        Self {
            role: snapshot.role,
            state: State::AwaitGloballyComplete,
            txn_id,
            body: None,
            acceptors: snapshot.acceptors,
            txn: None,
            outcome: Some(snapshot.outcome),
            outcome_reported: HashSet::new(),
            pending_tgc: snapshot.pending_tgc.into_iter().collect(),
            ballots_done: true,
            txn_terminal: true,
            tlc_sent: true,
        }
    }

    /// Create and start the transaction for this role.
    pub(super) fn start(&mut self, env: &ProposerEnv, our_rm: RMId) {
        let Some(body) = &self.body else {
            return;
        };
        let txn = Txn::from_body(
            env.exe.clone(),
            env.dispatcher.clone(),
            env.state_change.clone(),
            our_rm,
            body,
            self.role == Role::ActiveVoter,
        );
        txn.start();
        self.txn = Some(txn);
    }

    /// Resend TLC to every acceptor still owing a TGC; used after restore.
    pub(super) fn resend_tlc(&self, sender: &dyn Sender) {
        for acceptor in &self.pending_tgc {
            if let Err(err) = sender.send(*acceptor, Message::txn_locally_complete(self.txn_id)) {
                tracing::warn!(error = ?err, acceptor, "failed to resend TLC");
            }
        }
    }

    /// The transaction's ballots are in: push them into our own Paxos
    /// instance, skipping phase 1 because our own vote is always safe at
    /// the zero round.
    pub(super) fn ballots_complete(&mut self, ballots: Vec<Ballot>, ctx: &mut PaxosCtx<'_>) {
        if self.state == State::AwaitBallots {
            self.state = State::AwaitOutcome;
            let body = self.body.clone().expect("live proposer has a body");
            let our_rm = ctx.rm_id();
            ctx.new_paxos_proposals(
                &body,
                body.f_inc,
                ballots,
                self.acceptors.clone(),
                our_rm,
                true,
            );
        } else {
            // A submission abort already pushed an all-abort ballot set; the
            // transaction's own votes no longer matter to consensus.
            tracing::debug!(txn = ?self.txn_id, "late ballots ignored");
        }
        // Either way the transaction has now advanced past its voting
        // stages and can accept a buffered outcome.
        self.ballots_done = true;
        if self.state == State::AwaitOutcome && self.outcome.is_some() {
            self.deliver_outcome(ctx);
        }
    }

    /// Submission abort: if we are still gathering votes, force an
    /// all-abort ballot set into Paxos instead. Once an outcome is on the
    /// way this is a no-op.
    pub(super) fn abort(&mut self, ctx: &mut PaxosCtx<'_>) {
        if self.state != State::AwaitBallots {
            tracing::debug!(txn = ?self.txn_id, "submission abort ignored");
            return;
        }
        let body = self.body.clone().expect("live proposer has a body");
        let our_rm = ctx.rm_id();
        let Some(alloc) = body.allocation_for(our_rm) else {
            return;
        };
        tracing::debug!(txn = ?self.txn_id, "aborting on submitter's request");
        let ballots = abort_ballots_for(&body, alloc);
        self.state = State::AwaitOutcome;
        ctx.new_paxos_proposals(
            &body,
            body.f_inc,
            ballots,
            self.acceptors.clone(),
            our_rm,
            true,
        );
    }

    /// A 2B outcome from `sender`. The first outcome decides; identical
    /// repeats are recorded (and answered with a TLC once we are locally
    /// complete); a conflicting outcome is ignored.
    pub(super) fn ballot_outcome_received(
        &mut self,
        sender: RMId,
        outcome: Outcome,
        ctx: &mut PaxosCtx<'_>,
    ) {
        match &self.outcome {
            Some(existing) if *existing != outcome => {
                tracing::warn!(txn = ?self.txn_id, sender, "conflicting outcome ignored");
                return;
            }
            Some(_) => {
                self.outcome_reported.insert(sender);
                if self.tlc_sent {
                    if let Err(err) =
                        ctx.sender().send(sender, Message::txn_locally_complete(self.txn_id))
                    {
                        tracing::warn!(error = ?err, sender, "failed to send TLC");
                    }
                }
                return;
            }
            None => {}
        }
        tracing::debug!(txn = ?self.txn_id, sender, commit = outcome.is_commit(), "outcome decided");
        self.outcome = Some(outcome);
        self.outcome_reported.insert(sender);
        // Hold the outcome until the transaction has left its voting
        // stages; a transaction still voting cannot accept one.
        if self.state == State::AwaitOutcome && self.ballots_done {
            self.deliver_outcome(ctx);
        }
    }

    fn deliver_outcome(&mut self, ctx: &mut PaxosCtx<'_>) {
        self.state = State::AwaitLocallyComplete;
        // We have an outcome; stop proposing.
        ctx.finish_proposers(self.txn_id);
        let outcome = self.outcome.clone().expect("outcome present");
        if let Some(txn) = &self.txn {
            txn.ballot_outcome_received(outcome);
        }
    }

    /// The transaction has applied or discarded its local effects: persist
    /// the snapshot and tell the acceptors.
    pub(super) fn txn_locally_complete(&mut self, ctx: &mut PaxosCtx<'_>) {
        if self.state != State::AwaitLocallyComplete {
            tracing::debug!(txn = ?self.txn_id, "duplicate local completion ignored");
            return;
        }
        self.state = State::AwaitGloballyComplete;
        self.tlc_sent = true;

        let snapshot = ProposerSnapshot {
            role: self.role,
            acceptors: self.acceptors.clone(),
            pending_tgc: self.pending_tgc.iter().copied().collect(),
            outcome: self.outcome.clone().expect("outcome precedes completion"),
        };
        if let Err(err) = ctx.store().save(self.txn_id, encode_snapshot(&snapshot)) {
            tracing::error!(error = ?err, txn = ?self.txn_id, "failed to persist proposer");
        }

        for acceptor in &self.outcome_reported {
            if let Err(err) =
                ctx.sender().send(*acceptor, Message::txn_locally_complete(self.txn_id))
            {
                tracing::warn!(error = ?err, acceptor, "failed to send TLC");
            }
        }
    }

    /// TGC from one acceptor. Returns `true` when the proposer is finished
    /// and may be dropped by the manager.
    pub(super) fn tgc_received(&mut self, sender: RMId) -> bool {
        tracing::debug!(txn = ?self.txn_id, sender, "TGC received");
        if let Some(txn) = &self.txn {
            txn.completion_received();
        }
        self.pending_tgc.remove(&sender);
        self.maybe_finished()
    }

    /// The transaction reached its terminal state.
    pub(super) fn txn_finished_reported(&mut self) -> bool {
        self.txn_terminal = true;
        self.maybe_finished()
    }

    /// Removed RMs will never answer; stop waiting on them.
    pub(super) fn topology_change(&mut self, topology: &Topology) -> bool {
        for removed in &topology.rms_removed {
            self.pending_tgc.remove(removed);
        }
        self.acceptors
            .retain(|acceptor| !topology.rms_removed.contains(acceptor));
        self.maybe_finished()
    }

    fn maybe_finished(&mut self) -> bool {
        if self.state != State::AwaitGloballyComplete {
            return false;
        }
        let txn_done = self.txn.is_none() || self.txn_terminal;
        if txn_done && self.pending_tgc.is_empty() {
            self.state = State::Finished;
            return true;
        }
        false
    }

    pub(super) fn status(&self) -> ProposerStatusSnapshot {
        ProposerStatusSnapshot {
            txn_id: self.txn_id,
            role: self.role,
            state: match self.state {
                State::AwaitBallots => "await-ballots",
                State::AwaitOutcome => "await-outcome",
                State::AwaitLocallyComplete => "await-locally-complete",
                State::AwaitGloballyComplete => "await-globally-complete",
                State::Finished => "finished",
            },
            outcome_known: self.outcome.is_some(),
            pending_tgc: self.pending_tgc.len(),
            txn: self.txn.as_ref().map(|txn| txn.status()),
        }
    }
}
