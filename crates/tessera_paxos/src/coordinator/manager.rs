//! The per-RM proposer manager.
//!
//! Owns the two maps (live proposers by transaction id, live Paxos
//! instances by (transaction id, RM id)) and routes every inbound
//! coordination event. All map mutations run as tasks on the proposer
//! executor, so handlers never observe each other mid-flight; the maps are
//! split-borrowed so a proposer can open Paxos instances through
//! [`PaxosCtx`] without re-entrant locking.
//!
//! Outcomes can legitimately arrive before the transaction body: when an RM
//! is down, the surviving proposers open abort instances on its behalf and
//! consensus completes without it. The routing below therefore treats an
//! outcome for an unknown transaction as a recovery signal rather than an
//! error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;

use tessera_dispatch::executor::Executor;
use tessera_txn::engine::{
    abort_ballots_for, Ballot, RMId, Txn, TxnBody, TxnId, TxnLocalStateChange, VarCap,
    VarDispatcher,
};

use super::proposal::{Proposal, ProposalStatusSnapshot};
use super::proposer::{
    decode_snapshot, Proposer, ProposerEnv, ProposerStatusSnapshot, Role,
};
use super::sender::OneShotSender;
use super::types::{
    Config, InstanceId, Message, OneBTxnVotes, ProposerStore, Sender, Topology, TwoBTxnVotes,
};

/// The acceptor set for a transaction: the first `2 * f_inc - 1`
/// allocations in declaration order, which every proposer derives
/// identically. Initial topology transactions may carry fewer allocations
/// than that.
pub fn acceptors_from(txn: &TxnBody) -> Vec<RMId> {
    let two_f_inc = (txn.f_inc.max(1) as usize) * 2 - 1;
    txn.allocations
        .iter()
        .take(two_f_inc)
        .map(|alloc| alloc.rm_id)
        .collect()
}

/// Narrow window onto the manager handed to proposers and proposals, so
/// they can start and stop Paxos instances while the manager holds the
/// proposer they are running inside.
pub(super) struct PaxosCtx<'a> {
    pub(super) cfg: &'a Config,
    pub(super) proposals: &'a mut HashMap<InstanceId, Proposal>,
    pub(super) sender: &'a Arc<dyn Sender>,
    pub(super) store: &'a Arc<dyn ProposerStore>,
}

impl PaxosCtx<'_> {
    pub(super) fn rm_id(&self) -> RMId {
        self.cfg.rm_id
    }

    pub(super) fn sender(&self) -> &dyn Sender {
        self.sender.as_ref()
    }

    pub(super) fn store(&self) -> &dyn ProposerStore {
        self.store.as_ref()
    }

    /// Start one Paxos instance for (txn, `instance_rm`), deduplicated by
    /// instance key.
    ///
    /// A non-skipping start is a recovery: to force an outcome even if
    /// several proposers died, abort instances are opened for every other
    /// active allocation as well, and recorded on the parent instance for
    /// later garbage collection.
    pub(super) fn new_paxos_proposals(
        &mut self,
        txn: &TxnBody,
        f_inc: u32,
        ballots: Vec<Ballot>,
        acceptors: Vec<RMId>,
        instance_rm: RMId,
        skip_phase1: bool,
    ) {
        let instance_id = InstanceId::new(txn.id, instance_rm);
        if self.proposals.contains_key(&instance_id) {
            return;
        }
        tracing::debug!(
            txn = ?txn.id,
            instance = instance_rm,
            skip_phase1,
            acceptors = acceptors.len(),
            "starting paxos instance"
        );
        let mut proposal = Proposal::new(
            txn.clone(),
            f_inc,
            ballots,
            instance_rm,
            acceptors.clone(),
            skip_phase1,
            self.cfg.rm_id,
        );
        proposal.start(self.sender.as_ref());

        if !skip_phase1 {
            for alloc in &txn.allocations {
                if alloc.rm_id == instance_rm || alloc.active == 0 {
                    continue;
                }
                let sub_id = InstanceId::new(txn.id, alloc.rm_id);
                if self.proposals.contains_key(&sub_id) {
                    continue;
                }
                let mut sub = Proposal::new(
                    txn.clone(),
                    f_inc,
                    abort_ballots_for(txn, alloc),
                    alloc.rm_id,
                    acceptors.clone(),
                    false,
                    self.cfg.rm_id,
                );
                sub.start(self.sender.as_ref());
                self.proposals.insert(sub_id, sub);
                proposal.note_abort_instance(alloc.rm_id);
            }
        }
        self.proposals.insert(instance_id, proposal);
    }

    /// Merge ballots into an already-running instance.
    pub(super) fn add_to_paxos_proposals(&mut self, txn_id: TxnId, ballots: Vec<Ballot>, rm_id: RMId) {
        let instance_id = InstanceId::new(txn_id, rm_id);
        match self.proposals.get_mut(&instance_id) {
            Some(proposal) => proposal.add_ballots(ballots, self.sender.as_ref()),
            None => {
                tracing::error!(txn = ?txn_id, instance = rm_id, "adding ballots to unknown paxos instance")
            }
        }
    }

    /// An outcome exists: stop our own instance and every abort instance it
    /// opened.
    pub(super) fn finish_proposers(&mut self, txn_id: TxnId) {
        let instance_id = InstanceId::new(txn_id, self.cfg.rm_id);
        if let Some(mut proposal) = self.proposals.remove(&instance_id) {
            for rm_id in proposal.finish_proposing() {
                if let Some(mut sub) = self.proposals.remove(&InstanceId::new(txn_id, rm_id)) {
                    sub.finish_proposing();
                }
            }
        }
    }
}

struct ManagerState {
    topology: Option<Topology>,
    proposers: HashMap<TxnId, Proposer>,
    proposals: HashMap<InstanceId, Proposal>,
}

struct ManagerShared {
    weak: Weak<ManagerShared>,
    cfg: Config,
    exe: Executor,
    dispatcher: VarDispatcher,
    sender: Arc<dyn Sender>,
    store: Arc<dyn ProposerStore>,
    state: Mutex<ManagerState>,
}

/// Snapshot of coordinator internals for operators and tests.
#[derive(Clone, Debug)]
pub struct CoordinatorStats {
    pub proposers_len: usize,
    pub proposals_len: usize,
    pub proposers: Vec<ProposerStatusSnapshot>,
    pub proposals: Vec<ProposalStatusSnapshot>,
}

/// Entry point for all proposer-side coordination traffic on one RM.
#[derive(Clone)]
pub struct ProposerManager {
    shared: Arc<ManagerShared>,
}

impl ProposerManager {
    pub fn new(
        exe: Executor,
        cfg: Config,
        dispatcher: VarDispatcher,
        sender: Arc<dyn Sender>,
        store: Arc<dyn ProposerStore>,
    ) -> Self {
        Self {
            shared: Arc::new_cyclic(|weak| ManagerShared {
                weak: weak.clone(),
                cfg,
                exe,
                dispatcher,
                sender,
                store,
                state: Mutex::new(ManagerState {
                    topology: None,
                    proposers: HashMap::new(),
                    proposals: HashMap::new(),
                }),
            }),
        }
    }

    /// Reload every persisted proposer and resume its TLC/TGC exchange.
    ///
    /// Called once at boot, before any network traffic. A snapshot that
    /// fails to decode aborts startup: serving with missing proposers loses
    /// locally-complete acknowledgements.
    pub fn load_persisted(&self) -> anyhow::Result<usize> {
        let entries = self.shared.store.load_all()?;
        let mut state = self.shared.state.lock().expect("coordinator state lock poisoned");
        let mut loaded = 0;
        for (txn_id, data) in entries {
            if state.proposers.contains_key(&txn_id) {
                continue;
            }
            let snapshot = decode_snapshot(&data)
                .with_context(|| format!("reloading proposer for {txn_id}"))?;
            let mut proposer = Proposer::restore(txn_id, snapshot);
            if proposer.txn_finished_reported() {
                // Nothing left to wait for; clear the stale snapshot.
                if let Err(err) = self.shared.store.remove(txn_id) {
                    tracing::warn!(error = ?err, txn = ?txn_id, "failed to clear stale proposer snapshot");
                }
                continue;
            }
            proposer.resend_tlc(self.shared.sender.as_ref());
            state.proposers.insert(txn_id, proposer);
            loaded += 1;
        }
        tracing::debug!(loaded, "reloaded persisted proposers");
        Ok(loaded)
    }

    /// Route one inbound envelope. 1A/2A traffic belongs to the acceptor
    /// side and is not handled here.
    pub fn message_received(&self, sender: RMId, msg: Message) {
        match msg {
            Message::TxnSubmission { txn } => self.txn_received(sender, txn),
            Message::OneBTxnVotes { txn_id, votes } => {
                self.one_b_txn_votes_received(sender, txn_id, votes)
            }
            Message::TwoBTxnVotes { txn, votes, .. } => {
                self.two_b_txn_votes_received(sender, txn, votes)
            }
            Message::TxnGloballyComplete { txn_id } => {
                self.txn_globally_complete_received(sender, txn_id)
            }
            Message::TxnSubmissionAbort { txn_id } => {
                self.txn_submission_abort_received(sender, txn_id)
            }
            other => {
                tracing::debug!(sender, msg = ?other, "envelope not addressed to the proposer side")
            }
        }
    }

    /// A peer forwarded a transaction body for this RM to vote on.
    pub fn txn_received(&self, sender: RMId, txn: TxnBody) {
        self.enqueue_op(move |shared, state| shared.on_txn_received(state, sender, txn));
    }

    /// Phase 1 response routed to its instance; a late 1B for a finished
    /// instance is dropped.
    pub fn one_b_txn_votes_received(&self, sender: RMId, txn_id: TxnId, votes: OneBTxnVotes) {
        self.enqueue_op(move |shared, state| {
            let instance_id = InstanceId::new(txn_id, votes.rm_id);
            match state.proposals.get_mut(&instance_id) {
                Some(proposal) => proposal.one_b_received(sender, votes, shared.sender.as_ref()),
                None => tracing::debug!(txn = ?txn_id, sender, "late 1B dropped"),
            }
        });
    }

    /// Phase 2 response: failures go to their instance, outcomes to the
    /// proposer, creating one first when this RM is recovering.
    pub fn two_b_txn_votes_received(&self, sender: RMId, txn: TxnBody, votes: TwoBTxnVotes) {
        self.enqueue_op(move |shared, state| shared.on_two_b(state, sender, txn, votes));
    }

    pub fn txn_globally_complete_received(&self, sender: RMId, txn_id: TxnId) {
        self.enqueue_op(move |shared, state| {
            let Some(proposer) = state.proposers.get_mut(&txn_id) else {
                tracing::debug!(txn = ?txn_id, sender, "TGC ignored, no proposer");
                return;
            };
            if proposer.tgc_received(sender) {
                shared.drop_proposer(state, txn_id);
            }
        });
    }

    pub fn txn_submission_abort_received(&self, sender: RMId, txn_id: TxnId) {
        self.enqueue_op(move |shared, state| {
            let ManagerState {
                proposers,
                proposals,
                ..
            } = state;
            let Some(proposer) = proposers.get_mut(&txn_id) else {
                tracing::debug!(txn = ?txn_id, sender, "TSA ignored, no proposer");
                return;
            };
            let mut ctx = PaxosCtx {
                cfg: &shared.cfg,
                proposals,
                sender: &shared.sender,
                store: &shared.store,
            };
            proposer.abort(&mut ctx);
        });
    }

    /// An outcome exists for `txn_id`: reap our own Paxos instance and any
    /// abort instances it opened.
    pub fn finish_proposers(&self, txn_id: TxnId) {
        self.enqueue_op(move |shared, state| {
            let mut ctx = PaxosCtx {
                cfg: &shared.cfg,
                proposals: &mut state.proposals,
                sender: &shared.sender,
                store: &shared.store,
            };
            ctx.finish_proposers(txn_id);
        });
    }

    /// Merge ballots into an already-running Paxos instance.
    pub fn add_to_paxos_proposals(&self, txn_id: TxnId, ballots: Vec<Ballot>, rm_id: RMId) {
        self.enqueue_op(move |shared, state| {
            let mut ctx = PaxosCtx {
                cfg: &shared.cfg,
                proposals: &mut state.proposals,
                sender: &shared.sender,
                store: &shared.store,
            };
            ctx.add_to_paxos_proposals(txn_id, ballots, rm_id);
        });
    }

    /// Construct a transaction from emigrated variable snapshots, entering
    /// directly at the receive-outcome stage with the snapshots' clocks.
    pub fn immigration_received(
        &self,
        txn: TxnBody,
        var_caps: Vec<VarCap>,
        state_change: Arc<dyn TxnLocalStateChange>,
    ) {
        let shared = self.shared.clone();
        self.shared.exe.enqueue(move || {
            Txn::immigration_from_caps(
                shared.exe.clone(),
                shared.dispatcher.clone(),
                state_change,
                txn.id,
                var_caps,
            );
        });
    }

    /// Install a new topology, notify every live proposer, and call `done`
    /// exactly once: `true` once the update has run, `false` if the
    /// executor terminated first.
    pub fn topology_changed(&self, topology: Topology, done: impl FnOnce(bool) + Send + 'static) {
        let (tx, mut rx) = tokio::sync::oneshot::channel::<bool>();
        let enqueued = self.enqueue_op(move |shared, state| {
            state.topology = Some(topology.clone());
            let mut finished = Vec::new();
            for (txn_id, proposer) in state.proposers.iter_mut() {
                if proposer.topology_change(&topology) {
                    finished.push(*txn_id);
                }
            }
            for txn_id in finished {
                shared.drop_proposer(state, txn_id);
            }
            let _ = tx.send(true);
        });
        if !enqueued {
            done(false);
            return;
        }
        let token = self.shared.exe.terminated_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                res = &mut rx => res.unwrap_or(false),
                _ = token.cancelled() => false,
            };
            // Termination may have raced the update actually running.
            let result = result || rx.try_recv().unwrap_or(false);
            done(result);
        });
    }

    pub fn debug_stats(&self) -> CoordinatorStats {
        let state = self.shared.state.lock().expect("coordinator state lock poisoned");
        CoordinatorStats {
            proposers_len: state.proposers.len(),
            proposals_len: state.proposals.len(),
            proposers: state.proposers.values().map(Proposer::status).collect(),
            proposals: state.proposals.values().map(Proposal::status).collect(),
        }
    }

    fn enqueue_op(
        &self,
        f: impl FnOnce(&Arc<ManagerShared>, &mut ManagerState) + Send + 'static,
    ) -> bool {
        let shared = self.shared.clone();
        self.shared.exe.enqueue(move || {
            let mut state = shared.state.lock().expect("coordinator state lock poisoned");
            f(&shared, &mut state);
        })
    }
}

impl ManagerShared {
    fn proposer_env(&self, txn_id: TxnId) -> ProposerEnv {
        ProposerEnv {
            exe: self.exe.clone(),
            dispatcher: self.dispatcher.clone(),
            state_change: Arc::new(ManagerStateChange {
                shared: self.weak.clone(),
                txn_id,
            }),
        }
    }

    fn drop_proposer(&self, state: &mut ManagerState, txn_id: TxnId) {
        state.proposers.remove(&txn_id);
        if let Err(err) = self.store.remove(txn_id) {
            tracing::warn!(error = ?err, txn = ?txn_id, "failed to clear proposer snapshot");
        }
    }

    fn on_txn_received(&self, state: &mut ManagerState, sender: RMId, txn: TxnBody) {
        let ManagerState {
            topology,
            proposers,
            proposals,
        } = state;
        if proposers.contains_key(&txn.id) {
            return;
        }
        tracing::debug!(txn = ?txn.id, sender, "transaction received");

        let mut accept = true;
        if let Some(topology) = topology {
            accept = topology.accepts_version(txn.topology_version);
            if accept {
                accept = !topology.rms_removed.contains(&sender);
                if accept {
                    accept = txn
                        .allocation_for(self.cfg.rm_id)
                        .is_some_and(|alloc| alloc.active == self.cfg.boot_count);
                    if !accept {
                        tracing::debug!(
                            txn = ?txn.id,
                            boot_count = self.cfg.boot_count,
                            "aborting txn submitted for an older boot of this rm, it may already hold our vote"
                        );
                    }
                } else {
                    tracing::debug!(txn = ?txn.id, sender, "aborting txn from an rm removed by topology");
                }
            } else {
                tracing::debug!(
                    txn = ?txn.id,
                    version = txn.topology_version,
                    "aborting txn with non-matching topology version"
                );
            }
        }

        let txn_id = txn.id;
        let acceptors = acceptors_from(&txn);
        let role = if accept {
            Role::ActiveVoter
        } else {
            // ActiveLearner is right: this RM must not vote, but it should
            // exist to collect the 2Bs that will come back.
            if let Some(alloc) = txn.allocation_for(self.cfg.rm_id) {
                let ballots = abort_ballots_for(&txn, alloc);
                let f_inc = txn.f_inc;
                let mut ctx = PaxosCtx {
                    cfg: &self.cfg,
                    proposals,
                    sender: &self.sender,
                    store: &self.store,
                };
                ctx.new_paxos_proposals(&txn, f_inc, ballots, acceptors.clone(), self.cfg.rm_id, true);
            }
            Role::ActiveLearner
        };

        let env = self.proposer_env(txn_id);
        let mut proposer = Proposer::new(role, txn, topology.clone(), acceptors);
        proposer.start(&env, self.cfg.rm_id);
        proposers.insert(txn_id, proposer);
    }

    fn on_two_b(
        &self,
        state: &mut ManagerState,
        sender: RMId,
        txn: TxnBody,
        votes: TwoBTxnVotes,
    ) {
        let ManagerState {
            topology,
            proposers,
            proposals,
        } = state;
        match votes {
            TwoBTxnVotes::Failures(failures) => {
                let instance_id = InstanceId::new(txn.id, failures.rm_id);
                match proposals.get_mut(&instance_id) {
                    Some(proposal) => {
                        proposal.two_b_failures_received(sender, failures, self.sender.as_ref())
                    }
                    None => tracing::debug!(txn = ?txn.id, sender, "late 2B failures dropped"),
                }
            }
            TwoBTxnVotes::Outcome { outcome } => {
                if let Some(proposer) = proposers.get_mut(&txn.id) {
                    tracing::debug!(txn = ?txn.id, sender, "2B outcome received (known)");
                    let mut ctx = PaxosCtx {
                        cfg: &self.cfg,
                        proposals,
                        sender: &self.sender,
                        store: &self.store,
                    };
                    proposer.ballot_outcome_received(sender, outcome, &mut ctx);
                    return;
                }

                let txn_id = txn.id;
                let active = txn
                    .allocation_for(self.cfg.rm_id)
                    .map(|alloc| alloc.active)
                    .unwrap_or(0);
                if active != 0 {
                    // No record, but we were active: we died and recovered,
                    // or never saw the body because other proposers aborted
                    // on our behalf. The sending acceptor may be one of
                    // only a few that know the outcome, so propose for our
                    // own vars to push the result to all of them.
                    tracing::debug!(txn = ?txn_id, sender, "2B outcome received (unknown active), recovering");
                    let acceptors = acceptors_from(&txn);
                    let alloc = txn
                        .allocation_for(self.cfg.rm_id)
                        .expect("active allocation present");
                    let ballots = abort_ballots_for(&txn, alloc);
                    let f_inc = txn.f_inc;
                    let mut ctx = PaxosCtx {
                        cfg: &self.cfg,
                        proposals,
                        sender: &self.sender,
                        store: &self.store,
                    };
                    ctx.new_paxos_proposals(
                        &txn,
                        f_inc,
                        ballots,
                        acceptors.clone(),
                        self.cfg.rm_id,
                        false,
                    );
                    let env = self.proposer_env(txn_id);
                    let mut proposer =
                        Proposer::new(Role::ActiveLearner, txn, topology.clone(), acceptors);
                    proposer.start(&env, self.cfg.rm_id);
                    proposer.ballot_outcome_received(sender, outcome, &mut ctx);
                    proposers.insert(txn_id, proposer);
                } else if outcome.is_commit() {
                    tracing::debug!(txn = ?txn_id, sender, "2B outcome received (unknown learner)");
                    let acceptors = acceptors_from(&txn);
                    let env = self.proposer_env(txn_id);
                    let mut proposer =
                        Proposer::new(Role::PassiveLearner, txn, topology.clone(), acceptors);
                    proposer.start(&env, self.cfg.rm_id);
                    let mut ctx = PaxosCtx {
                        cfg: &self.cfg,
                        proposals,
                        sender: &self.sender,
                        store: &self.store,
                    };
                    proposer.ballot_outcome_received(sender, outcome, &mut ctx);
                    proposers.insert(txn_id, proposer);
                } else {
                    // An abort for a transaction we hold no state for: it
                    // committed here in a previous life and the state died
                    // with that boot. Do not resurrect it; just acknowledge
                    // so the acceptor can let go. Repeats produce further
                    // TLCs, which is correct for a state-less reply.
                    tracing::debug!(txn = ?txn_id, sender, "immediate TLC for unknown abort learner");
                    OneShotSender::spawn(
                        self.sender.clone(),
                        sender,
                        Message::txn_locally_complete(txn_id),
                    );
                }
            }
        }
    }

    fn on_ballots_complete(
        &self,
        state: &mut ManagerState,
        txn_id: TxnId,
        ballots: Vec<Ballot>,
    ) {
        let ManagerState {
            proposers,
            proposals,
            ..
        } = state;
        let Some(proposer) = proposers.get_mut(&txn_id) else {
            tracing::debug!(txn = ?txn_id, "ballots complete for unknown proposer");
            return;
        };
        let mut ctx = PaxosCtx {
            cfg: &self.cfg,
            proposals,
            sender: &self.sender,
            store: &self.store,
        };
        proposer.ballots_complete(ballots, &mut ctx);
    }

    fn on_locally_complete(&self, state: &mut ManagerState, txn_id: TxnId) {
        let ManagerState {
            proposers,
            proposals,
            ..
        } = state;
        let Some(proposer) = proposers.get_mut(&txn_id) else {
            tracing::debug!(txn = ?txn_id, "local completion for unknown proposer");
            return;
        };
        let mut ctx = PaxosCtx {
            cfg: &self.cfg,
            proposals,
            sender: &self.sender,
            store: &self.store,
        };
        proposer.txn_locally_complete(&mut ctx);
    }

    fn on_txn_finished(&self, state: &mut ManagerState, txn_id: TxnId) {
        let Some(proposer) = state.proposers.get_mut(&txn_id) else {
            return;
        };
        if proposer.txn_finished_reported() {
            self.drop_proposer(state, txn_id);
        }
    }
}

/// Per-transaction upward callback handle: every callback becomes a task on
/// the proposer executor.
struct ManagerStateChange {
    shared: Weak<ManagerShared>,
    txn_id: TxnId,
}

impl ManagerStateChange {
    fn enqueue(&self, f: impl FnOnce(&Arc<ManagerShared>, &mut ManagerState) + Send + 'static) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let shared_for_task = shared.clone();
        shared.exe.enqueue(move || {
            let mut state = shared_for_task
                .state
                .lock()
                .expect("coordinator state lock poisoned");
            f(&shared_for_task, &mut state);
        });
    }
}

impl TxnLocalStateChange for ManagerStateChange {
    fn txn_ballots_complete(&self, ballots: Vec<Ballot>) {
        let txn_id = self.txn_id;
        self.enqueue(move |shared, state| shared.on_ballots_complete(state, txn_id, ballots));
    }

    fn txn_locally_complete(&self, _txn: &Arc<Txn>) {
        let txn_id = self.txn_id;
        self.enqueue(move |shared, state| shared.on_locally_complete(state, txn_id));
    }

    fn txn_finished(&self, _txn: &Arc<Txn>) {
        let txn_id = self.txn_id;
        self.enqueue(move |shared, state| shared.on_txn_finished(state, txn_id));
    }
}
