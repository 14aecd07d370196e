//! The per-transaction state machine.
//!
//! A transaction moves through five stages, strictly in order: determine
//! local ballots, await local ballots, receive outcome, await locally
//! complete, receive completion. Learners enter directly at receive
//! outcome. The current stage advances *before* any side effects of the
//! transition run, so re-entrant callbacks always observe the post-
//! transition stage.
//!
//! Votes arrive from variable shard executors while stage transitions run
//! on the proposer executor, so the three hand-off counters are atomics;
//! everything else is only touched from proposer-executor tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tessera_dispatch::executor::Executor;

use super::ballot::{BadReadEvidence, Ballot, Outcome, Subscriptions};
use super::clock::VectorClock;
use super::types::{Action, ActionKind, Modify, Positions, RMId, TxnBody, TxnId, VarCap, VarId};
use super::var::{Frame, VarDispatcher};

/// Upward callbacks from a transaction into its owner.
///
/// Implementations must enqueue any work that mutates shared state; the
/// calls themselves are made on the proposer executor.
pub trait TxnLocalStateChange: Send + Sync {
    fn txn_ballots_complete(&self, ballots: Vec<Ballot>);
    fn txn_locally_complete(&self, txn: &Arc<Txn>);
    fn txn_finished(&self, txn: &Arc<Txn>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    DetermineLocalBallots,
    AwaitLocalBallots,
    ReceiveOutcome,
    AwaitLocallyComplete,
    ReceiveCompletion,
    Done,
}

/// Semantic state, touched only from proposer-executor tasks.
struct TxnCore {
    stage: Stage,
    pre_aborted: bool,
    aborted: bool,
    outcome_clock: Option<VectorClock>,
    completed: bool,
}

struct ActionState {
    var_id: VarId,
    /// The transaction that wrote this value. Equal to the owning
    /// transaction's id except for immigrant actions, which carry the
    /// emigrated variable's writing transaction.
    writing_txn: TxnId,
    create: Option<Positions>,
    read: Option<TxnId>,
    write: bool,
    roll: bool,
    add_sub: bool,
    del_sub: Option<TxnId>,
    immigrant: Option<VarCap>,
    // Set on the variable's shard, read on the proposer executor after an
    // enqueue hand-off.
    ballot: OnceLock<Ballot>,
    frame: OnceLock<Arc<dyn Frame>>,
    outcome_clock: Mutex<Option<VectorClock>>,
}

/// Point-in-time view of a transaction for operators and tests.
#[derive(Clone, Debug)]
pub struct TxnStatusSnapshot {
    pub id: TxnId,
    pub voter: bool,
    pub stage: &'static str,
    pub pre_aborted: bool,
    pub aborted: bool,
    pub completed: bool,
    pub pending_vote: i32,
    pub active_frames: i32,
}

pub struct Txn {
    // Self-reference so callbacks handed to variables and executors can
    // carry the transaction without an ownership cycle.
    weak: Weak<Txn>,
    id: TxnId,
    voter: bool,
    writes: Vec<VarId>,
    actions: Vec<ActionState>,
    exe: Executor,
    dispatcher: VarDispatcher,
    state_change: Arc<dyn TxnLocalStateChange>,
    pending_vote: AtomicI32,
    pre_aborted: AtomicBool,
    active_frames: AtomicI32,
    core: Mutex<TxnCore>,
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("voter", &self.voter)
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Handle to one local action, given to the variable that hosts it.
///
/// The variable casts its vote, attaches its frame, and later reports local
/// completion through this handle; all of those calls may come from the
/// variable's shard executor.
#[derive(Clone)]
pub struct ActionRef {
    txn: Arc<Txn>,
    idx: usize,
}

impl fmt::Debug for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRef")
            .field("txn", &self.txn.id)
            .field("var", &self.state().var_id)
            .finish()
    }
}

impl ActionRef {
    fn state(&self) -> &ActionState {
        &self.txn.actions[self.idx]
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn.id
    }

    /// The transaction whose write produced the value this action carries.
    pub fn writing_txn_id(&self) -> TxnId {
        self.state().writing_txn
    }

    pub fn var_id(&self) -> VarId {
        self.state().var_id
    }

    /// Every variable the whole transaction writes, local or not.
    pub fn txn_writes(&self) -> &[VarId] {
        &self.txn.writes
    }

    pub fn is_create(&self) -> bool {
        self.state().create.is_some()
    }

    pub fn create_positions(&self) -> Option<Positions> {
        self.state().create.clone()
    }

    pub fn is_read(&self) -> bool {
        self.state().read.is_some()
    }

    pub fn read_dependency(&self) -> Option<TxnId> {
        self.state().read
    }

    pub fn is_write(&self) -> bool {
        let s = self.state();
        s.create.is_some() || s.write || s.roll || s.add_sub || s.del_sub.is_some()
    }

    pub fn is_noop_write(&self) -> bool {
        let s = self.state();
        s.create.is_none() && !s.write && (s.roll || s.add_sub || s.del_sub.is_some())
    }

    pub fn is_meta(&self) -> bool {
        let s = self.state();
        s.add_sub || s.del_sub.is_some()
    }

    pub fn is_immigrant(&self) -> bool {
        self.state().immigrant.is_some()
    }

    pub fn immigrant_var(&self) -> Option<VarCap> {
        self.state().immigrant.clone()
    }

    pub fn ballot(&self) -> Option<Ballot> {
        self.state().ballot.get().cloned()
    }

    /// The outcome clock stamped on this action; `None` until the outcome
    /// arrives, and forever for aborts.
    pub fn outcome_clock(&self) -> Option<VectorClock> {
        self.state()
            .outcome_clock
            .lock()
            .expect("action clock lock poisoned")
            .clone()
    }

    /// Attach the frame holding this action's tentative effects. Called at
    /// most once, by the hosting variable.
    pub fn set_frame(&self, frame: Arc<dyn Frame>) {
        if self.state().frame.set(frame).is_err() {
            panic!("{self:?} frame attached twice");
        }
    }

    pub fn frame(&self) -> Option<Arc<dyn Frame>> {
        self.state().frame.get().cloned()
    }

    pub fn vote_deadlock(&self, clock: VectorClock) {
        let ballot = Ballot::abort_deadlock(self.var_id(), clock);
        if self.state().ballot.set(ballot).is_ok() {
            self.txn.vote_cast(true);
        }
    }

    pub fn vote_bad_read(&self, clock: VectorClock, txn_id: TxnId, actions: Vec<Action>) {
        let evidence = BadReadEvidence { txn_id, actions };
        let ballot = Ballot::abort_bad_read(self.var_id(), clock, evidence);
        if self.state().ballot.set(ballot).is_ok() {
            self.txn.vote_cast(true);
        }
    }

    /// Cast a commit vote. Returns `true` while a commit outcome is still
    /// possible; `false` tells the variable another local action has already
    /// aborted and the frame may release early.
    pub fn vote_commit(&self, clock: VectorClock, subscriptions: Option<Subscriptions>) -> bool {
        let ballot = Ballot::commit(self.var_id(), clock, subscriptions);
        if self.state().ballot.set(ballot).is_ok() {
            return !self.txn.vote_cast(false);
        }
        false
    }

    /// Called by the frame once this action's effects are applied.
    pub fn locally_complete(&self) {
        let remaining = self.txn.active_frames.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(txn = ?self.txn.id, remaining, "frame locally complete");
        match remaining {
            0 => {
                let txn = self.txn.clone();
                self.txn.exe.enqueue(move || txn.locally_complete());
            }
            r if r < 0 => panic!("{:?} active frame count went negative", self.txn.id),
            _ => {}
        }
    }
}

impl Txn {
    /// Build a transaction from its wire body, selecting the local actions
    /// from this RM's allocation.
    pub fn from_body(
        exe: Executor,
        dispatcher: VarDispatcher,
        state_change: Arc<dyn TxnLocalStateChange>,
        our_rm: RMId,
        body: &TxnBody,
        voter: bool,
    ) -> Arc<Txn> {
        let writes = body
            .actions
            .iter()
            .filter(|a| a.is_write())
            .map(|a| a.var_id)
            .collect();

        let mut actions = Vec::new();
        if let Some(alloc) = body.allocation_for(our_rm) {
            actions.reserve(alloc.action_indices.len());
            for idx in &alloc.action_indices {
                let Some(action) = body.actions.get(*idx as usize) else {
                    panic!(
                        "{:?} allocation for rm {our_rm} references action {idx} out of range",
                        body.id
                    );
                };
                actions.push(ActionState::from_action(body.id, action));
            }
        }

        Arc::new_cyclic(|weak| Txn {
            weak: weak.clone(),
            id: body.id,
            voter,
            writes,
            actions,
            exe,
            dispatcher,
            state_change,
            pending_vote: AtomicI32::new(0),
            pre_aborted: AtomicBool::new(false),
            active_frames: AtomicI32::new(0),
            core: Mutex::new(TxnCore {
                stage: Stage::Done,
                pre_aborted: false,
                aborted: false,
                outcome_clock: None,
                completed: false,
            }),
        })
    }

    /// Build a learner transaction from emigrated variable snapshots and
    /// inject it directly into the receive-outcome stage with the outcome
    /// clocks already present.
    ///
    /// The actions come from the snapshots rather than the transaction's
    /// allocation: the allocation reflects the topology at submission time,
    /// and the emigrator has already selected the variables now assigned to
    /// this RM.
    pub fn immigration_from_caps(
        exe: Executor,
        dispatcher: VarDispatcher,
        state_change: Arc<dyn TxnLocalStateChange>,
        id: TxnId,
        var_caps: Vec<VarCap>,
    ) -> Arc<Txn> {
        let writes = var_caps.iter().map(|cap| cap.id).collect();
        let actions = var_caps.into_iter().map(ActionState::from_cap).collect();

        let txn = Arc::new_cyclic(|weak| Txn {
            weak: weak.clone(),
            id,
            voter: false,
            writes,
            actions,
            exe,
            dispatcher,
            state_change,
            pending_vote: AtomicI32::new(0),
            pre_aborted: AtomicBool::new(false),
            active_frames: AtomicI32::new(0),
            core: Mutex::new(TxnCore {
                stage: Stage::Done,
                pre_aborted: false,
                aborted: false,
                outcome_clock: None,
                completed: false,
            }),
        });

        txn.start();
        // The outcome clocks are already on the actions, so skip the
        // receive-outcome stage and hand each action straight to its
        // variable.
        {
            let mut core = txn.lock_core();
            debug_assert_eq!(core.stage, Stage::ReceiveOutcome);
            core.stage = Stage::AwaitLocallyComplete;
        }
        txn.start_await_locally_complete();
        for idx in 0..txn.actions.len() {
            let aref = txn.action_ref(idx);
            let var_id = txn.actions[idx].var_id;
            txn.dispatcher.apply_to_var(
                move |var| match var {
                    Some(var) => var.receive_txn_outcome(&aref),
                    None => panic!("{aref:?} immigration unable to create var"),
                },
                true,
                var_id,
            );
        }
        txn
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_voter(&self) -> bool {
        self.voter
    }

    pub fn writes(&self) -> &[VarId] {
        &self.writes
    }

    pub fn local_actions_len(&self) -> usize {
        self.actions.len()
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, TxnCore> {
        self.core.lock().expect("txn core lock poisoned")
    }

    fn arc(&self) -> Arc<Txn> {
        self.weak.upgrade().expect("txn self-reference alive")
    }

    fn action_ref(&self, idx: usize) -> ActionRef {
        ActionRef {
            txn: self.arc(),
            idx,
        }
    }

    /// Begin the lifecycle. Voters start at determine-local-ballots,
    /// learners at receive-outcome.
    pub fn start(&self) {
        let count = self.actions.len() as i32;
        self.pending_vote.store(count, Ordering::Release);
        self.active_frames.store(count, Ordering::Release);
        {
            let mut core = self.lock_core();
            core.stage = if self.voter {
                Stage::DetermineLocalBallots
            } else {
                Stage::ReceiveOutcome
            };
        }
        if self.voter {
            self.determine_local_ballots();
        }
    }

    // Stage 1: fan each local action out to its variable, advancing the
    // stage before any variable can answer.
    fn determine_local_ballots(&self) {
        {
            let mut core = self.lock_core();
            if core.stage != Stage::DetermineLocalBallots {
                panic!(
                    "{:?} determining ballots with txn in stage {:?}",
                    self.id, core.stage
                );
            }
            core.stage = Stage::AwaitLocalBallots;
        }
        for idx in 0..self.actions.len() {
            let aref = self.action_ref(idx);
            let var_id = self.actions[idx].var_id;
            self.dispatcher.apply_to_var(
                move |var| match var {
                    Some(var) => var.receive_txn(&aref),
                    None => panic!("{aref:?} unable to create var for voting"),
                },
                true,
                var_id,
            );
        }
    }

    // Stage 2 hand-off: runs on a variable shard. The first abort vote
    // schedules the pre-abort walk exactly once; the final vote schedules
    // ballot completion.
    fn vote_cast(&self, abort: bool) -> bool {
        if abort
            && self
                .pre_aborted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let txn = self.arc();
            self.exe.enqueue(move || txn.pre_abort());
        }
        let abort = abort || self.pre_aborted.load(Ordering::Acquire);
        if self.pending_vote.fetch_sub(1, Ordering::AcqRel) == 1 {
            let txn = self.arc();
            self.exe.enqueue(move || txn.all_ballots_complete());
        }
        abort
    }

    // Stage 2: walk every action and release the frames of those that have
    // already voted, so locally held locks free before the outcome lands.
    fn pre_abort(self: Arc<Self>) {
        {
            let mut core = self.lock_core();
            if core.stage != Stage::AwaitLocalBallots || core.pre_aborted {
                panic!(
                    "{:?} pre-abort with txn in stage {:?} (pre_aborted {})",
                    self.id, core.stage, core.pre_aborted
                );
            }
            core.pre_aborted = true;
        }
        for idx in 0..self.actions.len() {
            let aref = self.action_ref(idx);
            let var_id = self.actions[idx].var_id;
            self.dispatcher.apply_to_var(
                move |var| {
                    let has_ballot = aref.state().ballot.get().is_some();
                    let frame = aref.state().frame.get().cloned();
                    if has_ballot && frame.is_none() {
                        // Voted abort before a frame existed; the variable
                        // may already be idle.
                        if let Some(var) = var {
                            var.maybe_make_inactive();
                        }
                    } else if var.is_none() {
                        panic!("{aref:?} var missing during pre-abort");
                    } else if has_ballot {
                        let frame = frame.expect("frame present with ballot");
                        if aref.is_read() && aref.is_write() {
                            frame.read_write_aborted(&aref, true);
                        } else if aref.is_read() {
                            frame.read_aborted(&aref);
                        } else {
                            frame.write_aborted(&aref, true);
                        }
                    }
                },
                false,
                var_id,
            );
        }
    }

    fn all_ballots_complete(self: Arc<Self>) {
        {
            let mut core = self.lock_core();
            if core.stage != Stage::AwaitLocalBallots {
                panic!(
                    "{:?} ballots completed with txn in stage {:?}",
                    self.id, core.stage
                );
            }
            core.stage = Stage::ReceiveOutcome;
        }
        let ballots = self
            .actions
            .iter()
            .map(|a| {
                a.ballot
                    .get()
                    .cloned()
                    .unwrap_or_else(|| panic!("{:?} ballot missing after all votes cast", self.id))
            })
            .collect();
        self.state_change.txn_ballots_complete(ballots);
    }

    /// Stage 3: accept the consensus outcome. At most one outcome is
    /// honoured; later outcomes are silently ignored. Receiving any outcome
    /// before this stage is a protocol violation.
    pub fn ballot_outcome_received(&self, outcome: Outcome) {
        let (pre_aborted, aborted) = {
            let mut core = self.lock_core();
            if core.outcome_clock.is_some() || core.aborted {
                return;
            }
            if core.stage != Stage::ReceiveOutcome {
                panic!(
                    "{:?} outcome received with txn in stage {:?}",
                    self.id, core.stage
                );
            }
            match &outcome {
                Outcome::Commit { clock } => core.outcome_clock = Some(clock.clone()),
                Outcome::Abort { .. } => core.aborted = true,
            }
            core.stage = Stage::AwaitLocallyComplete;
            (core.pre_aborted, core.aborted)
        };
        self.start_await_locally_complete();

        if pre_aborted {
            if !aborted {
                panic!(
                    "{:?} pre-aborted locally but the consensus outcome is commit",
                    self.id
                );
            }
            // Frames were already released by the pre-abort walk.
            return;
        }

        let clock = match &outcome {
            Outcome::Commit { clock } => Some(clock.clone()),
            Outcome::Abort { .. } => None,
        };
        for idx in 0..self.actions.len() {
            *self.actions[idx]
                .outcome_clock
                .lock()
                .expect("action clock lock poisoned") = clock.clone();
            let aref = self.action_ref(idx);
            let var_id = self.actions[idx].var_id;
            // Only learners may find the variable missing locally.
            let create = !self.voter;
            self.dispatcher.apply_to_var(
                move |var| match var {
                    Some(var) => var.receive_txn_outcome(&aref),
                    None => panic!("{aref:?} var missing at outcome"),
                },
                create,
                var_id,
            );
        }
    }

    // Stage 4 entry: aborted transactions and transactions with no frames
    // left are locally complete immediately.
    fn start_await_locally_complete(&self) {
        let fire = {
            let core = self.lock_core();
            core.stage == Stage::AwaitLocallyComplete
                && (core.aborted || self.active_frames.load(Ordering::Acquire) == 0)
        };
        if fire {
            self.arc().locally_complete();
        }
    }

    fn locally_complete(self: Arc<Self>) {
        let fire = {
            let mut core = self.lock_core();
            if core.stage == Stage::AwaitLocallyComplete {
                core.stage = Stage::ReceiveCompletion;
                true
            } else {
                false
            }
        };
        if fire {
            self.state_change.txn_locally_complete(&self);
        }
    }

    /// Stage 5: the transaction is globally complete. The first call
    /// finishes the transaction; repeats are silently ignored; a call in
    /// any earlier stage is a protocol violation.
    pub fn completion_received(&self) {
        let aborted = {
            let mut core = self.lock_core();
            tracing::debug!(
                txn = ?self.id,
                completed = core.completed,
                aborted = core.aborted,
                "completion received"
            );
            if core.completed {
                return;
            }
            if core.stage != Stage::ReceiveCompletion {
                panic!(
                    "{:?} completion received with txn in stage {:?}",
                    self.id, core.stage
                );
            }
            core.completed = true;
            core.stage = Stage::Done;
            core.aborted
        };
        self.state_change.txn_finished(&self.arc());
        if aborted {
            return;
        }
        for idx in 0..self.actions.len() {
            if self.actions[idx].frame.get().is_none() {
                // Learners that applied without a frame have nothing to
                // release.
                continue;
            }
            let aref = self.action_ref(idx);
            let var_id = self.actions[idx].var_id;
            self.dispatcher.apply_to_var(
                move |var| match var {
                    Some(var) => var.txn_globally_complete(&aref),
                    None => panic!("{aref:?} var missing at global completion"),
                },
                false,
                var_id,
            );
        }
    }

    pub fn status(&self) -> TxnStatusSnapshot {
        let core = self.lock_core();
        TxnStatusSnapshot {
            id: self.id,
            voter: self.voter,
            stage: match core.stage {
                Stage::DetermineLocalBallots => "determine-local-ballots",
                Stage::AwaitLocalBallots => "await-local-ballots",
                Stage::ReceiveOutcome => "receive-outcome",
                Stage::AwaitLocallyComplete => "await-locally-complete",
                Stage::ReceiveCompletion => "receive-completion",
                Stage::Done => "done",
            },
            pre_aborted: core.pre_aborted,
            aborted: core.aborted,
            completed: core.completed,
            pending_vote: self.pending_vote.load(Ordering::Acquire),
            active_frames: self.active_frames.load(Ordering::Acquire),
        }
    }
}

impl ActionState {
    fn from_action(txn_id: TxnId, action: &Action) -> Self {
        let (create, read, write, roll) = match &action.kind {
            ActionKind::Create { positions } => (Some(positions.clone()), None, false, false),
            ActionKind::Existing { read, modify } => (
                None,
                *read,
                *modify == Modify::Write,
                *modify == Modify::Roll,
            ),
        };
        Self {
            var_id: action.var_id,
            writing_txn: txn_id,
            create,
            read,
            write,
            roll,
            add_sub: action.meta.add_sub,
            del_sub: action.meta.del_sub,
            immigrant: None,
            ballot: OnceLock::new(),
            frame: OnceLock::new(),
            outcome_clock: Mutex::new(None),
        }
    }

    fn from_cap(cap: VarCap) -> Self {
        Self {
            var_id: cap.id,
            writing_txn: cap.write_txn_id,
            create: Some(cap.positions.clone()),
            read: None,
            write: true,
            roll: false,
            add_sub: false,
            del_sub: None,
            ballot: OnceLock::new(),
            frame: OnceLock::new(),
            outcome_clock: Mutex::new(Some(cap.write_txn_clock.clone())),
            immigrant: Some(cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{txn_id, var_id, ActionMeta, Allocation, BootCount, TXN_ID_LEN};
    use super::super::var::{Var, VarFactory};
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct SinkState {
        ballots: Vec<Vec<Ballot>>,
        locally_complete: usize,
        finished: usize,
    }

    #[derive(Default)]
    struct RecordingSink {
        state: StdMutex<SinkState>,
    }

    impl TxnLocalStateChange for RecordingSink {
        fn txn_ballots_complete(&self, ballots: Vec<Ballot>) {
            self.state.lock().unwrap().ballots.push(ballots);
        }
        fn txn_locally_complete(&self, _txn: &Arc<Txn>) {
            self.state.lock().unwrap().locally_complete += 1;
        }
        fn txn_finished(&self, _txn: &Arc<Txn>) {
            self.state.lock().unwrap().finished += 1;
        }
    }

    #[derive(Default)]
    struct FrameState {
        read_aborted: usize,
        write_aborted: usize,
        read_write_aborted: usize,
    }

    #[derive(Default)]
    struct RecordingFrame {
        state: StdMutex<FrameState>,
    }

    impl Frame for RecordingFrame {
        fn read_aborted(&self, _action: &ActionRef) {
            self.state.lock().unwrap().read_aborted += 1;
        }
        fn write_aborted(&self, _action: &ActionRef, _retain_locks: bool) {
            self.state.lock().unwrap().write_aborted += 1;
        }
        fn read_write_aborted(&self, _action: &ActionRef, _retain_locks: bool) {
            self.state.lock().unwrap().read_write_aborted += 1;
        }
    }

    #[derive(Default)]
    struct VarLog {
        votes: usize,
        applied_commits: Vec<(VarId, VectorClock)>,
        applied_aborts: usize,
        globally_complete: usize,
    }

    struct ScriptedVar {
        var_id: VarId,
        abort_vote: bool,
        frame: Arc<RecordingFrame>,
        log: Arc<StdMutex<VarLog>>,
    }

    impl Var for ScriptedVar {
        fn receive_txn(&mut self, action: &ActionRef) {
            self.log.lock().unwrap().votes += 1;
            action.set_frame(self.frame.clone());
            if self.abort_vote {
                action.vote_deadlock(VectorClock::new());
            } else {
                action.vote_commit(VectorClock::new(), None);
            }
        }

        fn receive_txn_outcome(&mut self, action: &ActionRef) {
            match action.outcome_clock() {
                Some(clock) => {
                    self.log
                        .lock()
                        .unwrap()
                        .applied_commits
                        .push((self.var_id, clock));
                    action.locally_complete();
                }
                None => {
                    self.log.lock().unwrap().applied_aborts += 1;
                }
            }
        }

        fn txn_globally_complete(&mut self, _action: &ActionRef) {
            self.log.lock().unwrap().globally_complete += 1;
        }

        fn maybe_make_inactive(&mut self) {}
    }

    struct ScriptedFactory {
        abort_votes: HashMap<VarId, bool>,
        frames: StdMutex<HashMap<VarId, Arc<RecordingFrame>>>,
        log: Arc<StdMutex<VarLog>>,
    }

    impl ScriptedFactory {
        fn new(abort_votes: HashMap<VarId, bool>) -> Arc<Self> {
            Arc::new(Self {
                abort_votes,
                frames: StdMutex::new(HashMap::new()),
                log: Arc::new(StdMutex::new(VarLog::default())),
            })
        }

        fn frame(&self, var_id: VarId) -> Option<Arc<RecordingFrame>> {
            self.frames.lock().unwrap().get(&var_id).cloned()
        }
    }

    impl VarFactory for ScriptedFactory {
        fn create(&self, var_id: VarId) -> Box<dyn Var> {
            let frame = Arc::new(RecordingFrame::default());
            self.frames.lock().unwrap().insert(var_id, frame.clone());
            Box::new(ScriptedVar {
                var_id,
                abort_vote: self.abort_votes.get(&var_id).copied().unwrap_or(false),
                frame,
                log: self.log.clone(),
            })
        }
    }

    fn body(vars: &[u8]) -> TxnBody {
        TxnBody {
            id: txn_id(1),
            topology_version: 1,
            f_inc: 1,
            allocations: vec![Allocation {
                rm_id: 1,
                active: 7 as BootCount,
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

    struct Harness {
        exe: Executor,
        dispatcher: VarDispatcher,
        factory: Arc<ScriptedFactory>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new(abort_votes: HashMap<VarId, bool>) -> Self {
            let factory = ScriptedFactory::new(abort_votes);
            Self {
                exe: Executor::new("txn-test"),
                dispatcher: VarDispatcher::new(4, factory.clone()),
                factory,
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn spawn_voter(&self, body: &TxnBody) -> Arc<Txn> {
            let txn = Txn::from_body(
                self.exe.clone(),
                self.dispatcher.clone(),
                self.sink.clone(),
                1,
                body,
                true,
            );
            txn.start();
            txn
        }

        // Hand-offs bounce between the proposer executor and the variable
        // shards, so drain both a few times.
        async fn settle(&self) {
            for _ in 0..4 {
                self.exe.flush().await;
                self.dispatcher.flush().await;
            }
        }
    }

    #[tokio::test]
    async fn voter_commit_lifecycle_runs_to_completion() {
        let h = Harness::new(HashMap::new());
        let txn = h.spawn_voter(&body(&[1]));
        h.settle().await;

        {
            let sink = h.sink.state.lock().unwrap();
            assert_eq!(sink.ballots.len(), 1);
            assert_eq!(sink.ballots[0].len(), 1);
            assert!(!sink.ballots[0][0].is_abort());
        }

        let clock: VectorClock = [(var_id(1), 3)].into_iter().collect();
        txn.ballot_outcome_received(Outcome::Commit { clock });
        h.settle().await;

        assert_eq!(h.sink.state.lock().unwrap().locally_complete, 1);
        assert_eq!(h.factory.log.lock().unwrap().applied_commits.len(), 1);

        txn.completion_received();
        h.settle().await;

        let sink = h.sink.state.lock().unwrap();
        assert_eq!(sink.finished, 1);
        assert_eq!(h.factory.log.lock().unwrap().globally_complete, 1);
        assert_eq!(txn.status().stage, "done");
    }

    #[tokio::test]
    async fn duplicate_outcomes_are_ignored() {
        let h = Harness::new(HashMap::new());
        let txn = h.spawn_voter(&body(&[1]));
        h.settle().await;

        let clock: VectorClock = [(var_id(1), 3)].into_iter().collect();
        for _ in 0..3 {
            txn.ballot_outcome_received(Outcome::Commit {
                clock: clock.clone(),
            });
            h.settle().await;
        }

        assert_eq!(h.factory.log.lock().unwrap().applied_commits.len(), 1);
        assert_eq!(h.sink.state.lock().unwrap().locally_complete, 1);
    }

    #[tokio::test]
    async fn first_abort_vote_releases_voted_frames_early() {
        let abort_votes = [(var_id(1), true), (var_id(2), true)].into_iter().collect();
        let h = Harness::new(abort_votes);
        let txn = h.spawn_voter(&body(&[1, 2]));
        h.settle().await;

        {
            let sink = h.sink.state.lock().unwrap();
            assert_eq!(sink.ballots.len(), 1);
            assert!(sink.ballots[0].iter().all(Ballot::is_abort));
        }
        assert!(txn.status().pre_aborted);
        let released: usize = [var_id(1), var_id(2)]
            .into_iter()
            .filter_map(|v| h.factory.frame(v))
            .map(|f| f.state.lock().unwrap().write_aborted)
            .sum();
        assert_eq!(released, 2);

        txn.ballot_outcome_received(Outcome::Abort {
            ballots: Vec::new(),
        });
        h.settle().await;
        assert_eq!(h.sink.state.lock().unwrap().locally_complete, 1);
        // Aborted transactions never touch variables from the outcome path.
        assert_eq!(h.factory.log.lock().unwrap().applied_aborts, 0);

        txn.completion_received();
        h.settle().await;
        assert_eq!(h.sink.state.lock().unwrap().finished, 1);
        assert_eq!(h.factory.log.lock().unwrap().globally_complete, 0);
    }

    #[tokio::test]
    #[should_panic(expected = "consensus outcome is commit")]
    async fn commit_after_pre_abort_is_fatal() {
        let abort_votes = [(var_id(1), true)].into_iter().collect();
        let h = Harness::new(abort_votes);
        let txn = h.spawn_voter(&body(&[1]));
        h.settle().await;
        assert!(txn.status().pre_aborted);

        txn.ballot_outcome_received(Outcome::Commit {
            clock: VectorClock::new(),
        });
    }

    #[tokio::test]
    #[should_panic(expected = "completion received with txn in stage")]
    async fn completion_before_local_completion_is_fatal() {
        let h = Harness::new(HashMap::new());
        let txn = h.spawn_voter(&body(&[1]));
        h.settle().await;
        // Still awaiting the outcome.
        txn.completion_received();
    }

    #[tokio::test]
    async fn immigration_enters_at_receive_outcome_with_preset_clocks() {
        let h = Harness::new(HashMap::new());
        let caps: Vec<VarCap> = (1..=3u8)
            .map(|n| VarCap {
                id: var_id(n),
                positions: Positions::new(),
                write_txn_id: TxnId([n; TXN_ID_LEN]),
                write_txn_clock: [(var_id(n), n as u64)].into_iter().collect(),
                writes_clock: VectorClock::new(),
            })
            .collect();

        let txn = Txn::immigration_from_caps(
            h.exe.clone(),
            h.dispatcher.clone(),
            h.sink.clone(),
            txn_id(9),
            caps,
        );
        h.settle().await;

        {
            let sink = h.sink.state.lock().unwrap();
            assert!(sink.ballots.is_empty());
            assert_eq!(sink.locally_complete, 1);
        }
        {
            let log = h.factory.log.lock().unwrap();
            assert_eq!(log.votes, 0);
            assert_eq!(log.applied_commits.len(), 3);
            for (v, clock) in &log.applied_commits {
                assert_eq!(clock.at(*v), v.0[0] as u64);
            }
        }

        txn.completion_received();
        h.settle().await;
        assert_eq!(h.sink.state.lock().unwrap().finished, 1);
    }
}
