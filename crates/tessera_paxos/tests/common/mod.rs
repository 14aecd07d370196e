//! Shared helpers for coordination tests: a recording sender, an in-memory
//! proposer store, scripted variables, and a single-RM cluster harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_dispatch::executor::Executor;
use tessera_paxos::coordinator::{
    Config, Message, ProposerManager, ProposerStore, Sender, Topology,
};
use tessera_txn::engine::{
    Action, ActionKind, ActionMeta, ActionRef, Allocation, Ballot, Frame, Positions, RMId, Txn,
    TxnBody, TxnId, TxnLocalStateChange, Var, VarDispatcher, VarFactory, VarId, VectorClock,
    TXN_ID_LEN, VAR_ID_LEN,
};

pub fn tid(n: u8) -> TxnId {
    TxnId([n; TXN_ID_LEN])
}

pub fn vid(n: u8) -> VarId {
    VarId([n; VAR_ID_LEN])
}

pub fn create_action(var: u8) -> Action {
    Action {
        var_id: vid(var),
        kind: ActionKind::Create {
            positions: Positions::new(),
        },
        meta: ActionMeta::default(),
    }
}

/// Build a transaction body from (rm, boot, action indices) allocations and
/// a list of created variables.
pub fn body(
    id: u8,
    topology_version: u32,
    f_inc: u32,
    allocs: &[(RMId, u32, &[u16])],
    vars: &[u8],
) -> TxnBody {
    TxnBody {
        id: tid(id),
        topology_version,
        f_inc,
        allocations: allocs
            .iter()
            .map(|(rm_id, active, indices)| Allocation {
                rm_id: *rm_id,
                active: *active,
                action_indices: indices.to_vec(),
            })
            .collect(),
        actions: vars.iter().map(|v| create_action(*v)).collect(),
    }
}

pub fn topology(version: u32, next: Option<u32>, removed: &[RMId]) -> Topology {
    Topology {
        version,
        next: next.map(|version| tessera_paxos::coordinator::NextTopology { version }),
        rms_removed: removed.iter().copied().collect(),
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(RMId, Message)>>,
}

impl Sender for RecordingSender {
    fn send(&self, to: RMId, msg: Message) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((to, msg));
        Ok(())
    }
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(RMId, Message)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<(RMId, Message)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn tlc_count_to(&self, to: RMId) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(rm, msg)| *rm == to && matches!(msg, Message::TxnLocallyComplete { .. }))
            .count()
    }

    pub fn one_a_instances(&self) -> Vec<RMId> {
        let mut instances: Vec<RMId> = self
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, msg)| match msg {
                Message::OneATxnVotes { votes, .. } => Some(votes.rm_id),
                _ => None,
            })
            .collect();
        instances.sort_unstable();
        instances.dedup();
        instances
    }

    pub fn two_a_ballots(&self) -> Vec<Ballot> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find_map(|(_, msg)| match msg {
                Message::TwoATxnVotes { votes, .. } => {
                    Some(votes.acceptances.iter().map(|a| a.ballot.clone()).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MemStore {
    entries: Mutex<HashMap<TxnId, Vec<u8>>>,
}

impl ProposerStore for MemStore {
    fn save(&self, txn_id: TxnId, data: Vec<u8>) -> anyhow::Result<()> {
        self.entries.lock().unwrap().insert(txn_id, data);
        Ok(())
    }

    fn remove(&self, txn_id: TxnId) -> anyhow::Result<()> {
        self.entries.lock().unwrap().remove(&txn_id);
        Ok(())
    }

    fn load_all(&self) -> anyhow::Result<Vec<(TxnId, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}

impl MemStore {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn insert_raw(&self, txn_id: TxnId, data: Vec<u8>) {
        self.entries.lock().unwrap().insert(txn_id, data);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VoteScript {
    Commit,
    Deadlock,
}

#[derive(Default)]
pub struct VarLog {
    pub created: usize,
    pub votes: usize,
    pub applied_commits: Vec<(VarId, VectorClock)>,
    pub applied_aborts: usize,
    pub globally_complete: usize,
}

struct NoopFrame;

impl Frame for NoopFrame {
    fn read_aborted(&self, _action: &ActionRef) {}
    fn write_aborted(&self, _action: &ActionRef, _retain_locks: bool) {}
    fn read_write_aborted(&self, _action: &ActionRef, _retain_locks: bool) {}
}

struct ScriptedVar {
    var_id: VarId,
    script: VoteScript,
    log: Arc<Mutex<VarLog>>,
}

impl Var for ScriptedVar {
    fn receive_txn(&mut self, action: &ActionRef) {
        self.log.lock().unwrap().votes += 1;
        action.set_frame(Arc::new(NoopFrame));
        match self.script {
            VoteScript::Commit => {
                action.vote_commit(VectorClock::new(), None);
            }
            VoteScript::Deadlock => action.vote_deadlock(VectorClock::new()),
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

pub struct ScriptedFactory {
    scripts: HashMap<VarId, VoteScript>,
    pub log: Arc<Mutex<VarLog>>,
}

impl ScriptedFactory {
    pub fn new(scripts: HashMap<VarId, VoteScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            log: Arc::new(Mutex::new(VarLog::default())),
        })
    }
}

impl VarFactory for ScriptedFactory {
    fn create(&self, var_id: VarId) -> Box<dyn Var> {
        let mut log = self.log.lock().unwrap();
        log.created += 1;
        drop(log);
        Box::new(ScriptedVar {
            var_id,
            script: self
                .scripts
                .get(&var_id)
                .copied()
                .unwrap_or(VoteScript::Commit),
            log: self.log.clone(),
        })
    }
}

/// Recording state-change sink for transactions driven outside a proposer
/// (immigration).
#[derive(Default)]
pub struct RecordingStateChange {
    pub ballots: Mutex<Vec<Vec<Ballot>>>,
    pub locally_complete: Mutex<Vec<Arc<Txn>>>,
    pub finished: Mutex<usize>,
}

impl TxnLocalStateChange for RecordingStateChange {
    fn txn_ballots_complete(&self, ballots: Vec<Ballot>) {
        self.ballots.lock().unwrap().push(ballots);
    }

    fn txn_locally_complete(&self, txn: &Arc<Txn>) {
        self.locally_complete.lock().unwrap().push(txn.clone());
    }

    fn txn_finished(&self, _txn: &Arc<Txn>) {
        *self.finished.lock().unwrap() += 1;
    }
}

/// One RM's coordination stack wired to in-memory collaborators.
pub struct Cluster {
    pub exe: Executor,
    pub dispatcher: VarDispatcher,
    pub factory: Arc<ScriptedFactory>,
    pub sender: Arc<RecordingSender>,
    pub store: Arc<MemStore>,
    pub manager: ProposerManager,
}

impl Cluster {
    pub fn new(rm_id: RMId, boot_count: u32, scripts: HashMap<VarId, VoteScript>) -> Self {
        Self::with_collaborators(
            rm_id,
            boot_count,
            scripts,
            Arc::new(RecordingSender::default()),
            Arc::new(MemStore::default()),
        )
    }

    pub fn with_collaborators(
        rm_id: RMId,
        boot_count: u32,
        scripts: HashMap<VarId, VoteScript>,
        sender: Arc<RecordingSender>,
        store: Arc<MemStore>,
    ) -> Self {
        let exe = Executor::new("proposer");
        let factory = ScriptedFactory::new(scripts);
        let dispatcher = VarDispatcher::new(4, factory.clone());
        let manager = ProposerManager::new(
            exe.clone(),
            Config { rm_id, boot_count },
            dispatcher.clone(),
            sender.clone(),
            store.clone(),
        );
        Self {
            exe,
            dispatcher,
            factory,
            sender,
            store,
            manager,
        }
    }

    /// Drain the hand-offs that bounce between the proposer executor, the
    /// variable shards, and spawned one-shot senders.
    pub async fn settle(&self) {
        for _ in 0..5 {
            self.exe.flush().await;
            self.dispatcher.flush().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.exe.flush().await;
    }

    pub async fn install_topology(&self, topology: Topology) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.manager.topology_changed(topology, move |ok| {
            let _ = tx.send(ok);
        });
        assert!(rx.await.unwrap(), "topology change did not run");
    }
}
