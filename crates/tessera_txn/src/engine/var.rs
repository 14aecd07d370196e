//! Variable dispatch and the storage-facing contracts.
//!
//! Each variable is owned by exactly one shard; all work on a variable runs
//! as tasks on that shard's executor, so `Var` implementations never see
//! concurrent calls. The store supplies variables through a [`VarFactory`]
//! and exposes pending per-variable effects through [`Frame`]s.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tessera_dispatch::executor::Executor;

use super::txn::ActionRef;
use super::types::VarId;

/// A logical variable hosted by this RM.
///
/// All methods are invoked on the variable's shard executor, serially.
pub trait Var: Send {
    /// Evaluate read/write conflicts of `action` against the active frames
    /// and cast exactly one vote through the action.
    fn receive_txn(&mut self, action: &ActionRef);

    /// Apply or discard the transaction's effect once the consensus outcome
    /// is known (`action.outcome_clock()` is `None` for aborts).
    fn receive_txn_outcome(&mut self, action: &ActionRef);

    /// Release bookkeeping for a transaction every RM has now applied or
    /// discarded.
    fn txn_globally_complete(&mut self, action: &ActionRef);

    /// Drop the variable's in-memory state if nothing references it.
    fn maybe_make_inactive(&mut self);
}

/// Creates variables on demand when a transaction touches a variable this
/// RM has not yet materialised.
pub trait VarFactory: Send + Sync {
    fn create(&self, var_id: VarId) -> Box<dyn Var>;
}

/// A per-variable causal slot holding one pending transaction's tentative
/// effects. Handed to the action by the variable at vote time; notified on
/// early aborts so locks release before the outcome arrives.
pub trait Frame: Send + Sync {
    fn read_aborted(&self, action: &ActionRef);
    fn write_aborted(&self, action: &ActionRef, retain_locks: bool);
    fn read_write_aborted(&self, action: &ActionRef, retain_locks: bool);
}

struct VarShard {
    exe: Executor,
    vars: Arc<Mutex<HashMap<VarId, Box<dyn Var>>>>,
}

/// Routes work to the shard owning a variable.
#[derive(Clone)]
pub struct VarDispatcher {
    shards: Arc<[VarShard]>,
    factory: Arc<dyn VarFactory>,
}

impl VarDispatcher {
    pub fn new(num_shards: usize, factory: Arc<dyn VarFactory>) -> Self {
        let shards: Vec<VarShard> = (0..num_shards.max(1))
            .map(|_| VarShard {
                exe: Executor::new("var-shard"),
                vars: Arc::new(Mutex::new(HashMap::new())),
            })
            .collect();
        Self {
            shards: shards.into(),
            factory,
        }
    }

    fn shard_for(&self, var_id: VarId) -> &VarShard {
        let mut hasher = DefaultHasher::new();
        var_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Run `f` with the variable on the variable's own executor.
    ///
    /// With `create_if_missing` unset, `f` receives `None` when the variable
    /// does not exist locally. Returns `false` iff the shard has terminated.
    pub fn apply_to_var(
        &self,
        f: impl FnOnce(Option<&mut dyn Var>) + Send + 'static,
        create_if_missing: bool,
        var_id: VarId,
    ) -> bool {
        let shard = self.shard_for(var_id);
        let vars = shard.vars.clone();
        let factory = self.factory.clone();
        shard.exe.enqueue(move || {
            let mut vars = vars.lock().expect("var shard lock poisoned");
            if create_if_missing && !vars.contains_key(&var_id) {
                vars.insert(var_id, factory.create(var_id));
            }
            match vars.get_mut(&var_id) {
                Some(var) => f(Some(var.as_mut())),
                None => f(None),
            }
        })
    }

    /// Number of variables currently materialised across all shards.
    pub fn var_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.vars.lock().expect("var shard lock poisoned").len())
            .sum()
    }

    pub fn terminate(&self) {
        for shard in self.shards.iter() {
            shard.exe.terminate();
        }
    }

    /// Wait until every shard has drained the tasks enqueued so far.
    pub async fn flush(&self) {
        for shard in self.shards.iter() {
            shard.exe.flush().await;
        }
    }
}
