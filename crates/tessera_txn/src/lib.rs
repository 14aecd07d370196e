//! Transaction engine for the Tessera coordination layer.
//!
//! This crate holds the per-transaction voting lifecycle: the identifiers
//! and transaction body model, per-variable ballots and vector clocks, the
//! five-stage transaction state machine, and the variable dispatcher that
//! serialises all work on a variable onto that variable's own executor.
//! Storage semantics live behind the `Var`/`Frame` traits; the coordination
//! layer (`tessera_paxos`) drives the lifecycle from the network side.

pub mod engine;
