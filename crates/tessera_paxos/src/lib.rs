//! Paxos coordination layer for the Tessera store.
//!
//! One [`coordinator::ProposerManager`] runs per resource manager. It routes
//! every inbound coordination message, owns the live per-transaction
//! proposers and the per-(transaction, RM) Paxos instances, decides
//! admissibility under topology changes, and recovers transactions whose
//! outcomes arrive before (or instead of) their bodies. Network transport,
//! acceptor persistence and the storage engine sit behind trait seams.

pub mod coordinator;
