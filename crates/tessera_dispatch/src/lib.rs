//! Cooperative task dispatch for the Tessera coordination engine.
//!
//! Every coordination component runs on an [`executor::Executor`]: a
//! single-threaded FIFO task queue with a terminated signal. Components
//! never block inside a task; anything that must wait is split into a
//! follow-up task enqueued from a callback.

pub mod executor;
