//! Threshold evaluation alarming for partitioned metric streams.
//!
//! The engine consumes metric samples from a Kafka-style broker, shards them
//! by asset identity onto a pool of evaluation workers, checks each sample
//! against cached threshold profiles and pushes alarm events to an HTTP sink.
//! Offsets are committed only once every alarm raised for a message has been
//! delivered (or knowingly abandoned), giving at-least-once semantics.
//!
//! ## Architecture Overview
//!
//! ```text
//!   broker (Kafka) ──▶ dispatcher ──▶ worker[hash(asset) % N]
//!                                        │
//!                          accumulators ─┤─ threshold cache ── profile service
//!                                        │        │
//!                                        ▼        ▼ (redis)
//!                                     evaluator
//!                                        │
//!                                        ▼
//!                                  alarm dispatcher ──▶ HTTP sink
//!                                        │
//!                            result channel ──▶ offset commit
//! ```
//!
//! Each worker is a single-threaded select loop; alarm POSTs and cache writes
//! are spawned tasks whose completions funnel back through the worker's
//! result channel. A process-wide semaphore bounds concurrent POSTs.

pub mod accumulate;
pub mod alarm;
pub mod broker;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod evaluate;
pub mod metric;
pub mod stats;
pub mod supervisor;
pub mod thresholds;
pub mod worker;
