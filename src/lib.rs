//! # Agent Coordination Core
//!
//! The coordination core of a distributed multi-agent work system: workers
//! bound to heterogeneous external LLM backends cooperatively consume
//! code-modification tasks from priority-aware queues backed by a single
//! shared key-value/pub-sub store.
//!
//! ## Architecture
//!
//! - **Store Adapter**: typed façade over the KV/pub-sub primitives
//!   ([`store`]).
//! - **Priority Queue Engine**: weighted-fair, starvation-free scheduling
//!   with deduplication ([`queue`]).
//! - **File Lock Manager**: leased mutual exclusion over file paths
//!   ([`locks`]).
//! - **Agent Registry**: liveness tracking and state transitions
//!   ([`registry`]).
//! - **Dispatcher / Worker Loop**: per-agent pipeline composing the above
//!   ([`dispatcher`]).
//! - **Consensus Coordinator**: bounded-quorum voting ([`consensus`]).
//! - **Observability Hooks**: structured events and snapshots
//!   ([`monitoring`]).
//!
//! The external LLM clients themselves are out of scope; the core only
//! needs the opaque `invoke(model, prompt) → text` seam ([`backend`]).

/// Backend invocation seam: trait, circuit breaker, HTTP client.
pub mod backend;
/// Environment-driven configuration and priority-rules loading.
pub mod config;
/// System-wide default values.
pub mod constants;
/// Consensus & governance coordinator.
pub mod consensus;
/// Dispatcher / worker loop pipeline.
pub mod dispatcher;
/// Error types and handling.
pub mod error;
/// File lock manager.
pub mod locks;
/// Core data models.
pub mod models;
/// Observability hooks: structured events and snapshots.
pub mod monitoring;
/// Priority queue engine.
pub mod queue;
/// Agent registry and heartbeat.
pub mod registry;
/// Store adapter: typed façade over the KV/pub-sub substrate.
pub mod store;

pub use error::{CoreError, Result};
