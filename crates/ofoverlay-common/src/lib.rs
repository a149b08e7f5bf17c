//! Flow reconciliation framework for the OpenFlow overlay renderer.
//!
//! This crate provides the pieces that turn computed flows into a converged
//! southbound store, independent of any particular policy model:
//!
//! - [`FlowEntry`] / [`FlowKey`]: flow entries and their semantic identity
//! - [`FlowMap`]: per (switch, table) staging buffer with semantic dedup
//! - [`FlowStore`]: southbound store seam, with [`MemoryFlowStore`] and a
//!   Redis implementation behind the `redis` feature
//! - [`DebouncedTask`]: coalesces bursts of triggers into single runs
//! - [`OrdinalAllocator`]: stable small integers for register fields
//! - [`TableIdMapper`]: logical stage index to physical table id
//!
//! # Reconciliation model
//!
//! 1. A change anywhere in policy, topology or endpoints triggers the scheduler
//! 2. After the quiescence delay one run computes every table into a `FlowMap`
//! 3. Each staged table is diffed against the store under semantic equality
//! 4. Only the difference is written, one transaction per table
//!
//! Every run recomputes the full desired state, so a failed read or commit
//! is repaired by the next run without any retry bookkeeping.

mod flow;
mod flow_map;
mod ordinal;
#[cfg(feature = "redis")]
mod redis_store;
mod scheduler;
mod store;
mod table_id;

pub use flow::{Action, FlowEntry, FlowId, FlowKey, FlowMatch, Reg, TableId, TablePath};
pub use flow_map::{FlowMap, TableFlows};
pub use ordinal::{OrdinalAllocator, OrdinalError, OrdinalKey};
#[cfg(feature = "redis")]
pub use redis_store::{RedisConfig, RedisFlowStore};
pub use scheduler::{DebouncedTask, ReconcileTask};
pub use store::{FlowStore, MemoryFlowStore, StoreError, StoreResult, StoreStats, TableTransaction};
pub use table_id::{ConfigurationError, TableIdMapper, MAX_TABLE_ID};
