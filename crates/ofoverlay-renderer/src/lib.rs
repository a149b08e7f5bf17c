//! OpenFlow overlay policy renderer.
//!
//! Compiles a group-based policy snapshot, the switch inventory and the
//! endpoint registry into per-switch flow tables, and keeps the southbound
//! store converged as any of them change.
//!
//! # Architecture
//!
//! ```text
//! SwitchRegistry ──┐
//! EndpointRegistry ├─ events ─▶ PolicyManager ─ trigger ─▶ DebouncedTask
//! PolicyResolver ──┘                                          │
//!                                                             ▼
//!                         Pipeline (7 stages) ─▶ FlowMap ─▶ diff & commit ─▶ FlowStore
//! ```
//!
//! Each run reads one policy snapshot, computes every stage for every ready
//! switch and commits only the difference from what the store holds.

pub mod commit;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod ovsdb;
pub mod pipeline;
pub mod policy;
pub mod switch;

pub use commit::{commit_flow_map, CommitSummary, TableOutcome};
pub use config::{ConfigOverrides, LearningMode, RendererConfig, StoreConfig};
pub use context::{EndpointOrdinals, OfContext};
pub use endpoint::{Endpoint, EndpointEvent, EndpointManager, EndpointRegistry};
pub use error::{RendererError, Result, StageError};
pub use manager::{PolicyManager, RunSummary};
pub use ovsdb::{OvsdbNodeEvent, ProviderMappingListener};
pub use pipeline::{Pipeline, PipelineStage, PipelineTables, StageKind};
pub use policy::{PolicyEvent, PolicyInfo, PolicyProvider, PolicyResolver};
pub use switch::{SwitchEvent, SwitchManager, SwitchRegistry, TunnelConfig};
