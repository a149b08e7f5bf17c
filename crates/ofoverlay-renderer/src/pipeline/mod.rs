//! The flow pipeline: one stage per flow table.
//!
//! | Index | Stage | Role |
//! |-------|-------|------|
//! | 0 | [`PortSecurity`] | admit traffic from known (port, MAC, IP) |
//! | 1 | [`IngressNat`] | translate inbound NAT addresses |
//! | 2 | [`SourceMapper`] | classify the source into registers |
//! | 3 | [`DestinationMapper`] | classify the destination, choose output |
//! | 4 | [`PolicyEnforcer`] | apply contracts between groups |
//! | 5 | [`EgressNat`] | translate outbound NAT addresses |
//! | 6 | [`ExternalMapper`] | final output |
//!
//! Physical table ids are `offset + index`. Table 0 must stay populated on
//! a switch, so the default offset is 0.

mod destination_mapper;
mod egress_nat;
mod external_mapper;
mod ingress_nat;
mod policy_enforcer;
mod port_security;
mod source_mapper;

pub use destination_mapper::DestinationMapper;
pub use egress_nat::EgressNat;
pub use external_mapper::ExternalMapper;
pub use ingress_nat::IngressNat;
pub use policy_enforcer::PolicyEnforcer;
pub use port_security::PortSecurity;
pub use source_mapper::SourceMapper;

use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{ConfigurationError, FlowEntry, TableId, TableIdMapper};
use ofoverlay_types::NodeId;
use std::fmt;

/// Logical position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    PortSecurity,
    IngressNat,
    SourceMapper,
    DestinationMapper,
    PolicyEnforcer,
    EgressNat,
    ExternalMapper,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::PortSecurity,
        StageKind::IngressNat,
        StageKind::SourceMapper,
        StageKind::DestinationMapper,
        StageKind::PolicyEnforcer,
        StageKind::EgressNat,
        StageKind::ExternalMapper,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::PortSecurity => "PortSecurity",
            StageKind::IngressNat => "IngressNat",
            StageKind::SourceMapper => "SourceMapper",
            StageKind::DestinationMapper => "DestinationMapper",
            StageKind::PolicyEnforcer => "PolicyEnforcer",
            StageKind::EgressNat => "EgressNat",
            StageKind::ExternalMapper => "ExternalMapper",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of stages, and so of tables, in the pipeline.
pub const STAGE_COUNT: u8 = StageKind::ALL.len() as u8;

/// Physical table ids of all stages under one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTables {
    mapper: TableIdMapper,
}

impl PipelineTables {
    pub fn new(offset: TableId) -> Result<Self, ConfigurationError> {
        Ok(Self {
            mapper: TableIdMapper::new(offset, STAGE_COUNT)?,
        })
    }

    pub fn table(&self, kind: StageKind) -> TableId {
        self.mapper.table_id(kind.index())
    }

    pub fn offset(&self) -> TableId {
        self.mapper.offset()
    }

    /// All physical ids, in stage order.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.mapper.table_ids()
    }
}

/// Computes the flows of one table.
///
/// Implementations must be deterministic: the same switch, snapshot and
/// topology always yield the same flows in the same order. A stage reads
/// only inventory and policy, never other stages' flows.
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Physical table this stage writes.
    fn table_id(&self) -> TableId;

    /// Returns the flows for `node`. On error the stage contributes nothing
    /// for this switch in this run.
    fn compute(
        &self,
        ctx: &OfContext,
        node: &NodeId,
        policy: &PolicyInfo,
    ) -> Result<Vec<FlowEntry>, StageError>;
}

/// Ordered stage list bound to one table offset.
pub struct Pipeline {
    tables: PipelineTables,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    /// Builds the standard seven-stage pipeline.
    pub fn new(offset: TableId) -> Result<Self, ConfigurationError> {
        let tables = PipelineTables::new(offset)?;
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(PortSecurity::new(tables)),
            Box::new(IngressNat::new(tables)),
            Box::new(SourceMapper::new(tables)),
            Box::new(DestinationMapper::new(tables)),
            Box::new(PolicyEnforcer::new(tables)),
            Box::new(EgressNat::new(tables)),
            Box::new(ExternalMapper::new(tables)),
        ];
        Ok(Self { tables, stages })
    }

    /// Builds a pipeline from custom stages.
    pub fn with_stages(tables: PipelineTables, stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { tables, stages }
    }

    pub fn tables(&self) -> PipelineTables {
        self.tables
    }

    pub fn offset(&self) -> TableId {
        self.tables.offset()
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.table_ids()
    }

    pub fn stages(&self) -> &[Box<dyn PipelineStage>] {
        &self.stages
    }
}

/// Builds the flow id `<stage>|<part>|<part>...`.
///
/// Ids only need to be unique within a table; every part that tells two
/// flows of a stage apart goes into the id.
pub(crate) fn flow_id<I, P>(stage: StageKind, parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: fmt::Display,
{
    let mut id = stage.name().to_ascii_lowercase();
    for part in parts {
        id.push('|');
        id.push_str(&part.to_string());
    }
    id
}

#[cfg(test)]
pub(crate) mod testing;
