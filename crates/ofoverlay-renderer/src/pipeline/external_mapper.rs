//! Table 6: outputs to the port chosen by destination mapping.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::NodeId;

const OUTPUT_PRIORITY: u16 = 1;
const HAIRPIN_PRIORITY: u16 = 100;

/// Outputs to the port in reg7. Traffic is never sent back out of the
/// external port or tunnel it arrived on.
pub struct ExternalMapper {
    table: TableId,
}

impl ExternalMapper {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::ExternalMapper),
        }
    }

    fn hairpin_drop(&self, kind: &str, port: u32) -> FlowEntry {
        FlowEntry::new(
            flow_id(self.kind(), ["hairpin".to_string(), kind.to_string(), port.to_string()]),
            self.table,
            HAIRPIN_PRIORITY,
            FlowMatch::any().in_port(port).reg(Reg::Reg7, port),
            vec![Action::Drop],
        )
    }
}

impl PipelineStage for ExternalMapper {
    fn kind(&self) -> StageKind {
        StageKind::ExternalMapper
    }

    fn table_id(&self) -> TableId {
        self.table
    }

    fn compute(
        &self,
        ctx: &OfContext,
        node: &NodeId,
        _policy: &PolicyInfo,
    ) -> Result<Vec<FlowEntry>, StageError> {
        let mut flows = vec![FlowEntry::new(
            flow_id(self.kind(), ["output"]),
            self.table,
            OUTPUT_PRIORITY,
            FlowMatch::any(),
            vec![Action::OutputReg { reg: Reg::Reg7 }],
        )];
        if let Some(tunnel) = ctx.switches().tunnel(node) {
            flows.push(self.hairpin_drop("tunnel", tunnel.port.port_number()));
        }
        for external in ctx.switches().external_ports(node) {
            flows.push(self.hairpin_drop("external", external.port_number()));
        }
        Ok(flows)
    }
}
