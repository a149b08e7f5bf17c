//! Mapping of logical pipeline stages to physical table ids.

use crate::flow::TableId;
use thiserror::Error;

/// Highest table id a switch accepts (0xff is reserved for "all tables").
pub const MAX_TABLE_ID: TableId = 254;

/// Invalid renderer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error(
        "Table offset {offset} out of range: highest table id would be {highest}, maximum is {max_table_id}"
    )]
    TableIdOutOfRange {
        offset: TableId,
        highest: u16,
        max_table_id: TableId,
    },
}

/// Maps logical stage indexes `0..stage_count` to
/// `offset + index`, guaranteeing every id is at most [`MAX_TABLE_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIdMapper {
    offset: TableId,
    stage_count: u8,
}

impl TableIdMapper {
    pub fn new(offset: TableId, stage_count: u8) -> Result<Self, ConfigurationError> {
        Self::verify_offset(offset, stage_count)?;
        Ok(Self { offset, stage_count })
    }

    /// Fails if `offset + highest logical index` exceeds [`MAX_TABLE_ID`].
    pub fn verify_offset(offset: TableId, stage_count: u8) -> Result<(), ConfigurationError> {
        let highest = u16::from(offset) + u16::from(stage_count.saturating_sub(1));
        if highest > u16::from(MAX_TABLE_ID) {
            return Err(ConfigurationError::TableIdOutOfRange {
                offset,
                highest,
                max_table_id: MAX_TABLE_ID,
            });
        }
        Ok(())
    }

    /// Returns a mapper with a new offset, leaving `self` untouched on error.
    pub fn with_offset(&self, offset: TableId) -> Result<Self, ConfigurationError> {
        Self::new(offset, self.stage_count)
    }

    pub fn offset(&self) -> TableId {
        self.offset
    }

    pub fn stage_count(&self) -> u8 {
        self.stage_count
    }

    /// Physical id of a logical stage; valid for `index < stage_count`.
    pub fn table_id(&self, index: u8) -> TableId {
        debug_assert!(index < self.stage_count);
        self.offset + index
    }

    /// All physical ids, in stage order.
    pub fn table_ids(&self) -> Vec<TableId> {
        (0..self.stage_count).map(|i| self.offset + i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_ids_follow_offset() {
        let mapper = TableIdMapper::new(10, 7).unwrap();
        assert_eq!(mapper.table_ids(), vec![10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(mapper.table_id(2), 12);
    }

    #[test]
    fn test_offset_upper_bound() {
        assert!(TableIdMapper::new(248, 7).is_ok());
        let err = TableIdMapper::new(250, 7).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::TableIdOutOfRange {
                offset: 250,
                highest: 256,
                max_table_id: 254
            }
        );
        assert!(TableIdMapper::verify_offset(255, 1).is_err());
    }

    #[test]
    fn test_with_offset_keeps_original_on_error() {
        let mapper = TableIdMapper::new(0, 7).unwrap();
        assert!(mapper.with_offset(250).is_err());
        assert_eq!(mapper.offset(), 0);
        assert_eq!(mapper.with_offset(5).unwrap().table_ids()[0], 5);
    }
}
