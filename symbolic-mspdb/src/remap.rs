use crate::error::{PdbErrorKind, Result};
use crate::symbols::MethodRecord;

/// The metadata table tag of method definition tokens.
const METHOD_DEF_TABLE: u32 = 0x0600_0000;

/// Rewrites method tokens through the optional remap table of the DBI stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRemap {
    table: Option<Vec<u32>>,
}

impl TokenRemap {
    /// Creates a remapper from a table of new row numbers, indexed by old row number.
    pub fn new(table: Vec<u32>) -> Self {
        Self { table: Some(table) }
    }

    /// Creates a remapper that leaves every token unchanged.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Returns `true` if tokens pass through unchanged.
    pub fn is_identity(&self) -> bool {
        self.table.is_none()
    }

    /// Maps `token` to its new method definition token.
    pub fn remap(&self, token: u32) -> Result<u32> {
        let Some(table) = &self.table else {
            return Ok(token);
        };
        table
            .get((token & 0x00ff_ffff) as usize)
            .map(|row| METHOD_DEF_TABLE | row)
            .ok_or_else(|| PdbErrorKind::TokenRemapOutOfRange(token).into())
    }

    /// Rewrites every method token referenced by `method`.
    pub(crate) fn apply(&self, method: &mut MethodRecord) -> Result<()> {
        if self.is_identity() {
            return Ok(());
        }

        method.token = self.remap(method.token)?;
        if let Some(token) = &mut method.forward_token {
            *token = self.remap(*token)?;
        }
        if let Some(token) = &mut method.forward_module_token {
            *token = self.remap(*token)?;
        }
        if let Some(info) = &mut method.async_info {
            info.kickoff_method = self.remap(info.kickoff_method)?;
            for point in &mut info.sync_points {
                point.continuation_method = self.remap(point.continuation_method)?;
            }
        }
        Ok(())
    }
}
