//! Source ranges of metadata tokens, stored in a dedicated module.
//!
//! Besides method line tables, compilers can record where types and other members are defined.
//! These records live in a module named [`TOKEN_SOURCE_LINE_MODULE`] as OEM records named `TSLI`,
//! and reference files through the module's own checksum table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::ByteCursor;
use crate::error::{PdbError, PdbErrorKind, Result};
use crate::lines::{ChecksumTable, SourceFile};
use crate::symbols::{read_oem_name, read_record_header, S_OEM};

/// The name of the module holding token source ranges.
pub const TOKEN_SOURCE_LINE_MODULE: &str = "TokenSourceLineInfo";

/// The source range of a metadata token.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TokenLine {
    /// The checksum record offset of the source file.
    pub file_id: u32,
    /// The source file, if the file id resolves in the module's checksum table.
    pub file: Option<Arc<SourceFile>>,
    /// The first line.
    pub line: u32,
    /// The first column.
    pub column: u32,
    /// The last line.
    pub end_line: u32,
    /// The column after the range.
    pub end_column: u32,
}

/// Collects the `TSLI` records of the token source line module, keyed by token.
///
/// Ranges of the same token are kept in record order. File references are resolved later, once
/// the module's checksum table is known.
#[tracing::instrument(level = "trace", name = "decode_token_lines", skip(cursor))]
pub(crate) fn decode_token_lines(
    cursor: &mut ByteCursor,
    symbols_end: usize,
) -> Result<HashMap<u32, Vec<TokenLine>>> {
    cursor.set_position(0)?;
    let signature = cursor.read_u32()?;
    if signature != 4 {
        return Err(PdbError::from(PdbErrorKind::InvalidModuleSignature(signature)).at(0));
    }

    let mut token_lines: HashMap<u32, Vec<TokenLine>> = HashMap::new();
    while cursor.position() < symbols_end {
        let (kind, stop) = read_record_header(cursor, symbols_end)?;
        if kind == S_OEM && read_oem_name(cursor)? == "TSLI" {
            let token = cursor.read_u32()?;
            let line = TokenLine {
                file_id: cursor.read_u32()?,
                file: None,
                line: cursor.read_u32()?,
                column: cursor.read_u32()?,
                end_line: cursor.read_u32()?,
                end_column: cursor.read_u32()?,
            };
            token_lines.entry(token).or_default().push(line);
        }
        cursor.set_position(stop)?;
    }

    Ok(token_lines)
}

/// Attaches the source files of `checksums` to all collected ranges.
pub(crate) fn resolve_files(
    token_lines: &mut HashMap<u32, Vec<TokenLine>>,
    checksums: &ChecksumTable,
) {
    for line in token_lines.values_mut().flatten() {
        line.file = checksums.get(line.file_id).cloned();
        if line.file.is_none() {
            tracing::debug!(file_id = line.file_id, "unresolved token line file");
        }
    }
}
