//! Line information of a module and its source files.
//!
//! The line region of a module stream is a sequence of subsections framed as
//! `[u32 kind][u32 length][payload]`. File checksum subsections list the module's source files,
//! and each lines subsection holds the line blocks of one method, keyed only by the method's
//! `(segment, address)`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::cursor::ByteCursor;
use crate::error::{PdbError, PdbErrorKind, Result};
use crate::symbols::MethodRecord;

const DEBUG_S_IGNORE: u32 = 0x8000_0000;
const DEBUG_S_LINES: u32 = 0xf2;
const DEBUG_S_FILECHKSMS: u32 = 0xf4;

/// Set in the flags of a lines subsection if column information follows the line numbers.
const CV_LINES_HAVE_COLUMNS: u16 = 0x0001;

/// The document type of plain text source files.
pub const DOCUMENT_TYPE_TEXT: Uuid = uuid::uuid!("5a869d0b-6611-11d3-bd2a-0000f80849bd");

/// The language vendor GUID of Microsoft compilers.
pub const VENDOR_MICROSOFT: Uuid = uuid::uuid!("994b45c4-e6e9-11d2-903f-00c04fa302a1");

const LANGUAGE_C: Uuid = uuid::uuid!("63a08714-fc37-11d2-904c-00c04fa302a1");
const LANGUAGE_CPP: Uuid = uuid::uuid!("3a12d0b7-c26c-11d0-b442-00a0244a1dd2");
const LANGUAGE_CSHARP: Uuid = uuid::uuid!("3f5162f8-07c6-11d3-9053-00c04fa302a1");
const LANGUAGE_VISUAL_BASIC: Uuid = uuid::uuid!("3a12d0b8-c26c-11d0-b442-00a0244a1dd2");
const LANGUAGE_FSHARP: Uuid = uuid::uuid!("ab4f38c9-b6e6-43ba-be3b-58080b2ccce3");

/// The source language of a [`SourceFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub enum Language {
    /// The language GUID is nil or not recognized.
    Unknown,
    /// C
    C,
    /// C++
    Cpp,
    /// C#
    CSharp,
    /// Visual Basic
    VisualBasic,
    /// F#
    FSharp,
}

impl Language {
    /// Maps a language GUID to a known language.
    pub fn from_guid(guid: Uuid) -> Self {
        match guid {
            LANGUAGE_C => Self::C,
            LANGUAGE_CPP => Self::Cpp,
            LANGUAGE_CSHARP => Self::CSharp,
            LANGUAGE_VISUAL_BASIC => Self::VisualBasic,
            LANGUAGE_FSHARP => Self::FSharp,
            _ => Self::Unknown,
        }
    }

    /// Returns the name of the language.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::VisualBasic => "visualbasic",
            Self::FSharp => "fsharp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A source file referenced by line information.
///
/// Source files are shared between all line tables of one PDB that name the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SourceFile {
    /// The path of the file as recorded by the compiler.
    pub name: String,
    /// The language GUID, nil if unknown.
    pub language: Uuid,
    /// The language vendor GUID, nil if unknown.
    pub vendor: Uuid,
    /// The document type GUID.
    pub document_type: Uuid,
    /// The checksum algorithm GUID of the file stream, nil if not recorded.
    pub algorithm: Uuid,
    /// The checksum recorded in the file stream.
    pub algorithm_checksum: Vec<u8>,
    /// The source text embedded into the PDB, if any.
    pub embedded_source: Option<Vec<u8>>,
    /// The checksum kind of the module's checksum record.
    pub checksum_kind: u8,
    /// The checksum bytes of the module's checksum record.
    pub checksum: Vec<u8>,
}

impl SourceFile {
    /// Creates a source file without file stream information.
    pub fn new(name: String) -> Self {
        Self {
            name,
            language: Uuid::nil(),
            vendor: Uuid::nil(),
            document_type: DOCUMENT_TYPE_TEXT,
            algorithm: Uuid::nil(),
            algorithm_checksum: Vec::new(),
            embedded_source: None,
            checksum_kind: 0,
            checksum: Vec::new(),
        }
    }

    /// The source language of this file.
    pub fn language(&self) -> Language {
        Language::from_guid(self.language)
    }

    /// Decodes the `/SRC/FILES/<NAME>` stream of this file.
    pub(crate) fn read_file_stream(&mut self, cursor: &mut ByteCursor) -> Result<()> {
        cursor.set_position(0)?;
        self.language = cursor.read_guid()?;
        self.vendor = cursor.read_guid()?;
        self.document_type = cursor.read_guid()?;
        if cursor.remaining() == 0 {
            return Ok(());
        }

        self.algorithm = cursor.read_guid()?;
        let checksum_size = cursor.read_i32()?.max(0) as usize;
        let source_size = cursor.read_i32()?.max(0) as usize;
        self.algorithm_checksum = cursor.read_bytes(checksum_size)?.to_vec();
        if source_size > 0 {
            self.embedded_source = Some(cursor.read_bytes(source_size)?.to_vec());
        }
        Ok(())
    }
}

/// One entry of a line table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LineRecord {
    /// The IL offset within the method.
    pub offset: u32,
    /// The first line of the source range.
    pub start_line: u32,
    /// The last line of the source range.
    pub end_line: u32,
    /// The first column, `0` if columns are not recorded.
    pub start_column: u16,
    /// The column after the range, `0` if columns are not recorded.
    pub end_column: u16,
}

/// The lines one source file contributes to a method, ordered by IL offset.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LineTable {
    /// The offset of the file's checksum record.
    pub file_id: u32,
    /// The source file, `None` if the module has no checksum record at `file_id`.
    pub file: Option<Arc<SourceFile>>,
    /// The line records.
    pub lines: Vec<LineRecord>,
}

/// Resolves file names from checksum records to shared [`SourceFile`]s.
pub(crate) trait SourceFileLoader {
    /// Returns the source file for `name_id`, creating it with the given checksum if it has not
    /// been seen before.
    fn load(&mut self, name_id: u32, checksum_kind: u8, checksum: &[u8])
        -> Result<Arc<SourceFile>>;
}

/// The source files of one module, keyed by the offset of their checksum record.
#[derive(Debug, Default)]
pub(crate) struct ChecksumTable {
    files: HashMap<u32, Arc<SourceFile>>,
}

impl ChecksumTable {
    /// Decodes all checksum subsections of the line region `start..end`.
    pub(crate) fn parse(
        cursor: &mut ByteCursor,
        start: usize,
        end: usize,
        loader: &mut dyn SourceFileLoader,
    ) -> Result<Self> {
        let mut files = HashMap::new();
        for subsection in subsections(cursor, start, end)? {
            if subsection.kind != DEBUG_S_FILECHKSMS {
                continue;
            }
            cursor.set_position(subsection.start)?;
            while cursor.position() < subsection.end {
                let file_id = (cursor.position() - subsection.start) as u32;
                let name_id = cursor.read_u32()?;
                let len = cursor.read_u8()? as usize;
                let kind = cursor.read_u8()?;
                let checksum = cursor.read_bytes(len)?;
                let file = loader.load(name_id, kind, checksum)?;
                files.insert(file_id, file);
                cursor.align(4)?;
            }
        }
        Ok(Self { files })
    }

    /// Returns the source file of a checksum record.
    pub(crate) fn get(&self, file_id: u32) -> Option<&Arc<SourceFile>> {
        self.files.get(&file_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Subsection {
    kind: u32,
    start: usize,
    end: usize,
}

/// Collects the subsection frames of the line region `start..end`.
fn subsections(cursor: &mut ByteCursor, start: usize, end: usize) -> Result<Vec<Subsection>> {
    let mut subsections = Vec::new();
    cursor.set_position(start)?;
    while cursor.position() < end {
        let kind = cursor.read_u32()?;
        let len = cursor.read_u32()? as usize;
        let start = cursor.position();
        let stop = start + len;
        if stop > end {
            return Err(PdbError::from(PdbErrorKind::UnexpectedEof).at(start - 8));
        }
        if kind & DEBUG_S_IGNORE == 0 {
            subsections.push(Subsection {
                kind,
                start,
                end: stop,
            });
        }
        cursor.set_position(stop)?;
        cursor.align(4)?;
    }
    Ok(subsections)
}

/// Finds the method a lines subsection at `(segment, address)` belongs to.
///
/// Several methods can share one address. The block goes to the first of them that has no lines
/// yet; if all of them already have lines, it is dropped.
fn find_method(
    methods: &[MethodRecord],
    assigned: &[bool],
    segment: u16,
    address: u32,
) -> Option<usize> {
    let key = |m: &MethodRecord| (m.segment, m.address);
    let mut index = methods
        .binary_search_by(|m| key(m).cmp(&(segment, address)))
        .ok()?;

    if !assigned[index] {
        while index > 0 && !assigned[index - 1] && key(&methods[index - 1]) == (segment, address) {
            index -= 1;
        }
    } else {
        while assigned[index]
            && index + 1 < methods.len()
            && key(&methods[index + 1]) == (segment, address)
        {
            index += 1;
        }
    }

    (!assigned[index]).then_some(index)
}

/// Decodes the lines subsections of the line region `start..end` and attaches them to `methods`.
///
/// `methods` must be sorted by segment, address and token.
#[tracing::instrument(level = "trace", name = "decode_lines", skip(cursor, checksums, methods))]
pub(crate) fn decode_lines(
    cursor: &mut ByteCursor,
    start: usize,
    end: usize,
    checksums: &ChecksumTable,
    methods: &mut [MethodRecord],
) -> Result<()> {
    let mut assigned = vec![false; methods.len()];

    for subsection in subsections(cursor, start, end)? {
        if subsection.kind != DEBUG_S_LINES {
            continue;
        }
        cursor.set_position(subsection.start)?;
        let address = cursor.read_u32()?;
        let segment = cursor.read_u16()?;
        let flags = cursor.read_u16()?;
        let _code_size = cursor.read_u32()?;

        let Some(index) = find_method(methods, &assigned, segment, address) else {
            tracing::debug!(segment, address, "no method for line block");
            continue;
        };

        let has_columns = flags & CV_LINES_HAVE_COLUMNS != 0;
        let mut tables = Vec::new();
        while cursor.position() < subsection.end {
            let block_start = cursor.position();
            let file_id = cursor.read_u32()?;
            let count = cursor.read_u32()? as usize;
            let _block_size = cursor.read_u32()?;

            let lines_start = cursor.position();
            let entry_size = if has_columns { 12 } else { 8 };
            let block_end = count
                .checked_mul(entry_size)
                .and_then(|size| lines_start.checked_add(size))
                .filter(|block_end| *block_end <= subsection.end)
                .ok_or_else(|| PdbError::from(PdbErrorKind::InvalidLineBlock).at(block_start))?;

            let file = checksums.get(file_id).cloned();
            if file.is_none() {
                tracing::debug!(file_id, "unresolved line block file");
            }
            let mut lines = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = cursor.read_u32()?;
                let flags = cursor.read_u32()?;
                let start_line = flags & 0x00ff_ffff;
                let delta = (flags & 0x7f00_0000) >> 24;
                lines.push(LineRecord {
                    offset,
                    start_line,
                    end_line: start_line + delta,
                    start_column: 0,
                    end_column: 0,
                });
            }
            if has_columns {
                for line in &mut lines {
                    line.start_column = cursor.read_u16()?;
                    line.end_column = cursor.read_u16()?;
                }
            }

            tables.push(LineTable {
                file_id,
                file,
                lines,
            });
            cursor.set_position(block_end)?;
        }

        methods[index].lines = tables;
        assigned[index] = true;
    }

    Ok(())
}
