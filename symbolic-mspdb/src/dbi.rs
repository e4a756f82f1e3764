//! The DBI stream: module descriptors and the optional debug header.

use crate::cursor::ByteCursor;
use crate::error::{PdbError, PdbErrorKind, Result};

/// Marks an absent stream in 16-bit stream index fields.
const NIL_STREAM: u16 = 0xffff;

/// The fixed header at the start of the DBI stream.
///
/// Only the substream sizes are needed to find the module list and the debug header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DbiHeader {
    pub(crate) age: u32,
    pub(crate) module_list_size: u32,
    pub(crate) section_contribution_size: u32,
    pub(crate) section_map_size: u32,
    pub(crate) file_info_size: u32,
    pub(crate) type_server_map_size: u32,
    pub(crate) debug_header_size: u32,
    pub(crate) ec_info_size: u32,
}

impl DbiHeader {
    fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let _signature = cursor.read_i32()?;
        let _version = cursor.read_u32()?;
        let age = cursor.read_u32()?;
        let _global_symbols_stream = cursor.read_u16()?;
        let _build_number = cursor.read_u16()?;
        let _public_symbols_stream = cursor.read_u16()?;
        let _pdb_dll_version = cursor.read_u16()?;
        let _symbol_records_stream = cursor.read_u16()?;
        let _pdb_dll_rebuild = cursor.read_u16()?;
        let module_list_size = cursor.read_u32()?;
        let section_contribution_size = cursor.read_u32()?;
        let section_map_size = cursor.read_u32()?;
        let file_info_size = cursor.read_u32()?;
        let type_server_map_size = cursor.read_u32()?;
        let _mfc_type_server_index = cursor.read_u32()?;
        let debug_header_size = cursor.read_u32()?;
        let ec_info_size = cursor.read_u32()?;
        let _flags = cursor.read_u16()?;
        let _machine = cursor.read_u16()?;
        let _reserved = cursor.read_u32()?;

        Ok(Self {
            age,
            module_list_size,
            section_contribution_size,
            section_map_size,
            file_info_size,
            type_server_map_size,
            debug_header_size,
            ec_info_size,
        })
    }
}

/// The optional debug header at the end of the DBI stream, naming auxiliary streams.
///
/// Only the token remap stream is of interest; the others describe native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DebugHeader {
    token_rid_map: u16,
}

impl Default for DebugHeader {
    fn default() -> Self {
        Self {
            token_rid_map: NIL_STREAM,
        }
    }
}

impl DebugHeader {
    fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let _fpo = cursor.read_u16()?;
        let _exception = cursor.read_u16()?;
        let _fixup = cursor.read_u16()?;
        let _omap_to_src = cursor.read_u16()?;
        let _omap_from_src = cursor.read_u16()?;
        let _section_header = cursor.read_u16()?;
        let token_rid_map = cursor.read_u16()?;
        let _xdata = cursor.read_u16()?;
        let _pdata = cursor.read_u16()?;
        let _new_fpo = cursor.read_u16()?;
        let _original_section_header = cursor.read_u16()?;
        Ok(Self { token_rid_map })
    }

    /// The stream holding the token remap table, if any.
    pub(crate) fn token_remap_stream(&self) -> Option<u32> {
        match self.token_rid_map {
            0 | NIL_STREAM => None,
            index => Some(u32::from(index)),
        }
    }
}

/// The section contribution record at the start of each module descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SectionContribution {
    /// The section index of the contribution.
    pub section: u16,
    /// The offset of the contribution within its section.
    pub offset: u32,
    /// The size of the contribution in bytes.
    pub size: u32,
    /// COFF section characteristics.
    pub characteristics: u32,
    /// The index of the contributing module.
    pub module: u16,
    /// CRC of the contributed data.
    pub data_crc: u32,
    /// CRC of the relocations.
    pub reloc_crc: u32,
}

impl SectionContribution {
    fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let section = cursor.read_u16()?;
        let _padding = cursor.read_u16()?;
        let offset = cursor.read_u32()?;
        let size = cursor.read_u32()?;
        let characteristics = cursor.read_u32()?;
        let module = cursor.read_u16()?;
        let _padding = cursor.read_u16()?;
        let data_crc = cursor.read_u32()?;
        let reloc_crc = cursor.read_u32()?;
        Ok(Self {
            section,
            offset,
            size,
            characteristics,
            module,
            data_crc,
            reloc_crc,
        })
    }
}

/// Describes the debug information contributed by one compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ModuleDescriptor {
    /// The first section contribution of this module.
    pub section: SectionContribution,
    /// Module flags.
    pub flags: u16,
    /// The stream holding symbols and line information, `0xffff` if there is none.
    pub stream: u16,
    /// The byte length of the symbol region, including the 4-byte signature.
    pub symbols_size: u32,
    /// The byte length of the legacy (C11) line region.
    pub old_lines_size: u32,
    /// The byte length of the (C13) line region.
    pub lines_size: u32,
    /// The number of source files contributing to this module.
    pub file_count: u16,
    /// Name id of the module's primary source file.
    pub source_name_id: u32,
    /// Name id of the PDB file the compiler wrote.
    pub compiler_name_id: u32,
    /// The module name.
    pub module_name: String,
    /// The object or library file name, if names are kept.
    pub object_name: Option<String>,
}

impl ModuleDescriptor {
    fn parse(cursor: &mut ByteCursor, keep_names: bool) -> Result<Self> {
        let _opened = cursor.read_u32()?;
        let section = SectionContribution::parse(cursor)?;
        let flags = cursor.read_u16()?;
        let stream = cursor.read_u16()?;
        let symbols_size = cursor.read_u32()?;
        let old_lines_size = cursor.read_u32()?;
        let lines_size = cursor.read_u32()?;
        let file_count = cursor.read_u16()?;
        let _padding = cursor.read_u16()?;
        let _file_name_offsets = cursor.read_u32()?;
        let source_name_id = cursor.read_u32()?;
        let compiler_name_id = cursor.read_u32()?;

        // The module name is always needed to recognize special modules.
        let module_name = cursor.read_cstring()?;
        let object_name = if keep_names {
            Some(cursor.read_cstring()?)
        } else {
            cursor.skip_cstring()?;
            None
        };
        cursor.align(4)?;

        Ok(Self {
            section,
            flags,
            stream,
            symbols_size,
            old_lines_size,
            lines_size,
            file_count,
            source_name_id,
            compiler_name_id,
            module_name,
            object_name,
        })
    }

    /// The stream index holding this module's debug information, if it has one.
    pub fn stream_index(&self) -> Option<u32> {
        match self.stream {
            0 | NIL_STREAM => None,
            index => Some(u32::from(index)),
        }
    }

    /// The total byte length of all regions in the module stream.
    pub(crate) fn regions_size(&self) -> u64 {
        u64::from(self.symbols_size) + u64::from(self.old_lines_size) + u64::from(self.lines_size)
    }
}

/// The decoded parts of the DBI stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct DbiStream {
    pub(crate) header: DbiHeader,
    pub(crate) modules: Vec<ModuleDescriptor>,
    pub(crate) debug_header: DebugHeader,
}

impl DbiStream {
    #[tracing::instrument(level = "trace", name = "DbiStream::parse", skip_all)]
    pub(crate) fn parse(cursor: &mut ByteCursor, keep_names: bool) -> Result<Self> {
        let header = DbiHeader::parse(cursor)?;

        let end = cursor.position() + header.module_list_size as usize;
        let mut modules = Vec::new();
        while cursor.position() < end {
            modules.push(ModuleDescriptor::parse(cursor, keep_names)?);
        }
        if cursor.position() != end {
            return Err(PdbError::from(PdbErrorKind::ModuleListOverrun(
                cursor.position(),
                end,
            ))
            .at(end));
        }

        let skipped = [
            header.section_contribution_size,
            header.section_map_size,
            header.file_info_size,
            header.type_server_map_size,
            header.ec_info_size,
        ];
        for size in skipped {
            cursor.skip(size as usize)?;
        }

        let debug_header = if header.debug_header_size > 0 {
            let end = cursor.position() + header.debug_header_size as usize;
            let debug_header = DebugHeader::parse(cursor)?;
            cursor.set_position(end)?;
            debug_header
        } else {
            DebugHeader::default()
        };

        tracing::trace!(modules = modules.len(), "decoded DBI stream");
        Ok(Self {
            header,
            modules,
            debug_header,
        })
    }
}
