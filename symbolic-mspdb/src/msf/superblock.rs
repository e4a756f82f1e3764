use std::io::{Read, Seek, SeekFrom};

use crate::cursor::ByteCursor;
use crate::error::{PdbErrorKind, Result};

use super::page::pages_for;

/// The magic signature at the start of every MSF 7.00 file.
pub(crate) const MSF_MAGIC: [u8; 32] = *b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// The size of the fixed part of the superblock, which precedes the directory page list.
pub(crate) const SUPERBLOCK_SIZE: usize = 52;

/// The fixed header at the start of an MSF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// The size of a page in bytes.
    pub page_size: u32,
    /// The byte length of the stream directory.
    pub directory_size: u32,
    /// The pages holding the list of pages that make up the directory.
    pub directory_pages: Vec<u32>,
}

impl SuperBlock {
    /// Decodes the superblock from the start of `source`.
    pub fn parse<S: Read + Seek>(source: &mut S, cursor: &mut ByteCursor) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        cursor.fill(source, SUPERBLOCK_SIZE)?;

        if cursor.read_bytes(MSF_MAGIC.len())? != MSF_MAGIC {
            return Err(PdbErrorKind::InvalidMagic.into());
        }

        let page_size = cursor.read_u32()?;
        let _free_page_map = cursor.read_u32()?;
        let _pages_used = cursor.read_u32()?;
        let directory_size = cursor.read_u32()?;
        let _reserved = cursor.read_u32()?;

        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(PdbErrorKind::InvalidPageSize(page_size).into());
        }

        // The directory page list is itself paged, so its length is the page count of a page
        // count.
        let directory_page_count = pages_for(directory_size, page_size);
        let root_count = pages_for(directory_page_count * 4, page_size) as usize;
        cursor.fill(source, root_count * 4)?;
        let directory_pages = cursor.read_u32_vec(root_count)?;

        Ok(Self {
            page_size,
            directory_size,
            directory_pages,
        })
    }
}
