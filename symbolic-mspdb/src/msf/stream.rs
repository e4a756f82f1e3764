use std::io::{Read, Seek};

use crate::cursor::ByteCursor;
use crate::error::{PdbErrorKind, Result};

use super::PageReader;

/// A logical stream of an MSF file: its content length and the pages holding the content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDescriptor {
    len: u32,
    pages: Vec<u32>,
}

impl StreamDescriptor {
    /// Creates a descriptor from a content length and its page list.
    pub fn new(len: u32, pages: Vec<u32>) -> Self {
        Self { len, pages }
    }

    /// Decodes the page list of a stream with `len` bytes of content spread over `page_count`
    /// pages.
    pub(crate) fn parse(cursor: &mut ByteCursor, len: u32, page_count: u32) -> Result<Self> {
        let pages = cursor.read_u32_vec(page_count as usize)?;
        Ok(Self { len, pages })
    }

    /// The declared content length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns `true` if the stream has no content.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The ordered page indices holding the content.
    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    /// Copies `dest.len()` bytes of content, starting at logical `position`, into `dest`.
    ///
    /// The range is split into page-local reads: first the remainder of the starting page if
    /// `position` is not page aligned, then whole pages until the request is satisfied.
    pub fn read<S: Read + Seek>(
        &self,
        reader: &mut PageReader<S>,
        position: u32,
        dest: &mut [u8],
    ) -> Result<()> {
        let length = dest.len();
        let end = u64::from(position) + length as u64;
        if end > u64::from(self.len) {
            return Err(PdbErrorKind::StreamOutOfBounds(position, length).into());
        }
        if position == self.len {
            return Ok(());
        }

        let page_size = reader.page_size();
        let mut page = (position / page_size) as usize;
        let mut in_page = position % page_size;
        let mut written = 0;

        while written < length {
            let todo = ((page_size - in_page) as usize).min(length - written);
            let page_index = *self
                .pages
                .get(page)
                .ok_or(PdbErrorKind::StreamOutOfBounds(position, length))?;
            reader.seek(page_index, in_page)?;
            reader
                .read(&mut dest[written..written + todo])
                .map_err(|e| e.at(page_index as usize * page_size as usize))?;
            written += todo;
            in_page = 0;
            page += 1;
        }

        Ok(())
    }

    /// Stages the complete content of this stream into `cursor`.
    pub fn load<S: Read + Seek>(
        &self,
        reader: &mut PageReader<S>,
        cursor: &mut ByteCursor,
    ) -> Result<()> {
        let dest = cursor.stage(self.len as usize);
        self.read(reader, 0, dest)
    }

    /// Reads the complete content of this stream into a fresh buffer.
    pub fn read_to_vec<S: Read + Seek>(&self, reader: &mut PageReader<S>) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.len as usize];
        self.read(reader, 0, &mut buf)?;
        Ok(buf)
    }
}
