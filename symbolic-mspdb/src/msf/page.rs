use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;

/// Returns the number of pages of `page_size` bytes needed to hold `len` bytes.
pub(crate) fn pages_for(len: u32, page_size: u32) -> u32 {
    len.div_ceil(page_size)
}

/// Translates `(page, offset)` addresses into positions of an underlying byte source.
///
/// Reads never cross a page boundary on their own; splitting a logical read into page-local
/// pieces is the job of [`StreamDescriptor`](super::StreamDescriptor).
#[derive(Debug)]
pub struct PageReader<S> {
    source: S,
    page_size: u32,
}

impl<S: Read + Seek> PageReader<S> {
    /// Creates a reader over `source` with the given page size.
    pub fn new(source: S, page_size: u32) -> Self {
        Self { source, page_size }
    }

    /// The size of a single page in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The number of pages needed to hold `len` bytes.
    pub fn pages_for(&self, len: u32) -> u32 {
        pages_for(len, self.page_size)
    }

    /// Positions the source at `offset` bytes into `page`.
    pub fn seek(&mut self, page: u32, offset: u32) -> Result<()> {
        let position = u64::from(page) * u64::from(self.page_size) + u64::from(offset);
        self.source.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Fills `buf` from the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() <= self.page_size as usize);
        self.source.read_exact(buf)?;
        Ok(())
    }

    /// Unwraps the underlying byte source.
    pub fn into_inner(self) -> S {
        self.source
    }
}
