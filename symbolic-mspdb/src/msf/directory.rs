use std::io::{Read, Seek};

use crate::cursor::ByteCursor;
use crate::error::{PdbErrorKind, Result};

use super::{PageReader, StreamDescriptor, SuperBlock};

/// The stream directory: the catalog of all streams in the file, indexed by stream number.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    streams: Vec<StreamDescriptor>,
}

impl Directory {
    /// Decodes the directory using the page list announced by the superblock.
    #[tracing::instrument(level = "trace", name = "Directory::parse", skip_all)]
    pub fn parse<S: Read + Seek>(
        reader: &mut PageReader<S>,
        superblock: &SuperBlock,
        cursor: &mut ByteCursor,
    ) -> Result<Self> {
        let page_count = reader.pages_for(superblock.directory_size);
        let per_page = reader.page_size() / 4;

        // First gather the page list of the directory from the root pages.
        cursor.clear();
        let mut to_go = page_count;
        for &root in &superblock.directory_pages {
            let in_this_page = to_go.min(per_page);
            reader.seek(root, 0)?;
            cursor.append(in_this_page as usize * 4, |buf| reader.read(buf))?;
            to_go -= in_this_page;
        }
        cursor.set_position(0)?;
        let stream = StreamDescriptor::parse(cursor, superblock.directory_size, page_count)?;

        // Then stage the directory content itself.
        stream.load(reader, cursor)?;

        let count = cursor.read_u32()? as usize;
        let sizes = cursor.read_u32_vec(count)?;
        let mut streams = Vec::with_capacity(count);
        for size in sizes {
            // Nil streams are stored with a size of -1 and own no pages.
            if size as i32 <= 0 {
                streams.push(StreamDescriptor::default());
            } else {
                let pages = reader.pages_for(size);
                streams.push(StreamDescriptor::parse(cursor, size, pages)?);
            }
        }

        tracing::trace!(streams = streams.len(), "decoded stream directory");
        Ok(Self { streams })
    }

    /// The number of streams in the file.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns `true` if the directory lists no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Returns the descriptor of the stream with the given index.
    pub fn stream(&self, index: u32) -> Result<&StreamDescriptor> {
        self.streams
            .get(index as usize)
            .ok_or_else(|| PdbErrorKind::InvalidStreamIndex(index).into())
    }
}
