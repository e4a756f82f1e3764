//! The MSF container underneath a PDB file.
//!
//! An MSF file is divided into pages of a fixed size. Logical streams are stored as lists of
//! (not necessarily contiguous) pages, and a directory at a location announced by the superblock
//! lists the page lists of all streams. The directory's own page list is paged as well, which
//! gives the format its two-level addressing: superblock, then directory root pages, then
//! directory pages, then stream pages.

mod directory;
mod page;
mod stream;
mod superblock;

pub use directory::Directory;
pub use page::PageReader;
pub use stream::StreamDescriptor;
pub use superblock::SuperBlock;
