use std::fmt;

use thiserror::Error;

/// The kind of a [`PdbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PdbErrorKind {
    /// The file does not start with the MSF 7.00 magic signature.
    #[error("invalid MSF magic signature")]
    InvalidMagic,
    /// The superblock declares a page size that cannot be used for addressing.
    #[error("invalid page size {0}")]
    InvalidPageSize(u32),
    /// A read ran past the end of the staged buffer.
    #[error("unexpected end of data")]
    UnexpectedEof,
    /// A read was requested beyond the declared content length of a stream.
    #[error("read of {1} bytes at position {0} is out of bounds for the stream")]
    StreamOutOfBounds(u32, usize),
    /// A stream index does not exist in the directory.
    #[error("stream index {0} is not present in the directory")]
    InvalidStreamIndex(u32),
    /// The `/NAMES` stream is not listed in the name index.
    #[error("could not find the /NAMES stream; this may be a public symbol file")]
    MissingNamesStream,
    /// The name index contains deleted entries, which is not supported.
    #[error("unsupported name index: the deleted bitmap is not empty")]
    DeletedNamesNotEmpty,
    /// The number of present names does not match the declared count.
    #[error("name index count mismatch: found {0}, expected {1}")]
    NameCountMismatch(u32, u32),
    /// The name table has an unexpected signature or version.
    #[error("unsupported name table (signature {0:#010x}, version {1})")]
    InvalidNameTable(u32, i32),
    /// A string heap offset does not resolve to a name.
    #[error("unknown name id {0}")]
    UnknownName(u32),
    /// String data is not valid in its declared encoding.
    #[error("invalid string data")]
    InvalidString,
    /// The module list of the DBI stream does not end where its size says it should.
    #[error("module list ends at {0}, expected {1}")]
    ModuleListOverrun(usize, usize),
    /// The regions declared by a module descriptor exceed the module stream.
    #[error("module regions exceed the module stream length")]
    InvalidModuleRegions,
    /// A module symbol stream does not start with the expected signature.
    #[error("invalid module signature {0}")]
    InvalidModuleSignature(u32),
    /// A scope or method body does not end exactly at its declared end offset.
    #[error("symbol records do not end at the declared end offset")]
    NotAtEnd,
    /// A scope or method body is not terminated by an `S_END` record.
    #[error("missing S_END record, found record kind {0:#06x}")]
    MissingEnd(u16),
    /// A nested scope starts before the method containing it.
    #[error("scope starts before its method")]
    InvalidScope,
    /// Nested scopes exceed the supported depth.
    #[error("scopes are nested deeper than {0} levels")]
    ScopeTooDeep(usize),
    /// An OEM record carries a vendor GUID other than the managed metadata GUID.
    #[error("unknown OEM vendor in symbol record")]
    UnknownOemVendor,
    /// A custom metadata item has an unsupported version.
    #[error("unsupported custom metadata item version {0}")]
    UnsupportedCustomMetadataVersion(u8),
    /// A custom metadata item does not fit into its enclosing record.
    #[error("custom metadata item exceeds its record")]
    InvalidCustomMetadata,
    /// A constant uses a value encoding that cannot be decoded.
    #[error("invalid constant value tag {0:#06x}")]
    InvalidConstantTag(u16),
    /// A line block does not fit into its subsection.
    #[error("line block exceeds its subsection")]
    InvalidLineBlock,
    /// A token is out of range for the token remap table.
    #[error("token {0:#010x} is out of range for the token remap table")]
    TokenRemapOutOfRange(u32),
    /// Reading from the underlying byte source failed.
    #[error("failed to read from the byte source")]
    Io,
}

/// An error encountered while decoding a PDB file.
///
/// Decoding is all-or-nothing: once an error is returned, no partial result is available for the
/// file.
#[derive(Debug, Error)]
pub struct PdbError {
    pub(crate) kind: PdbErrorKind,
    pub(crate) offset: Option<usize>,
    #[source]
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PdbError {
    /// Creates a new error from a known kind of error as well as an arbitrary error payload.
    pub(crate) fn new<E>(kind: PdbErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self {
            kind,
            offset: None,
            source,
        }
    }

    /// Attaches the offset within the decoded region at which the error occurred.
    pub(crate) fn at(mut self, offset: usize) -> Self {
        self.offset.get_or_insert(offset);
        self
    }

    /// Returns the corresponding [`PdbErrorKind`] for this error.
    pub fn kind(&self) -> PdbErrorKind {
        self.kind
    }

    /// Returns the byte offset within the decoded region, if known.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }
}

impl fmt::Display for PdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} (at offset {:#x})", self.kind, offset),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<PdbErrorKind> for PdbError {
    fn from(kind: PdbErrorKind) -> Self {
        Self {
            kind,
            offset: None,
            source: None,
        }
    }
}

impl From<std::io::Error> for PdbError {
    fn from(err: std::io::Error) -> Self {
        Self::new(PdbErrorKind::Io, err)
    }
}

/// A specialized `Result` for PDB decoding.
pub type Result<T, E = PdbError> = std::result::Result<T, E>;
