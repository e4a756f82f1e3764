//! Provides support for reading managed debug information from Windows PDB files.
//!
//! PDB files produced for .NET assemblies by the classic Windows toolchain use the same container
//! as native PDB files, but describe methods with a dedicated set of symbol records. This crate
//! decodes these records into one [`MethodRecord`] per method, with everything needed to rewrite
//! method tokens and emit consistent debug information for a rewritten assembly.
//!
//! # Functionality
//!
//! * Decode a PDB file with [`PdbInfo::open`], [`PdbInfo::parse`] or [`PdbInfo::decode`].
//! * Iterate methods in address order with [`PdbInfo::methods`], or look them up by token with
//!   [`PdbInfo::method`].
//! * Resolve shared namespace imports with [`PdbInfo::using_info`].
//! * Hand all methods to a token-keyed map with [`PdbInfo::into_sink`].
//!
//! ## Example
//!
//! ```no_run
//! use symbolic_mspdb::PdbInfo;
//!
//! let pdb = PdbInfo::open("Program.pdb")?;
//! for method in pdb.methods() {
//!     println!("{:#010x}: {} lines", method.token, method.line_count());
//! }
//! # Ok::<(), symbolic_mspdb::PdbError>(())
//! ```
//!
//! # Structure of a PDB file
//!
//! A PDB file is an MSF container: a set of numbered streams, each stored as a list of fixed-size
//! pages. The streams relevant to managed debug information are
//! * stream 1, the PDB info stream, with the file's GUID and age and a map of named streams,
//! * `/NAMES`, a string table for source file names,
//! * stream 3, the DBI stream, listing one module per compilation unit,
//! * one stream per module, holding symbol records followed by line information,
//! * optionally `SRCSRV`, `/SRC/FILES/<name>` and a token remap stream.

#![warn(missing_docs)]

mod bitmap;
mod cursor;
mod dbi;
mod error;
mod info;
mod lines;
pub mod msf;
mod names;
mod remap;
mod symbols;
mod token_lines;

pub use cursor::{ByteCursor, Decimal};
pub use dbi::{ModuleDescriptor, SectionContribution};
pub use error::{PdbError, PdbErrorKind, Result};
pub use info::{DecodeOptions, MethodSink, PdbInfo, UsingInfo};
pub use lines::{Language, LineRecord, LineTable, SourceFile, DOCUMENT_TYPE_TEXT, VENDOR_MICROSOFT};
pub use remap::TokenRemap;
pub use symbols::{
    AsyncMethodInfo, Constant, ConstantValue, IteratorScope, MethodRecord, Scope, Slot, SyncPoint,
};
pub use token_lines::{TokenLine, TOKEN_SOURCE_LINE_MODULE};
