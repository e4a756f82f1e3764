//! Decoding a whole PDB file into [`PdbInfo`].

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::hash::BuildHasher;
use std::io::{self, Read, Seek};
use std::path::Path;
use std::sync::Arc;

use debugid::DebugId;
use indexmap::IndexMap;
use memmap2::Mmap;
use uuid::Uuid;

use crate::cursor::ByteCursor;
use crate::dbi::{DbiStream, ModuleDescriptor};
use crate::error::{PdbErrorKind, Result};
use crate::lines::{decode_lines, ChecksumTable, SourceFile, SourceFileLoader};
use crate::msf::{Directory, PageReader, SuperBlock};
use crate::names::{NameIndex, NameTable};
use crate::remap::TokenRemap;
use crate::symbols::{decode_methods, MethodRecord, Scope};
use crate::token_lines::{decode_token_lines, resolve_files, TokenLine, TOKEN_SOURCE_LINE_MODULE};

/// The PDB info stream, holding the name index.
const PDB_STREAM: u32 = 1;

/// The DBI stream, holding the module list.
const DBI_STREAM: u32 = 3;

/// Options controlling how a PDB file is decoded.
///
/// ```
/// use symbolic_mspdb::DecodeOptions;
///
/// let options = DecodeOptions::new().keep_names(false);
/// assert!(!options.keeps_names());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    keep_names: bool,
    apply_token_remap: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            keep_names: true,
            apply_token_remap: true,
        }
    }
}

impl DecodeOptions {
    /// Creates the default options: keep names and apply the token remap table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether method names and module object names are kept.
    pub fn keep_names(mut self, keep_names: bool) -> Self {
        self.keep_names = keep_names;
        self
    }

    /// Sets whether tokens are rewritten through the token remap table, if the file has one.
    pub fn apply_token_remap(mut self, apply_token_remap: bool) -> Self {
        self.apply_token_remap = apply_token_remap;
        self
    }

    /// Returns `true` if names are kept.
    pub fn keeps_names(&self) -> bool {
        self.keep_names
    }

    /// Returns `true` if the token remap table is applied.
    pub fn applies_token_remap(&self) -> bool {
        self.apply_token_remap
    }
}

/// A consumer of decoded method records, keyed by method token.
pub trait MethodSink {
    /// Accepts one method record, replacing any record with the same token.
    fn insert_method(&mut self, method: MethodRecord);
}

impl<S: BuildHasher> MethodSink for HashMap<u32, MethodRecord, S> {
    fn insert_method(&mut self, method: MethodRecord) {
        self.insert(method.token, method);
    }
}

impl MethodSink for BTreeMap<u32, MethodRecord> {
    fn insert_method(&mut self, method: MethodRecord) {
        self.insert(method.token, method);
    }
}

impl<S: BuildHasher> MethodSink for IndexMap<u32, MethodRecord, S> {
    fn insert_method(&mut self, method: MethodRecord) {
        self.insert(method.token, method);
    }
}

/// The using information shared by a method, after following forward references.
#[derive(Debug, Clone, Copy)]
pub struct UsingInfo<'a> {
    /// The token of the method that owns the using information.
    pub token: u32,
    /// The number of imported namespaces per nesting level.
    pub using_counts: &'a [u16],
    /// The root scope of the owning method, holding the imported namespaces.
    pub scope: &'a Scope,
}

impl<'a> UsingInfo<'a> {
    /// Iterates the imported namespaces of all scopes of the owning method.
    pub fn namespaces(&self) -> impl Iterator<Item = &'a str> {
        self.scope
            .walk()
            .flat_map(|scope| scope.namespaces.iter().map(String::as_str))
    }
}

/// The decoded managed debug information of a PDB file.
///
/// ```
/// use symbolic_mspdb::{PdbErrorKind, PdbInfo};
///
/// let err = PdbInfo::parse(b"not a pdb").unwrap_err();
/// assert_eq!(err.kind(), PdbErrorKind::Io);
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PdbInfo {
    version: u32,
    signature: u32,
    age: u32,
    dbi_age: u32,
    guid: Uuid,
    modules: Vec<ModuleDescriptor>,
    methods: Vec<MethodRecord>,
    #[cfg_attr(feature = "serde", serde(skip))]
    tokens: HashMap<u32, usize>,
    token_lines: HashMap<u32, Vec<TokenLine>>,
    source_server_data: String,
}

impl PdbInfo {
    /// Decodes a PDB file from a seekable byte source with default options.
    pub fn decode<S: Read + Seek>(source: S) -> Result<Self> {
        Self::decode_with_options(source, DecodeOptions::default())
    }

    /// Decodes a PDB file from a seekable byte source.
    #[tracing::instrument(level = "trace", name = "PdbInfo::decode", skip_all)]
    pub fn decode_with_options<S: Read + Seek>(source: S, options: DecodeOptions) -> Result<Self> {
        Session::new(source, options)?.decode()
    }

    /// Decodes a PDB file held in memory.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::decode(io::Cursor::new(data))
    }

    /// Decodes a PDB file held in memory with the given options.
    pub fn parse_with_options(data: &[u8], options: DecodeOptions) -> Result<Self> {
        Self::decode_with_options(io::Cursor::new(data), options)
    }

    /// Memory-maps and decodes the PDB file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            // empty files cannot be mapped on all platforms
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => return Self::parse(b""),
            Err(err) => return Err(err.into()),
        };
        Self::parse(&map)
    }

    /// The version of the PDB info stream.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The timestamp signature of the PDB info stream.
    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// The age of the PDB info stream.
    pub fn age(&self) -> u32 {
        self.age
    }

    /// The GUID of the PDB file.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// The debug identifier matching the executable this PDB file belongs to.
    pub fn debug_id(&self) -> DebugId {
        // The DBI age tracks the executable, while the info stream age is bumped whenever the
        // PDB is rewritten.
        let age = if self.dbi_age != 0 {
            self.dbi_age
        } else {
            self.age
        };
        DebugId::from_parts(self.guid, age)
    }

    /// The module descriptors of the DBI stream.
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    /// All method records, ordered by segment, address and token.
    pub fn methods(&self) -> &[MethodRecord] {
        &self.methods
    }

    /// Looks up the method record of a method token.
    ///
    /// If several records share the token, the last one in address order is returned.
    pub fn method(&self, token: u32) -> Option<&MethodRecord> {
        self.tokens.get(&token).map(|index| &self.methods[*index])
    }

    /// Resolves the using information of a method, following forward references.
    ///
    /// Returns `None` if the method or a forward target is unknown, or the forward references
    /// form a cycle.
    pub fn using_info(&self, token: u32) -> Option<UsingInfo<'_>> {
        let mut method = self.method(token)?;
        for _ in 0..=self.methods.len() {
            match method.forward_token {
                Some(next) => method = self.method(next)?,
                None => {
                    return Some(UsingInfo {
                        token: method.token,
                        using_counts: &method.using_counts,
                        scope: &method.scope,
                    })
                }
            }
        }
        tracing::debug!(token, "cyclic using info forward");
        None
    }

    /// Source ranges of metadata tokens, if the file records them.
    pub fn token_lines(&self) -> &HashMap<u32, Vec<TokenLine>> {
        &self.token_lines
    }

    /// The source ranges of one metadata token.
    pub fn token_line(&self, token: u32) -> &[TokenLine] {
        self.token_lines
            .get(&token)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The source server script, empty if the file has none.
    pub fn source_server_data(&self) -> &str {
        &self.source_server_data
    }

    /// Hands all method records to `sink`, in address order.
    pub fn into_sink<K: MethodSink + ?Sized>(self, sink: &mut K) {
        for method in self.methods {
            sink.insert_method(method);
        }
    }
}

/// Loads source files through the name table and caches them by name.
struct FileLoader<'a, S> {
    reader: &'a mut PageReader<S>,
    directory: &'a Directory,
    index: &'a NameIndex,
    names: &'a NameTable,
    sources: &'a mut HashMap<String, Arc<SourceFile>>,
    cursor: &'a mut ByteCursor,
}

impl<S: Read + Seek> SourceFileLoader for FileLoader<'_, S> {
    fn load(
        &mut self,
        name_id: u32,
        checksum_kind: u8,
        checksum: &[u8],
    ) -> Result<Arc<SourceFile>> {
        let name = self
            .names
            .get(name_id)
            .ok_or(PdbErrorKind::UnknownName(name_id))?;
        if let Some(file) = self.sources.get(name) {
            return Ok(Arc::clone(file));
        }

        let mut file = SourceFile::new(name.to_owned());
        file.checksum_kind = checksum_kind;
        file.checksum = checksum.to_vec();

        let stream_name = format!("/SRC/FILES/{}", name.to_uppercase());
        if let Some(index) = self.index.get(&stream_name) {
            let stream = self.directory.stream(index)?;
            if !stream.is_empty() {
                stream.load(self.reader, self.cursor)?;
                file.read_file_stream(self.cursor)?;
            }
        }

        let file = Arc::new(file);
        self.sources.insert(name.to_owned(), Arc::clone(&file));
        Ok(file)
    }
}

/// The state of decoding one PDB file.
struct Session<S> {
    options: DecodeOptions,
    reader: PageReader<S>,
    directory: Directory,
    index: NameIndex,
    names: NameTable,
    cursor: ByteCursor,
    file_cursor: ByteCursor,
    sources: HashMap<String, Arc<SourceFile>>,
}

impl<S: Read + Seek> Session<S> {
    fn new(mut source: S, options: DecodeOptions) -> Result<Self> {
        let mut cursor = ByteCursor::new();
        let superblock = SuperBlock::parse(&mut source, &mut cursor)?;
        let mut reader = PageReader::new(source, superblock.page_size);
        let directory = Directory::parse(&mut reader, &superblock, &mut cursor)?;

        directory.stream(PDB_STREAM)?.load(&mut reader, &mut cursor)?;
        let index = NameIndex::parse(&mut cursor)?;

        let names_stream = index
            .get("/NAMES")
            .ok_or(PdbErrorKind::MissingNamesStream)?;
        directory.stream(names_stream)?.load(&mut reader, &mut cursor)?;
        let names = NameTable::parse(&mut cursor)?;

        Ok(Self {
            options,
            reader,
            directory,
            index,
            names,
            cursor,
            file_cursor: ByteCursor::new(),
            sources: HashMap::new(),
        })
    }

    /// Stages the stream with the given index into the main cursor.
    fn load_stream(&mut self, index: u32) -> Result<()> {
        self.directory
            .stream(index)?
            .load(&mut self.reader, &mut self.cursor)
    }

    fn decode(mut self) -> Result<PdbInfo> {
        self.load_stream(DBI_STREAM)?;
        let dbi = DbiStream::parse(&mut self.cursor, self.options.keep_names)?;

        let remap = match dbi.debug_header.token_remap_stream() {
            Some(index) if self.options.apply_token_remap => {
                self.load_stream(index)?;
                let count = self.cursor.len() / 4;
                TokenRemap::new(self.cursor.read_u32_vec(count)?)
            }
            _ => TokenRemap::identity(),
        };

        let mut methods = Vec::new();
        let mut token_lines: HashMap<u32, Vec<TokenLine>> = HashMap::new();
        for module in &dbi.modules {
            let Some(stream) = module.stream_index() else {
                continue;
            };
            let span = tracing::trace_span!("module", name = %module.module_name, stream);
            let _guard = span.enter();
            self.decode_module(module, stream, &mut methods, &mut token_lines)?;
        }

        for method in &mut methods {
            remap.apply(method)?;
        }
        sort_methods(&mut methods);

        let tokens = methods
            .iter()
            .enumerate()
            .map(|(index, method)| (method.token, index))
            .collect();

        let source_server_data = match self.index.get("SRCSRV") {
            Some(index) => {
                let data = self.directory.stream(index)?.read_to_vec(&mut self.reader)?;
                String::from_utf8_lossy(&data).into_owned()
            }
            None => String::new(),
        };

        tracing::debug!(
            modules = dbi.modules.len(),
            methods = methods.len(),
            source_files = self.sources.len(),
            "decoded PDB"
        );

        Ok(PdbInfo {
            version: self.index.version,
            signature: self.index.signature,
            age: self.index.age,
            dbi_age: dbi.header.age,
            guid: self.index.guid,
            modules: dbi.modules,
            methods,
            tokens,
            token_lines,
            source_server_data,
        })
    }

    fn decode_module(
        &mut self,
        module: &ModuleDescriptor,
        stream: u32,
        methods: &mut Vec<MethodRecord>,
        token_lines: &mut HashMap<u32, Vec<TokenLine>>,
    ) -> Result<()> {
        let descriptor = self.directory.stream(stream)?;
        if module.regions_size() > u64::from(descriptor.len()) {
            return Err(PdbErrorKind::InvalidModuleRegions.into());
        }
        descriptor.load(&mut self.reader, &mut self.cursor)?;

        let symbols_end = module.symbols_size as usize;
        let lines_start = symbols_end + module.old_lines_size as usize;
        let lines_end = lines_start + module.lines_size as usize;

        let mut loader = FileLoader {
            reader: &mut self.reader,
            directory: &self.directory,
            index: &self.index,
            names: &self.names,
            sources: &mut self.sources,
            cursor: &mut self.file_cursor,
        };

        if module.module_name == TOKEN_SOURCE_LINE_MODULE {
            let mut lines = decode_token_lines(&mut self.cursor, symbols_end)?;
            let checksums =
                ChecksumTable::parse(&mut self.cursor, lines_start, lines_end, &mut loader)?;
            resolve_files(&mut lines, &checksums);
            for (token, ranges) in lines {
                token_lines.entry(token).or_default().extend(ranges);
            }
            return Ok(());
        }

        if symbols_end == 0 {
            return Ok(());
        }
        let mut module_methods =
            decode_methods(&mut self.cursor, symbols_end, self.options.keep_names)?;
        sort_methods(&mut module_methods);

        let checksums = ChecksumTable::parse(&mut self.cursor, lines_start, lines_end, &mut loader)?;
        decode_lines(
            &mut self.cursor,
            lines_start,
            lines_end,
            &checksums,
            &mut module_methods,
        )?;

        tracing::trace!(methods = module_methods.len(), "decoded module");
        methods.append(&mut module_methods);
        Ok(())
    }
}

fn sort_methods(methods: &mut [MethodRecord]) {
    methods.sort_by_key(|method| (method.segment, method.address, method.token));
}
