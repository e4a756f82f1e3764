//! Test helpers for `symbolic`.
//!
//! Builds small, synthetic MSF/PDB images holding managed debug information, so that decoder
//! tests can describe their input in a few lines and corrupt it deliberately.
//!
//! # Example
//!
//! ```
//! use symbolic_testutils::{ModuleBuilder, PdbBuilder, SymbolWriter};
//!
//! let mut symbols = SymbolWriter::new();
//! symbols.begin_method(0x0600_0001, 1, 0x100, 0x20, "Main");
//! symbols.end();
//!
//! let image = PdbBuilder::new()
//!     .module(ModuleBuilder::new("Program.obj").symbols(symbols))
//!     .build();
//! assert_eq!(&image[..24], b"Microsoft C/C++ MSF 7.00");
//! ```
#![warn(missing_docs)]

use uuid::Uuid;

const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";
const NIL_STREAM: u16 = 0xffff;

/// Record kind of the end of a method or block.
pub const S_END: u16 = 0x0006;
/// Record kind of vendor-specific records.
pub const S_OEM: u16 = 0x0404;
/// Record kind of a nested block.
pub const S_BLOCK32: u16 = 0x1103;
/// Record kind of a local variable slot.
pub const S_MANSLOT: u16 = 0x1120;
/// Record kind of a namespace import.
pub const S_UNAMESPACE: u16 = 0x1124;
/// Record kind of a global managed procedure.
pub const S_GMANPROC: u16 = 0x112a;
/// Record kind of a local managed procedure.
pub const S_LMANPROC: u16 = 0x112b;
/// Record kind of a managed constant.
pub const S_MANCONSTANT: u16 = 0x112d;

/// Vendor GUID of managed OEM records.
pub const MSIL_METADATA_GUID: Uuid = uuid::uuid!("c6ea3fc9-59b3-49d6-bc25-0902bbabb460");

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn put_utf16(buf: &mut Vec<u8>, value: &str) {
    for unit in value.encode_utf16().chain(Some(0)) {
        put_u16(buf, unit);
    }
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    while buf.len() % alignment != 0 {
        buf.push(0);
    }
}

/// One item of an `MD2` custom metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Md2Item {
    /// Namespace counts per nesting level.
    UsingCounts(Vec<u16>),
    /// The method sharing its using information.
    Forward(u32),
    /// The method holding the module's using information.
    ForwardToModule(u32),
    /// Hoisted local ranges as `(start, end)` offsets.
    IteratorScopes(Vec<(u32, u32)>),
    /// The generated iterator class name.
    IteratorClass(String),
    /// An item of any kind with an opaque payload.
    Raw {
        /// The item kind.
        kind: u8,
        /// The item payload.
        data: Vec<u8>,
    },
}

impl Md2Item {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let kind = match self {
            Md2Item::UsingCounts(counts) => {
                put_u16(&mut payload, counts.len() as u16);
                for count in counts {
                    put_u16(&mut payload, *count);
                }
                0
            }
            Md2Item::Forward(token) => {
                put_u32(&mut payload, *token);
                1
            }
            Md2Item::ForwardToModule(token) => {
                put_u32(&mut payload, *token);
                2
            }
            Md2Item::IteratorScopes(scopes) => {
                put_u32(&mut payload, scopes.len() as u32);
                for (start, end) in scopes {
                    put_u32(&mut payload, *start);
                    put_u32(&mut payload, *end);
                }
                3
            }
            Md2Item::IteratorClass(name) => {
                put_utf16(&mut payload, name);
                4
            }
            Md2Item::Raw { kind, data } => {
                payload.extend_from_slice(data);
                *kind
            }
        };
        pad_to(&mut payload, 4);

        buf.extend_from_slice(&[4, kind, 0, 0]);
        put_u32(buf, 8 + payload.len() as u32);
        buf.extend_from_slice(&payload);
    }
}

/// Writes the symbol region of a module stream.
///
/// Every record is padded to a multiple of four bytes. Methods and blocks opened with
/// [`begin_method`](Self::begin_method) and [`begin_block`](Self::begin_block) must be closed
/// with [`end`](Self::end), which also patches the end offset into the opening record.
#[derive(Debug, Clone)]
pub struct SymbolWriter {
    data: Vec<u8>,
    open: Vec<usize>,
}

impl Default for SymbolWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolWriter {
    /// Creates a writer holding only the module signature.
    pub fn new() -> Self {
        Self {
            data: 4u32.to_le_bytes().to_vec(),
            open: Vec::new(),
        }
    }

    /// Appends a record with an arbitrary kind and payload, returning its offset.
    pub fn raw_record(&mut self, kind: u16, payload: &[u8]) -> usize {
        let start = self.data.len();
        let padded = (payload.len() + 4).next_multiple_of(4) - 4;
        put_u16(&mut self.data, padded as u16 + 2);
        put_u16(&mut self.data, kind);
        self.data.extend_from_slice(payload);
        self.data.resize(start + 4 + padded, 0);
        start
    }

    /// Opens a global managed procedure.
    pub fn begin_method(&mut self, token: u32, segment: u16, address: u32, length: u32, name: &str) {
        let mut payload = Vec::new();
        for value in [0, 0, 0, length, 0, length, token, address] {
            put_u32(&mut payload, value);
        }
        put_u16(&mut payload, segment);
        payload.push(0);
        put_u16(&mut payload, 0);
        put_cstring(&mut payload, name);
        let start = self.raw_record(S_GMANPROC, &payload);
        self.open.push(start + 8);
    }

    /// Opens a nested block at an absolute code address.
    pub fn begin_block(&mut self, address: u32, length: u32) {
        let mut payload = Vec::new();
        for value in [0, 0, length, address] {
            put_u32(&mut payload, value);
        }
        put_u16(&mut payload, 1);
        payload.push(0);
        let start = self.raw_record(S_BLOCK32, &payload);
        self.open.push(start + 8);
    }

    /// Closes the innermost open method or block.
    pub fn end(&mut self) {
        self.close_with(S_END);
    }

    /// Closes the innermost open method or block with a record of the given kind.
    ///
    /// Any kind other than `S_END` produces a corrupted image.
    pub fn close_with(&mut self, kind: u16) {
        let end = self.data.len() as u32;
        if let Some(patch) = self.open.pop() {
            self.data[patch..patch + 4].copy_from_slice(&end.to_le_bytes());
        }
        self.raw_record(kind, &[]);
    }

    /// Declares a local variable slot in the innermost scope.
    pub fn slot(&mut self, index: u32, type_token: u32, name: &str) {
        let mut payload = Vec::new();
        for value in [index, type_token, 0] {
            put_u32(&mut payload, value);
        }
        put_u16(&mut payload, 0);
        put_u16(&mut payload, 0);
        put_cstring(&mut payload, name);
        self.raw_record(S_MANSLOT, &payload);
    }

    /// Declares a constant with a raw numeric leaf `tag` followed by `value` bytes.
    pub fn constant(&mut self, token: u32, tag: u16, value: &[u8], name: &str) {
        let mut payload = Vec::new();
        put_u32(&mut payload, token);
        put_u16(&mut payload, tag);
        payload.extend_from_slice(value);
        put_cstring(&mut payload, name);
        self.raw_record(S_MANCONSTANT, &payload);
    }

    /// Declares a namespace import in the innermost scope.
    pub fn using_namespace(&mut self, name: &str) {
        let mut payload = Vec::new();
        put_cstring(&mut payload, name);
        self.raw_record(S_UNAMESPACE, &payload);
    }

    /// Appends a managed OEM record with the given name and body.
    pub fn oem(&mut self, name: &str, body: &[u8]) {
        let mut payload = MSIL_METADATA_GUID.to_bytes_le().to_vec();
        put_u32(&mut payload, 0);
        put_utf16(&mut payload, name);
        payload.extend_from_slice(body);
        self.raw_record(S_OEM, &payload);
    }

    /// Appends an `MD2` custom metadata record.
    pub fn md2(&mut self, items: &[Md2Item]) {
        // the record header, vendor, type index and "MD2" leave the body 4-byte aligned
        let mut body = vec![4, items.len() as u8, 0, 0];
        for item in items {
            item.encode(&mut body);
        }
        self.oem("MD2", &body);
    }

    /// Appends an `asyncMethodInfo` record with `(sync offset, continuation, offset)` points.
    pub fn async_info(&mut self, kickoff: u32, catch_handler: u32, points: &[(u32, u32, u32)]) {
        let mut body = Vec::new();
        put_u32(&mut body, kickoff);
        put_u32(&mut body, catch_handler);
        put_u32(&mut body, points.len() as u32);
        for (sync_offset, continuation, continuation_offset) in points {
            put_u32(&mut body, *sync_offset);
            put_u32(&mut body, *continuation);
            put_u32(&mut body, *continuation_offset);
        }
        self.oem("asyncMethodInfo", &body);
    }

    /// Appends a `TSLI` token source range record.
    pub fn token_line(&mut self, token: u32, file_id: u32, lines: (u32, u32), columns: (u32, u32)) {
        let mut body = Vec::new();
        for value in [token, file_id, lines.0, columns.0, lines.1, columns.1] {
            put_u32(&mut body, value);
        }
        self.oem("TSLI", &body);
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the symbol region.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// One line entry written by [`LineWriter::lines`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineEntry {
    /// The IL offset.
    pub offset: u32,
    /// The first line.
    pub line: u32,
    /// The last line, at most 127 lines after `line`.
    pub end_line: u32,
    /// The first column.
    pub column: u16,
    /// The column after the range.
    pub end_column: u16,
}

impl LineEntry {
    /// A single-line entry without columns.
    pub fn new(offset: u32, line: u32) -> Self {
        Self {
            offset,
            line,
            end_line: line,
            ..Default::default()
        }
    }
}

/// Writes the line region of a module stream.
#[derive(Debug, Clone, Default)]
pub struct LineWriter {
    checksums: Vec<u8>,
    lines: Vec<u8>,
}

impl LineWriter {
    /// Creates an empty line region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a checksum record for the file with the given `/NAMES` id and returns its file id.
    pub fn checksum(&mut self, name_id: u32, kind: u8, checksum: &[u8]) -> u32 {
        let file_id = self.checksums.len() as u32;
        put_u32(&mut self.checksums, name_id);
        self.checksums.push(checksum.len() as u8);
        self.checksums.push(kind);
        self.checksums.extend_from_slice(checksum);
        pad_to(&mut self.checksums, 4);
        file_id
    }

    /// Adds a lines subsection for the method at `(segment, address)`.
    ///
    /// Each block pairs a file id with the line entries it contributes.
    pub fn lines(
        &mut self,
        segment: u16,
        address: u32,
        code_size: u32,
        blocks: &[(u32, &[LineEntry])],
        columns: bool,
    ) {
        let mut payload = Vec::new();
        put_u32(&mut payload, address);
        put_u16(&mut payload, segment);
        put_u16(&mut payload, u16::from(columns));
        put_u32(&mut payload, code_size);

        for (file_id, entries) in blocks {
            let entry_size = if columns { 12 } else { 8 };
            put_u32(&mut payload, *file_id);
            put_u32(&mut payload, entries.len() as u32);
            put_u32(&mut payload, 12 + (entries.len() * entry_size) as u32);
            for entry in entries.iter() {
                let delta = entry.end_line.saturating_sub(entry.line).min(0x7f);
                put_u32(&mut payload, entry.offset);
                put_u32(&mut payload, entry.line | (delta << 24) | 0x8000_0000);
            }
            if columns {
                for entry in entries.iter() {
                    put_u16(&mut payload, entry.column);
                    put_u16(&mut payload, entry.end_column);
                }
            }
        }

        put_u32(&mut self.lines, 0xf2);
        put_u32(&mut self.lines, payload.len() as u32);
        self.lines.extend_from_slice(&payload);
        pad_to(&mut self.lines, 4);
    }

    /// Returns the line region: the checksum subsection followed by all lines subsections.
    pub fn finish(self) -> Vec<u8> {
        let mut data = Vec::new();
        if !self.checksums.is_empty() {
            put_u32(&mut data, 0xf4);
            put_u32(&mut data, self.checksums.len() as u32);
            data.extend_from_slice(&self.checksums);
        }
        data.extend_from_slice(&self.lines);
        data
    }
}

/// One module of the DBI stream.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    name: String,
    object: String,
    symbols: Option<Vec<u8>>,
    lines: Vec<u8>,
}

impl ModuleBuilder {
    /// Creates a module without a module stream.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            object: name.to_owned(),
            symbols: None,
            lines: Vec::new(),
        }
    }

    /// Sets the object file name.
    pub fn object(mut self, object: &str) -> Self {
        self.object = object.to_owned();
        self
    }

    /// Sets the symbol region of the module stream.
    pub fn symbols(mut self, symbols: SymbolWriter) -> Self {
        self.symbols = Some(symbols.finish());
        self
    }

    /// Sets the line region of the module stream.
    pub fn lines(mut self, lines: LineWriter) -> Self {
        self.lines = lines.finish();
        self
    }

    fn stream(&self) -> Option<Vec<u8>> {
        let symbols = self.symbols.as_ref()?;
        let mut data = symbols.clone();
        data.extend_from_slice(&self.lines);
        Some(data)
    }

    fn encode(&self, buf: &mut Vec<u8>, stream: Option<u16>) {
        put_u32(buf, 0);
        // section contribution
        put_u16(buf, 1);
        put_u16(buf, 0);
        for _ in 0..3 {
            put_u32(buf, 0);
        }
        put_u16(buf, 0);
        put_u16(buf, 0);
        put_u32(buf, 0);
        put_u32(buf, 0);

        put_u16(buf, 0);
        put_u16(buf, stream.unwrap_or(NIL_STREAM));
        let symbols_size = self.symbols.as_ref().map_or(0, Vec::len);
        put_u32(buf, symbols_size as u32);
        put_u32(buf, 0);
        put_u32(buf, self.lines.len() as u32);
        put_u16(buf, 0);
        put_u16(buf, 0);
        for _ in 0..3 {
            put_u32(buf, 0);
        }
        put_cstring(buf, &self.name);
        put_cstring(buf, &self.object);
        pad_to(buf, 4);
    }
}

/// Builds a complete MSF/PDB image.
#[derive(Debug, Clone)]
pub struct PdbBuilder {
    page_size: u32,
    signature: u32,
    age: u32,
    dbi_age: u32,
    guid: Uuid,
    names: Vec<u8>,
    write_names: bool,
    named: Vec<(String, Vec<u8>)>,
    modules: Vec<ModuleBuilder>,
    token_remap: Option<Vec<u32>>,
}

impl Default for PdbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PdbBuilder {
    /// Creates a builder for an image with 512-byte pages and no modules.
    pub fn new() -> Self {
        Self {
            page_size: 512,
            signature: 0x5f3a_1c20,
            age: 1,
            dbi_age: 1,
            guid: uuid::uuid!("2c1cb8f7-8f0e-4b5e-9b07-3e6f3c9a8d11"),
            names: vec![0],
            write_names: true,
            named: Vec::new(),
            modules: Vec::new(),
            token_remap: None,
        }
    }

    /// Sets the page size.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the GUID of the info stream.
    pub fn guid(mut self, guid: Uuid) -> Self {
        self.guid = guid;
        self
    }

    /// Sets the ages of the info stream and of the DBI stream.
    pub fn age(mut self, age: u32, dbi_age: u32) -> Self {
        self.age = age;
        self.dbi_age = dbi_age;
        self
    }

    /// Sets the signature of the info stream.
    pub fn signature(mut self, signature: u32) -> Self {
        self.signature = signature;
        self
    }

    /// Adds `name` to the `/NAMES` table and returns its id.
    pub fn name_id(&mut self, name: &str) -> u32 {
        let id = self.names.len() as u32;
        put_cstring(&mut self.names, name);
        id
    }

    /// Leaves out the `/NAMES` stream.
    pub fn without_names_stream(mut self) -> Self {
        self.write_names = false;
        self
    }

    /// Adds a named stream.
    pub fn named_stream(mut self, name: &str, data: Vec<u8>) -> Self {
        self.named.push((name.to_owned(), data));
        self
    }

    /// Adds a `SRCSRV` stream.
    pub fn source_server(self, text: &str) -> Self {
        self.named_stream("srcsrv", text.as_bytes().to_vec())
    }

    /// Adds a `/SRC/FILES/<NAME>` stream describing a source file.
    pub fn file_info(
        self,
        name: &str,
        language: Uuid,
        vendor: Uuid,
        document_type: Uuid,
        embedded_source: Option<&[u8]>,
    ) -> Self {
        let mut data = Vec::new();
        for guid in [language, vendor, document_type] {
            data.extend_from_slice(&guid.to_bytes_le());
        }
        if let Some(source) = embedded_source {
            data.extend_from_slice(&Uuid::nil().to_bytes_le());
            put_u32(&mut data, 0);
            put_u32(&mut data, source.len() as u32);
            data.extend_from_slice(source);
        }
        self.named_stream(&format!("/src/files/{name}"), data)
    }

    /// Adds a token remap table to the DBI stream.
    pub fn token_remap(mut self, table: Vec<u32>) -> Self {
        self.token_remap = Some(table);
        self
    }

    /// Adds a module.
    pub fn module(mut self, module: ModuleBuilder) -> Self {
        self.modules.push(module);
        self
    }

    fn info_stream(&self, named: &[(String, u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        put_u32(&mut data, 20000404);
        put_u32(&mut data, self.signature);
        put_u32(&mut data, self.age);
        data.extend_from_slice(&self.guid.to_bytes_le());

        let mut strings = Vec::new();
        let mut offsets = Vec::new();
        for (name, _) in named {
            offsets.push(strings.len() as u32);
            put_cstring(&mut strings, name);
        }
        put_u32(&mut data, strings.len() as u32);
        data.extend_from_slice(&strings);

        let count = named.len() as u32;
        put_u32(&mut data, count);
        put_u32(&mut data, count.max(1));
        // all slots present
        let words = (count as usize).div_ceil(32);
        put_u32(&mut data, words as u32);
        for word in 0..words {
            let bits = (count as usize - word * 32).min(32);
            put_u32(&mut data, if bits == 32 { !0 } else { (1 << bits) - 1 });
        }
        put_u32(&mut data, 0);
        for ((_, stream), offset) in named.iter().zip(offsets) {
            put_u32(&mut data, offset);
            put_u32(&mut data, *stream);
        }
        put_u32(&mut data, 0);
        data
    }

    fn names_stream(&self) -> Vec<u8> {
        let mut data = Vec::new();
        put_u32(&mut data, 0xeffe_effe);
        put_u32(&mut data, 1);
        put_u32(&mut data, self.names.len() as u32);
        data.extend_from_slice(&self.names);

        let mut ids = Vec::new();
        let mut offset = 1;
        while offset < self.names.len() {
            ids.push(offset as u32);
            let len = self.names[offset..]
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(0);
            offset += len + 1;
        }
        put_u32(&mut data, ids.len() as u32 + 1);
        put_u32(&mut data, 0);
        for id in &ids {
            put_u32(&mut data, *id);
        }
        put_u32(&mut data, ids.len() as u32);
        data
    }

    fn dbi_stream(&self, module_streams: &[Option<u16>], remap_stream: Option<u16>) -> Vec<u8> {
        let mut modules = Vec::new();
        for (module, stream) in self.modules.iter().zip(module_streams) {
            module.encode(&mut modules, *stream);
        }

        let mut data = Vec::new();
        put_u32(&mut data, u32::MAX);
        put_u32(&mut data, 19990903);
        put_u32(&mut data, self.dbi_age);
        for value in [NIL_STREAM, 0x8e00, NIL_STREAM, 0, NIL_STREAM, 0] {
            put_u16(&mut data, value);
        }
        let debug_header_size = if remap_stream.is_some() { 22 } else { 0 };
        for value in [modules.len() as u32, 0, 0, 0, 0, 0, debug_header_size, 0] {
            put_u32(&mut data, value);
        }
        put_u16(&mut data, 0);
        put_u16(&mut data, 0x14c);
        put_u32(&mut data, 0);
        data.extend_from_slice(&modules);

        if let Some(remap) = remap_stream {
            for index in 0..11 {
                put_u16(&mut data, if index == 6 { remap } else { NIL_STREAM });
            }
        }
        data
    }

    /// Lays out all streams in pages and returns the image.
    pub fn build(self) -> Vec<u8> {
        // 0: old directory, 1: info, 2: types, 3: DBI
        let mut streams: Vec<Vec<u8>> = vec![Vec::new(); 4];
        let mut named = Vec::new();

        if self.write_names {
            named.push(("/names".to_owned(), streams.len() as u32));
            streams.push(self.names_stream());
        }
        for (name, data) in &self.named {
            named.push((name.clone(), streams.len() as u32));
            streams.push(data.clone());
        }

        let mut module_streams = Vec::new();
        for module in &self.modules {
            match module.stream() {
                Some(data) => {
                    module_streams.push(Some(streams.len() as u16));
                    streams.push(data);
                }
                None => module_streams.push(None),
            }
        }

        let remap_stream = self.token_remap.as_ref().map(|table| {
            let mut data = Vec::new();
            for row in table {
                put_u32(&mut data, *row);
            }
            streams.push(data);
            streams.len() as u16 - 1
        });

        streams[1] = self.info_stream(&named);
        streams[3] = self.dbi_stream(&module_streams, remap_stream);

        self.layout(&streams)
    }

    fn layout(&self, streams: &[Vec<u8>]) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let mut pages: Vec<Vec<u8>> = vec![Vec::new()];

        let place = |data: &[u8], pages: &mut Vec<Vec<u8>>| -> Vec<u32> {
            data.chunks(page_size)
                .map(|chunk| {
                    let mut page = chunk.to_vec();
                    page.resize(page_size, 0);
                    pages.push(page);
                    pages.len() as u32 - 1
                })
                .collect()
        };

        let mut directory = Vec::new();
        put_u32(&mut directory, streams.len() as u32);
        for stream in streams {
            put_u32(&mut directory, stream.len() as u32);
        }
        for stream in streams {
            for page in place(stream, &mut pages) {
                put_u32(&mut directory, page);
            }
        }

        let directory_pages = place(&directory, &mut pages);
        let mut page_list = Vec::new();
        for page in &directory_pages {
            put_u32(&mut page_list, *page);
        }
        let root_pages = place(&page_list, &mut pages);

        let mut header = MSF_MAGIC.to_vec();
        put_u32(&mut header, self.page_size);
        put_u32(&mut header, 1);
        put_u32(&mut header, pages.len() as u32);
        put_u32(&mut header, directory.len() as u32);
        put_u32(&mut header, 0);
        for page in root_pages {
            put_u32(&mut header, page);
        }
        header.resize(page_size, 0);
        pages[0] = header;

        pages.concat()
    }
}
