use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

use indexmap::IndexMap;
use similar_asserts::assert_eq;
use symbolic_mspdb::{
    ConstantValue, DecodeOptions, Language, LineRecord, MethodRecord, PdbErrorKind, PdbInfo,
    DOCUMENT_TYPE_TEXT, TOKEN_SOURCE_LINE_MODULE, VENDOR_MICROSOFT,
};
use symbolic_testutils::{LineEntry, LineWriter, Md2Item, ModuleBuilder, PdbBuilder, SymbolWriter};

type Error = Box<dyn std::error::Error>;

const CSHARP: uuid::Uuid = uuid::uuid!("3f5162f8-07c6-11d3-9053-00c04fa302a1");

/// One method with two locals, a nested scope with a third local, and two lines in one file.
fn single_method(end_kind: u16) -> Vec<u8> {
    let mut builder = PdbBuilder::new()
        .guid(uuid::uuid!("0a6c8f44-35d0-4e7d-a1c2-3b9e5f7d2e10"))
        .age(3, 2);
    let name_id = builder.name_id("C:\\src\\Program.cs");

    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x30, "Program.Main");
    symbols.slot(0, 0x1100_0001, "args");
    symbols.slot(1, 0x1100_0001, "count");
    symbols.begin_block(0x108, 0x10);
    symbols.slot(2, 0x1100_0002, "item");
    symbols.end();
    symbols.close_with(end_kind);

    let mut lines = LineWriter::new();
    let file = lines.checksum(name_id, 1, &[0xde, 0xad, 0xbe, 0xef]);
    lines.lines(
        1,
        0x100,
        0x30,
        &[(file, &[LineEntry::new(0, 5), LineEntry::new(8, 6)])],
        false,
    );

    builder
        .file_info(
            "C:\\src\\Program.cs",
            CSHARP,
            VENDOR_MICROSOFT,
            DOCUMENT_TYPE_TEXT,
            None,
        )
        .module(ModuleBuilder::new("* Linker *"))
        .module(
            ModuleBuilder::new("Program.obj")
                .object("C:\\obj\\Program.obj")
                .symbols(symbols)
                .lines(lines),
        )
        .build()
}

#[test]
fn test_single_method() -> Result<(), Error> {
    let pdb = PdbInfo::parse(&single_method(0x0006))?;

    assert_eq!(pdb.version(), 20000404);
    assert_eq!(pdb.age(), 3);
    assert_eq!(
        pdb.debug_id().to_string(),
        "0a6c8f44-35d0-4e7d-a1c2-3b9e5f7d2e10-2"
    );
    assert_eq!(pdb.modules().len(), 2);
    assert_eq!(pdb.modules()[1].object_name.as_deref(), Some("C:\\obj\\Program.obj"));
    assert_eq!(pdb.methods().len(), 1);

    let method = pdb.method(0x0600_0001).unwrap();
    assert_eq!(method.name.as_deref(), Some("Program.Main"));
    assert_eq!((method.segment, method.address, method.length), (1, 0x100, 0x30));
    assert_eq!(method.scope.slots.len(), 2);
    assert_eq!(method.scope.depth(), 2);
    assert_eq!(method.scope.scopes[0].offset, 8);
    assert_eq!(method.scope.scopes[0].slots[0].name, "item");

    assert_eq!(method.lines.len(), 1);
    assert_eq!(method.line_count(), 2);
    let table = &method.lines[0];
    let file = table.file.as_ref().unwrap();
    assert_eq!(file.name, "C:\\src\\Program.cs");
    assert_eq!(file.language(), Language::CSharp);
    assert_eq!(file.checksum_kind, 1);
    assert_eq!(file.checksum, vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(
        table.lines,
        vec![
            LineRecord {
                offset: 0,
                start_line: 5,
                end_line: 5,
                start_column: 0,
                end_column: 0,
            },
            LineRecord {
                offset: 8,
                start_line: 6,
                end_line: 6,
                start_column: 0,
                end_column: 0,
            },
        ]
    );

    assert!(pdb.source_server_data().is_empty());
    assert!(pdb.token_lines().is_empty());
    Ok(())
}

#[test]
fn test_corrupted_end_record() {
    let err = PdbInfo::parse(&single_method(0x0007)).unwrap_err();
    assert_eq!(err.kind(), PdbErrorKind::MissingEnd(0x0007));
}

#[test]
fn test_missing_names_stream() {
    let image = PdbBuilder::new().without_names_stream().build();
    let err = PdbInfo::parse(&image).unwrap_err();
    assert_eq!(err.kind(), PdbErrorKind::MissingNamesStream);
}

#[test]
fn test_invalid_magic() {
    let mut image = PdbBuilder::new().build();
    image[0] = b'X';
    let err = PdbInfo::parse(&image).unwrap_err();
    assert_eq!(err.kind(), PdbErrorKind::InvalidMagic);
}

/// Three methods sharing one address, and `line_blocks` lines subsections for that address.
fn shared_address(line_blocks: u32) -> Vec<u8> {
    let mut builder = PdbBuilder::new();
    let name_id = builder.name_id("Generated.cs");

    let mut symbols = SymbolWriter::new();
    for token in [0x0600_0003, 0x0600_0001, 0x0600_0002] {
        symbols.begin_method(token, 1, 0x200, 0x10, "<>c.b__0");
        symbols.end();
    }

    let mut lines = LineWriter::new();
    let file = lines.checksum(name_id, 0, &[]);
    for line in 0..line_blocks {
        lines.lines(1, 0x200, 0x10, &[(file, &[LineEntry::new(0, 10 + line)])], false);
    }

    builder
        .module(ModuleBuilder::new("Gen.obj").symbols(symbols).lines(lines))
        .build()
}

fn first_line(method: &MethodRecord) -> Option<u32> {
    Some(method.lines.first()?.lines.first()?.start_line)
}

#[test]
fn test_shared_address_gets_one_line_block() -> Result<(), Error> {
    let pdb = PdbInfo::parse(&shared_address(1))?;
    let lines: Vec<_> = pdb.methods().iter().map(first_line).collect();
    assert_eq!(lines, vec![Some(10), None, None]);
    assert_eq!(pdb.methods()[0].token, 0x0600_0001);
    Ok(())
}

#[test]
fn test_shared_address_fills_in_token_order() -> Result<(), Error> {
    let pdb = PdbInfo::parse(&shared_address(2))?;
    let lines: Vec<_> = pdb
        .methods()
        .iter()
        .map(|method| (method.token, first_line(method)))
        .collect();
    assert_eq!(
        lines,
        vec![
            (0x0600_0001, Some(10)),
            (0x0600_0002, Some(11)),
            (0x0600_0003, None),
        ]
    );
    Ok(())
}

fn remapped() -> Vec<u8> {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x10, "A");
    symbols.async_info(0x0600_0000, 0, &[(4, 0x0600_0001, 8)]);
    symbols.end();
    symbols.begin_method(0x0600_0000, 1, 0x200, 0x10, "B");
    symbols.end();

    PdbBuilder::new()
        .token_remap(vec![5, 9])
        .module(ModuleBuilder::new("A.obj").symbols(symbols))
        .build()
}

#[test]
fn test_token_remap() -> Result<(), Error> {
    let pdb = PdbInfo::parse(&remapped())?;
    let tokens: Vec<_> = pdb.methods().iter().map(|m| m.token).collect();
    assert_eq!(tokens, vec![0x0600_0009, 0x0600_0005]);

    let method = pdb.method(0x0600_0009).unwrap();
    assert_eq!(method.name.as_deref(), Some("A"));
    let info = method.async_info.as_ref().unwrap();
    assert_eq!(info.kickoff_method, 0x0600_0005);
    assert_eq!(info.sync_points[0].continuation_method, 0x0600_0009);
    assert!(pdb.method(0x0600_0001).is_none());
    Ok(())
}

#[test]
fn test_raw_tokens() -> Result<(), Error> {
    let options = DecodeOptions::new().apply_token_remap(false).keep_names(false);
    let pdb = PdbInfo::parse_with_options(&remapped(), options)?;
    let method = pdb.method(0x0600_0001).unwrap();
    assert_eq!(method.name, None);
    assert_eq!(method.async_info.as_ref().unwrap().kickoff_method, 0x0600_0000);
    Ok(())
}

#[test]
fn test_token_remap_out_of_range() {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0007, 1, 0x100, 0x10, "A");
    symbols.end();
    let image = PdbBuilder::new()
        .token_remap(vec![5, 9])
        .module(ModuleBuilder::new("A.obj").symbols(symbols))
        .build();

    let err = PdbInfo::parse(&image).unwrap_err();
    assert_eq!(err.kind(), PdbErrorKind::TokenRemapOutOfRange(0x0600_0007));
}

#[test]
fn test_source_server_data() -> Result<(), Error> {
    let script = "SRCSRV: ini ------------------------------------------------\r\nVERSION=2\r\n";
    let image = PdbBuilder::new().source_server(script).build();
    let pdb = PdbInfo::parse(&image)?;
    assert_eq!(pdb.source_server_data(), script);
    Ok(())
}

#[test]
fn test_token_source_lines() -> Result<(), Error> {
    let mut builder = PdbBuilder::new();
    let name_id = builder.name_id("Types.cs");

    let mut symbols = SymbolWriter::new();
    symbols.token_line(0x01_0002, 0, (3, 40), (1, 2));
    symbols.token_line(0x01_0002, 0, (50, 60), (1, 2));
    symbols.token_line(0x0400_0001, 24, (7, 7), (9, 30));

    let mut lines = LineWriter::new();
    lines.checksum(name_id, 0, &[]);

    let image = builder
        .file_info(
            "Types.cs",
            CSHARP,
            VENDOR_MICROSOFT,
            DOCUMENT_TYPE_TEXT,
            Some(b"class A {}"),
        )
        .module(
            ModuleBuilder::new(TOKEN_SOURCE_LINE_MODULE)
                .symbols(symbols)
                .lines(lines),
        )
        .build();
    let pdb = PdbInfo::parse(&image)?;

    assert!(pdb.methods().is_empty());
    let type_lines = pdb.token_line(0x01_0002);
    assert_eq!(type_lines.len(), 2);
    assert_eq!((type_lines[0].line, type_lines[0].end_line), (3, 40));
    assert_eq!((type_lines[1].line, type_lines[1].end_line), (50, 60));

    let file = type_lines[0].file.as_ref().unwrap();
    assert_eq!(file.name, "Types.cs");
    assert_eq!(file.embedded_source.as_deref(), Some(&b"class A {}"[..]));

    // file id 24 has no checksum record
    assert!(pdb.token_line(0x0400_0001)[0].file.is_none());
    assert!(pdb.token_line(0x0400_0002).is_empty());
    Ok(())
}

#[test]
fn test_using_info_follows_forwards() -> Result<(), Error> {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x10, "Owner");
    symbols.md2(&[Md2Item::UsingCounts(vec![2])]);
    symbols.using_namespace("System");
    symbols.using_namespace("System.IO");
    symbols.end();
    symbols.begin_method(0x0600_0002, 1, 0x110, 0x10, "Forwarder");
    symbols.md2(&[Md2Item::Forward(0x0600_0001)]);
    symbols.end();
    symbols.begin_method(0x0600_0003, 1, 0x120, 0x10, "Twice");
    symbols.md2(&[Md2Item::Forward(0x0600_0002)]);
    symbols.end();
    symbols.begin_method(0x0600_0004, 1, 0x130, 0x10, "Cycle");
    symbols.md2(&[Md2Item::Forward(0x0600_0004)]);
    symbols.end();
    symbols.begin_method(0x0600_0005, 1, 0x140, 0x10, "Dangling");
    symbols.md2(&[Md2Item::Forward(0x0600_0042)]);
    symbols.end();

    let image = PdbBuilder::new()
        .module(ModuleBuilder::new("U.obj").symbols(symbols))
        .build();
    let pdb = PdbInfo::parse(&image)?;

    let using = pdb.using_info(0x0600_0003).unwrap();
    assert_eq!(using.token, 0x0600_0001);
    assert_eq!(using.using_counts, &[2u16][..]);
    assert_eq!(using.namespaces().collect::<Vec<_>>(), vec!["System", "System.IO"]);

    // the forwarding method itself holds no namespaces
    let forwarder = pdb.method(0x0600_0002).unwrap();
    assert!(forwarder.scope.namespaces.is_empty());
    assert_eq!(forwarder.forward_token, Some(0x0600_0001));

    assert!(pdb.using_info(0x0600_0004).is_none());
    assert!(pdb.using_info(0x0600_0005).is_none());
    assert!(pdb.using_info(0x0600_0099).is_none());
    Ok(())
}

#[test]
fn test_custom_metadata() -> Result<(), Error> {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0002, 1, 0x100, 0x40, "MoveNext");
    symbols.md2(&[
        Md2Item::ForwardToModule(0x0600_0001),
        Md2Item::IteratorClass("<Count>d__3".into()),
        Md2Item::IteratorScopes(vec![(0x04, 0x20)]),
        Md2Item::Raw {
            kind: 5,
            data: vec![0xff; 12],
        },
    ]);
    symbols.async_info(0x0600_0001, 0x38, &[(0x0c, 0x0600_0002, 0x14)]);
    symbols.constant(0x1100_0005, 0x8004, &7u32.to_le_bytes(), "Limit");
    symbols.end();

    let image = PdbBuilder::new()
        .module(ModuleBuilder::new("C.obj").symbols(symbols))
        .build();
    let pdb = PdbInfo::parse(&image)?;
    let method = pdb.method(0x0600_0002).unwrap();

    assert_eq!(method.forward_module_token, Some(0x0600_0001));
    assert_eq!(method.iterator_class.as_deref(), Some("<Count>d__3"));
    assert_eq!(method.iterator_scopes[0].length, 0x1c);
    let info = method.async_info.as_ref().unwrap();
    assert_eq!(info.catch_handler_offset, 0x38);
    assert_eq!(info.sync_points[0].continuation_offset, 0x14);
    assert_eq!(method.scope.constants[0].value, ConstantValue::U32(7));
    Ok(())
}

fn duplicate_tokens() -> Vec<u8> {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x10, "first");
    symbols.end();
    symbols.begin_method(0x0600_0002, 1, 0x180, 0x10, "other");
    symbols.end();
    symbols.begin_method(0x0600_0001, 2, 0x000, 0x10, "second");
    symbols.end();

    PdbBuilder::new()
        .module(ModuleBuilder::new("D.obj").symbols(symbols))
        .build()
}

#[test]
fn test_later_record_wins() -> Result<(), Error> {
    let pdb = PdbInfo::parse(&duplicate_tokens())?;
    assert_eq!(pdb.methods().len(), 3);
    assert_eq!(
        pdb.method(0x0600_0001).unwrap().name.as_deref(),
        Some("second")
    );

    let mut hash_map = HashMap::new();
    pdb.clone().into_sink(&mut hash_map);
    assert_eq!(hash_map.len(), 2);
    assert_eq!(hash_map[&0x0600_0001].segment, 2);

    let mut btree_map = BTreeMap::new();
    pdb.clone().into_sink(&mut btree_map);
    assert_eq!(btree_map.keys().copied().collect::<Vec<_>>(), vec![0x0600_0001, 0x0600_0002]);

    let mut index_map = IndexMap::new();
    pdb.into_sink(&mut index_map);
    assert_eq!(index_map[&0x0600_0001].name.as_deref(), Some("second"));
    Ok(())
}

#[test]
fn test_many_methods_span_pages() -> Result<(), Error> {
    let mut builder = PdbBuilder::new();
    let name_id = builder.name_id("Big.cs");

    let mut symbols = SymbolWriter::new();
    let mut lines = LineWriter::new();
    let file = lines.checksum(name_id, 0, &[]);
    for index in 0..200 {
        let address = 0x1000 + index * 0x20;
        symbols.begin_method(0x0600_0001 + index, 1, address, 0x20, &format!("Method{index}"));
        symbols.slot(0, 0x1100_0001, "local");
        symbols.end();
        lines.lines(1, address, 0x20, &[(file, &[LineEntry::new(0, index + 1)])], false);
    }

    let image = builder
        .module(ModuleBuilder::new("Big.obj").symbols(symbols).lines(lines))
        .build();
    let pdb = PdbInfo::parse(&image)?;

    assert_eq!(pdb.methods().len(), 200);
    for (index, method) in pdb.methods().iter().enumerate() {
        assert_eq!(method.token, 0x0600_0001 + index as u32);
        assert_eq!(first_line(method), Some(index as u32 + 1));
    }
    Ok(())
}

#[test]
fn test_open_file() -> Result<(), Error> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&single_method(0x0006))?;
    file.flush()?;

    let pdb = PdbInfo::open(file.path())?;
    assert_eq!(pdb.methods().len(), 1);
    Ok(())
}

#[test]
fn test_source_files_are_shared() -> Result<(), Error> {
    let mut builder = PdbBuilder::new();
    let shared = builder.name_id("A.cs");
    let partial = builder.name_id("A.Designer.cs");

    let mut first = SymbolWriter::new();
    first.begin_method(0x0600_0001, 1, 0x100, 0x20, "A.Init");
    first.end();
    let mut first_lines = LineWriter::new();
    let file_a = first_lines.checksum(shared, 0, &[]);
    let file_b = first_lines.checksum(partial, 0, &[]);
    first_lines.lines(
        1,
        0x100,
        0x20,
        &[
            (file_a, &[LineEntry::new(0, 3), LineEntry::new(4, 4)]),
            (file_b, &[LineEntry::new(8, 40)]),
        ],
        false,
    );

    let mut second = SymbolWriter::new();
    second.begin_method(0x0600_0002, 1, 0x200, 0x10, "A.Run");
    second.end();
    let mut second_lines = LineWriter::new();
    let file_a = second_lines.checksum(shared, 0, &[]);
    second_lines.lines(1, 0x200, 0x10, &[(file_a, &[LineEntry::new(0, 12)])], false);

    let image = builder
        .module(ModuleBuilder::new("A.obj").symbols(first).lines(first_lines))
        .module(ModuleBuilder::new("B.obj").symbols(second).lines(second_lines))
        .build();
    let pdb = PdbInfo::parse(&image)?;

    let init = pdb.method(0x0600_0001).unwrap();
    let files: Vec<_> = init
        .lines
        .iter()
        .map(|table| (table.file.as_ref().unwrap().name.as_str(), table.lines.len()))
        .collect();
    assert_eq!(files, vec![("A.cs", 2), ("A.Designer.cs", 1)]);
    assert_eq!(init.line_count(), 3);

    let run = pdb.method(0x0600_0002).unwrap();
    let init_file = init.lines[0].file.as_ref().unwrap();
    let run_file = run.lines[0].file.as_ref().unwrap();
    assert!(Arc::ptr_eq(init_file, run_file));
    assert!(!Arc::ptr_eq(init_file, init.lines[1].file.as_ref().unwrap()));
    Ok(())
}

#[test]
fn test_missing_checksum_keeps_lines() -> Result<(), Error> {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x10, "Orphan");
    symbols.end();
    let mut lines = LineWriter::new();
    lines.lines(1, 0x100, 0x10, &[(48, &[LineEntry::new(0, 9)])], false);

    let image = PdbBuilder::new()
        .module(ModuleBuilder::new("O.obj").symbols(symbols).lines(lines))
        .build();
    let pdb = PdbInfo::parse(&image)?;

    let table = &pdb.method(0x0600_0001).unwrap().lines[0];
    assert_eq!(table.file_id, 48);
    assert!(table.file.is_none());
    assert_eq!(table.lines[0].start_line, 9);
    Ok(())
}

#[test]
fn test_deeply_nested_scopes_are_rejected() {
    let mut symbols = SymbolWriter::new();
    symbols.begin_method(0x0600_0001, 1, 0x100, 0x10, "Deep");
    for _ in 0..1_000 {
        symbols.begin_block(0x100, 0x10);
    }
    for _ in 0..=1_000 {
        symbols.end();
    }

    let image = PdbBuilder::new()
        .page_size(4096)
        .module(ModuleBuilder::new("Deep.obj").symbols(symbols))
        .build();
    let err = PdbInfo::parse(&image).unwrap_err();
    assert_eq!(err.kind(), PdbErrorKind::ScopeTooDeep(256));
}
