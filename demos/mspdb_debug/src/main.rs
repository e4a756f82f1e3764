use std::path::PathBuf;

use anyhow::{format_err, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use symbolic_mspdb::{DecodeOptions, MethodRecord, PdbInfo, Scope};
use tracing_subscriber::{fmt, EnvFilter};

fn print_scope(scope: &Scope, depth: usize) {
    let indent = "  ".repeat(depth + 2);
    println!(
        "{indent}scope +{:#x}..+{:#x}",
        scope.offset,
        scope.offset + scope.length
    );
    for slot in &scope.slots {
        println!("{indent}  local #{} {} ({:#010x})", slot.index, slot.name, slot.type_token);
    }
    for constant in &scope.constants {
        println!("{indent}  const {} = {:?}", constant.name, constant.value);
    }
    for namespace in &scope.namespaces {
        println!("{indent}  using {namespace}");
    }
    for child in &scope.scopes {
        print_scope(child, depth + 1);
    }
}

fn print_method(pdb: &PdbInfo, method: &MethodRecord) {
    println!(
        "{:#010x} {:04x}:{:08x} {}",
        method.token,
        method.segment,
        method.address,
        method.name.as_deref().unwrap_or("<unnamed>")
    );
    print_scope(&method.scope, 0);

    if let Some(using) = pdb.using_info(method.token) {
        if using.token != method.token {
            println!("    using info of {:#010x}", using.token);
        }
    }
    if let Some(class) = &method.iterator_class {
        println!("    iterator class {class}");
    }
    if let Some(info) = &method.async_info {
        println!(
            "    async kickoff {:#010x}, {} await points",
            info.kickoff_method,
            info.sync_points.len()
        );
    }
    for table in &method.lines {
        match &table.file {
            Some(file) => println!("    {} ({})", file.name, file.language()),
            None => println!("    <file {:#x}>", table.file_id),
        }
        for line in &table.lines {
            println!(
                "      IL_{:04x} {}:{}-{}:{}",
                line.offset, line.start_line, line.start_column, line.end_line, line.end_column
            );
        }
    }
}

fn execute(matches: &ArgMatches) -> Result<()> {
    // `required` part is handled by the Clap args definition themselves, so its safe to `unwrap`.
    let path = matches.get_one::<PathBuf>("pdb_file_path").unwrap();
    let token = matches.get_one::<String>("token");
    let raw_tokens = matches.get_flag("raw_tokens");

    // Tracing subscriber controlled by `RUST_LOG`
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .event_format(
            tracing_subscriber::fmt::format()
                .compact()
                .with_target(false)
                .without_time(),
        )
        .init();

    let data = std::fs::read(path)?;
    let options = DecodeOptions::new().apply_token_remap(!raw_tokens);
    let pdb = PdbInfo::parse_with_options(&data, options)?;

    println!("Debug ID: {}", pdb.debug_id());
    println!("Modules: {}", pdb.modules().len());
    println!("Methods: {}", pdb.methods().len());

    match token {
        Some(token) => {
            let token = u32::from_str_radix(token.trim_start_matches("0x"), 16)?;
            let method = pdb
                .method(token)
                .ok_or_else(|| format_err!("Method {token:#010x} not found"))?;
            print_method(&pdb, method);
        }
        None => {
            for method in pdb.methods() {
                print_method(&pdb, method);
            }
        }
    }

    if !pdb.token_lines().is_empty() {
        println!("Token source lines: {}", pdb.token_lines().len());
    }
    if !pdb.source_server_data().is_empty() {
        println!("Source server data:\n{}", pdb.source_server_data());
    }

    Ok(())
}

fn main() {
    let matches = Command::new("mspdb-debug")
        .about("Dumps managed method debug information from a PDB file")
        .arg(
            Arg::new("pdb_file_path")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .value_name("PDB")
                .help("Path to the PDB file"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .help("Only print the method with this hexadecimal token"),
        )
        .arg(
            Arg::new("raw_tokens")
                .long("raw-tokens")
                .action(clap::ArgAction::SetTrue)
                .help("Do not apply the token remap table"),
        )
        .get_matches();

    execute(&matches).unwrap()
}
