//! cffi - inspect, verify and bind C declarations
//!
//! # Usage
//!
//! ```bash
//! # Parse declaration files and summarize them
//! cffi check decls.h
//!
//! # Sizes, alignments and field offsets as JSON
//! cffi layout decls.h --format json
//!
//! # Resolve every declared symbol in libm
//! cffi symbols decls.h --library m
//!
//! # Compare layouts with what the system C compiler computes
//! cffi verify decls.h --preamble '#include <sys/stat.h>'
//! ```

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use diagnostics::ErrorFormatter;
use ffi::{Backend, CType, Ffi, FfiConfig, FfiError, NativeBackend, SystemCompilerVerifier, VerifyOptions};
use log::{debug, LevelFilter};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "cffi")]
#[command(version = "0.1.0")]
#[command(about = "Inspect, verify and bind C declarations", long_about = None)]
struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Extra library search directory
    #[arg(short = 'L', long = "search-path", global = true)]
    search_paths: Vec<PathBuf>,

    /// Do not predeclare size_t, int32_t and the other platform integer typedefs
    #[arg(long, global = true)]
    no_bootstrap: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse declaration files and summarize what they declare
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print size, alignment and field offsets
    Layout {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Type to lay out (defaults to every named struct and union)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Resolve every declared function and variable in a library
    Symbols {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Library name or path (defaults to the C runtime)
        #[arg(short, long)]
        library: Option<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Compile a probe with the system C compiler and compare layouts
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// C text placed before the probe (defaults to the declarations)
        #[arg(long)]
        preamble: Option<String>,

        #[arg(short = 'I', long = "include-dir")]
        include_dirs: Vec<String>,

        /// Library to link the probe against
        #[arg(short = 'l', long = "link")]
        libraries: Vec<String>,

        /// C compiler (defaults to $CC, then cc)
        #[arg(long)]
        cc: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    ffi::logging::init_with_level(match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    let mut config = FfiConfig::from_env().with_bootstrap(!cli.no_bootstrap);
    for path in cli.search_paths {
        config = config.with_search_path(path);
    }

    let result = match cli.command {
        Commands::Check { files, format } => {
            open(config, &files).and_then(|ffi| check(&ffi, &files, format))
        }
        Commands::Layout { files, types, format } => {
            open(config, &files).and_then(|ffi| layout(&ffi, &types, format))
        }
        Commands::Symbols { files, library, format } => {
            open(config, &files).and_then(|ffi| symbols(&ffi, library.as_deref(), format))
        }
        Commands::Verify { files, preamble, include_dirs, libraries, cc, format } => {
            let options = VerifyArgs { preamble, include_dirs, libraries, cc };
            open(config, &files).and_then(|ffi| verify(&ffi, &files, options, format))
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Facade with every file declared, in order
fn open(config: FfiConfig, files: &[PathBuf]) -> Result<Ffi<NativeBackend>, String> {
    let ffi = Ffi::with_config(NativeBackend::new(), config).map_err(|e| e.to_string())?;
    for file in files {
        let text = std::fs::read_to_string(file)
            .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
        ffi.cdef_named(&file.display().to_string(), &text)
            .map_err(|e| render(&ffi, &e))?;
        debug!("declared {}", file.display());
    }
    Ok(ffi)
}

/// Declaration errors with a source snippet, everything else as one line
fn render(ffi: &Ffi<NativeBackend>, err: &FfiError) -> String {
    match err.to_diagnostic() {
        Some(diagnostic) => {
            let formatter = if std::io::stderr().is_terminal() {
                ErrorFormatter::with_colors()
            } else {
                ErrorFormatter::new()
            };
            formatter.format_diagnostic(&diagnostic, &ffi.source_map())
        }
        None => format!("Error: {}", err),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

#[derive(Debug, Serialize)]
struct Summary {
    functions: Vec<String>,
    variables: Vec<String>,
    typedefs: Vec<String>,
    aggregates: Vec<String>,
}

fn summarize(ffi: &Ffi<NativeBackend>, files: &[PathBuf]) -> Summary {
    let decls = ffi.declarations();
    let bootstrapped = |name: &str| {
        // predeclared typedefs are not part of the user's files
        ffi.config().bootstrap_integer_types
            && ffi.backend().nonstandard_integer_types().iter().any(|t| t.name == name)
    };
    debug!("summarizing {} files", files.len());
    Summary {
        functions: decls.functions().map(|(n, t)| t.declaration(n)).collect(),
        variables: decls.variables().map(|(n, t)| t.declaration(n)).collect(),
        typedefs: decls
            .typedefs()
            .filter(|(n, _)| !bootstrapped(n))
            .map(|(n, t)| t.declaration(n))
            .collect(),
        aggregates: decls
            .aggregates()
            .map(|def| {
                let state = if def.fields.is_some() { "" } else { " (opaque)" };
                format!("{} {}{}", def.kind.keyword(), def.name, state)
            })
            .collect(),
    }
}

fn check(ffi: &Ffi<NativeBackend>, files: &[PathBuf], format: OutputFormat) -> Result<(), String> {
    let summary = summarize(ffi, files);
    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => {
            for file in files {
                println!("✓ {}", file.display());
            }
            println!("  Functions:  {}", summary.functions.len());
            println!("  Variables:  {}", summary.variables.len());
            println!("  Typedefs:   {}", summary.typedefs.len());
            println!("  Aggregates: {}", summary.aggregates.len());
            for line in summary.functions.iter().chain(&summary.variables) {
                println!("    {};", line);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct FieldOffset {
    name: String,
    offset: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct TypeLayout {
    name: String,
    size: usize,
    align: usize,
    fields: Vec<FieldOffset>,
}

fn layouts(ffi: &Ffi<NativeBackend>, types: &[String]) -> Result<Vec<TypeLayout>, String> {
    let names: Vec<String> = if types.is_empty() {
        ffi.declarations()
            .aggregates()
            .filter(|def| def.fields.is_some() && !def.name.starts_with('$'))
            .map(|def| format!("{} {}", def.kind.keyword(), def.name))
            .collect()
    } else {
        types.to_vec()
    };

    let mut out = Vec::new();
    for name in names {
        let size = ffi.size_of(&name).map_err(|e| render(ffi, &e))?;
        let align = ffi.align_of(&name).map_err(|e| render(ffi, &e))?;
        let ctype = ffi.parse_type(&name).map_err(|e| render(ffi, &e))?;

        let members: Vec<String> = match ctype.as_aggregate() {
            Some(s) => ffi
                .declarations()
                .fields(s)
                .map(|f| {
                    f.names
                        .iter()
                        .zip(&f.bitsizes)
                        .filter(|(n, bits)| !n.is_empty() && bits.is_none())
                        .map(|(n, _)| n.clone())
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let mut fields = Vec::new();
        for member in members {
            let offset = ffi.offset_of(&name, &member).map_err(|e| render(ffi, &e))?;
            fields.push(FieldOffset { name: member, offset });
        }
        out.push(TypeLayout { name, size, align, fields });
    }
    Ok(out)
}

fn layout(ffi: &Ffi<NativeBackend>, types: &[String], format: OutputFormat) -> Result<(), String> {
    let layouts = layouts(ffi, types)?;
    match format {
        OutputFormat::Json => print_json(&layouts)?,
        OutputFormat::Text => {
            for layout in &layouts {
                println!("{}: size {}, align {}", layout.name, layout.size, layout.align);
                for field in &layout.fields {
                    println!("  +{:<4} {}", field.offset, field.name);
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SymbolRow {
    kind: &'static str,
    declaration: String,
    address: Option<String>,
    error: Option<String>,
}

fn symbols(ffi: &Ffi<NativeBackend>, library: Option<&str>, format: OutputFormat) -> Result<(), String> {
    let loaded = match library {
        Some(name) => Some(ffi.load(name).map_err(|e| render(ffi, &e))?),
        None => None,
    };
    let proxy = loaded.as_ref().unwrap_or_else(|| ffi.c());

    let (functions, variables) = {
        let decls = ffi.declarations();
        (spelled(decls.functions()), spelled(decls.variables()))
    };

    let mut rows = Vec::new();
    for (name, declaration) in functions {
        let address = proxy.function(&name).map(|f| f.address());
        rows.push(symbol_row("function", declaration, address));
    }
    for (name, declaration) in variables {
        let address = proxy.variable(&name).and_then(|data| {
            data.address()
                .ok_or_else(|| FfiError::InvalidArgument(format!("'{}' has no address", name)))
        });
        rows.push(symbol_row("variable", declaration, address));
    }

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Text => {
            for row in &rows {
                match (&row.address, &row.error) {
                    (Some(address), _) => println!("✓ {:<18} {}", address, row.declaration),
                    (None, Some(error)) => println!("✗ {:<18} {}: {}", "missing", row.declaration, error),
                    (None, None) => {}
                }
            }
        }
    }

    let missing = rows.iter().filter(|r| r.error.is_some()).count();
    if missing > 0 {
        return Err(format!("{} of {} symbols could not be resolved", missing, rows.len()));
    }
    Ok(())
}

/// `(name, C declaration)` pairs
fn spelled<'a>(entries: impl Iterator<Item = (&'a str, &'a CType)>) -> Vec<(String, String)> {
    entries
        .map(|(name, ty)| (name.to_string(), ty.declaration(name)))
        .collect()
}

fn symbol_row(kind: &'static str, declaration: String, address: ffi::Result<usize>) -> SymbolRow {
    match address {
        Ok(address) => SymbolRow {
            kind,
            declaration,
            address: Some(format!("{:#x}", address)),
            error: None,
        },
        Err(e) => SymbolRow {
            kind,
            declaration,
            address: None,
            error: Some(e.to_string()),
        },
    }
}

struct VerifyArgs {
    preamble: Option<String>,
    include_dirs: Vec<String>,
    libraries: Vec<String>,
    cc: Option<PathBuf>,
}

fn verify_options(args: &VerifyArgs) -> VerifyOptions {
    let mut options = VerifyOptions::default();
    if !args.include_dirs.is_empty() {
        options.insert("include_dirs".to_string(), args.include_dirs.clone());
    }
    if !args.libraries.is_empty() {
        options.insert("libraries".to_string(), args.libraries.clone());
    }
    options
}

fn read_preamble(files: &[PathBuf]) -> Result<String, String> {
    let mut preamble = String::new();
    for file in files {
        preamble.push_str(&read(file)?);
        preamble.push('\n');
    }
    Ok(preamble)
}

fn read(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))
}

fn verify(
    ffi: &Ffi<NativeBackend>,
    files: &[PathBuf],
    args: VerifyArgs,
    format: OutputFormat,
) -> Result<(), String> {
    let preamble = match &args.preamble {
        Some(text) => text.clone(),
        None => read_preamble(files)?,
    };
    let verifier = match &args.cc {
        Some(cc) => SystemCompilerVerifier::with_compiler(cc),
        None => SystemCompilerVerifier::new(),
    };
    let report = ffi
        .verify(&preamble, &verify_options(&args), &verifier)
        .map_err(|e| render(ffi, &e))?;
    let mismatches = ffi.compare_layouts(&report).map_err(|e| render(ffi, &e))?;

    match format {
        OutputFormat::Json => print_json(&mismatches)?,
        OutputFormat::Text => {
            println!("Checked {} layouts", report.layouts.len());
            for m in &mismatches {
                println!(
                    "✗ {}: {} is {} in C but {} here",
                    m.type_name, m.what, m.expected, m.actual
                );
            }
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(format!("{} layout mismatches", mismatches.len()))
    }
}
