//! Layout verification against a real C compiler
//!
//! The facade does not interpret verification options; it hands the
//! declarations to a [`Verifier`]. [`SystemCompilerVerifier`] compiles a
//! probe program that references every declared function and variable and
//! prints the measured layout of every named aggregate as JSON lines.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::declarations::DeclarationTable;
use crate::error::VerifyError;

/// Ordered `key -> values` options, passed through to the verifier
pub type VerifyOptions = IndexMap<String, Vec<String>>;

pub trait Verifier {
    fn verify(
        &self,
        decls: &DeclarationTable,
        preamble: &str,
        options: &VerifyOptions,
    ) -> Result<VerifyReport, VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredField {
    pub name: String,
    pub offset: usize,
}

/// Size, alignment and field offsets as the C compiler sees them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredLayout {
    /// `struct` or `union`
    pub kind: String,
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<MeasuredField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub layouts: Vec<MeasuredLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutMismatch {
    pub type_name: String,
    pub what: String,
    pub expected: usize,
    pub actual: usize,
}

/// C source of the probe program for `decls`
pub fn probe_source(decls: &DeclarationTable, preamble: &str) -> String {
    let mut out = String::new();
    out.push_str("#include <stdio.h>\n#include <stddef.h>\n");
    out.push_str(preamble);
    out.push_str("\n\nint main(void)\n{\n");

    for (name, _) in decls.functions().chain(decls.variables()) {
        let _ = writeln!(out, "    (void)&{};", name);
    }

    for def in decls.aggregates() {
        let Some(fields) = &def.fields else {
            continue;
        };
        if def.name.starts_with('$') {
            continue;
        }
        let ty = format!("{} {}", def.kind.keyword(), def.name);
        let _ = write!(
            out,
            "    printf(\"{{\\\"kind\\\":\\\"{}\\\",\\\"name\\\":\\\"{}\\\",\\\"size\\\":%zu,\\\"align\\\":%zu,\\\"fields\\\":[\"",
            def.kind.keyword(),
            def.name
        );
        let _ = writeln!(out, ", sizeof({}), (size_t)_Alignof({}));", ty, ty);

        let mut first = true;
        for (name, bits) in fields.names.iter().zip(&fields.bitsizes) {
            if name.is_empty() || bits.is_some() {
                continue;
            }
            let sep = if first { "" } else { "," };
            first = false;
            let _ = writeln!(
                out,
                "    printf(\"{}{{\\\"name\\\":\\\"{}\\\",\\\"offset\\\":%zu}}\", offsetof({}, {}));",
                sep, name, ty, name
            );
        }
        out.push_str("    printf(\"]}\\n\");\n");
    }
    out.push_str("    return 0;\n}\n");
    out
}

/// Parse the probe's stdout, one JSON layout per line
pub fn parse_probe_output(stdout: &str) -> Result<VerifyReport, VerifyError> {
    let layouts = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<MeasuredLayout>(line)
                .map_err(|e| VerifyError::Output(format!("{}: {}", e, line)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VerifyReport { layouts })
}

/// Compiles the probe with `$CC` (default `cc`).
///
/// Recognized options: `include_dirs`, `extra_compile_args`, `libraries`,
/// `extra_link_args`. Others are ignored.
#[derive(Debug, Clone, Default)]
pub struct SystemCompilerVerifier {
    compiler: Option<PathBuf>,
}

impl SystemCompilerVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compiler(compiler: impl Into<PathBuf>) -> Self {
        Self {
            compiler: Some(compiler.into()),
        }
    }

    fn compiler(&self) -> PathBuf {
        self.compiler
            .clone()
            .or_else(|| std::env::var_os("CC").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("cc"))
    }
}

impl Verifier for SystemCompilerVerifier {
    fn verify(
        &self,
        decls: &DeclarationTable,
        preamble: &str,
        options: &VerifyOptions,
    ) -> Result<VerifyReport, VerifyError> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("probe.c");
        let binary = dir.path().join("probe");
        fs::write(&source, probe_source(decls, preamble))?;

        let option = |key: &str| options.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let mut cmd = Command::new(self.compiler());
        cmd.arg("-o").arg(&binary);
        for dir in option("include_dirs") {
            cmd.arg(format!("-I{}", dir));
        }
        cmd.args(option("extra_compile_args"));
        cmd.arg(&source);
        for lib in option("libraries") {
            cmd.arg(format!("-l{}", lib));
        }
        cmd.args(option("extra_link_args"));

        debug!("compiling probe: {:?}", cmd);
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(VerifyError::Compile {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let output = Command::new(&binary).output()?;
        if !output.status.success() {
            return Err(VerifyError::Run {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let report = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        info!("verified {} aggregate layouts", report.layouts.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cparser::Parser;

    #[test]
    fn test_probe_source_mentions_symbols_and_fields() {
        let mut parser = Parser::new();
        parser
            .parse("struct P { int x; int y : 3; int z; }; int abs(int); extern int optind; struct Opaque;")
            .unwrap();
        let source = probe_source(parser.declarations(), "#include <stdlib.h>");
        assert!(source.contains("#include <stdlib.h>"));
        assert!(source.contains("(void)&abs;"));
        assert!(source.contains("(void)&optind;"));
        assert!(source.contains("sizeof(struct P), (size_t)_Alignof(struct P)"));
        assert!(source.contains("offsetof(struct P, x)"));
        assert!(source.contains("offsetof(struct P, z)"));
        // bit-fields have no offset
        assert!(!source.contains("offsetof(struct P, y)"));
        assert!(!source.contains("Opaque"));
    }

    #[test]
    fn test_parse_probe_output() {
        let stdout = "{\"kind\":\"struct\",\"name\":\"P\",\"size\":8,\"align\":4,\"fields\":[{\"name\":\"x\",\"offset\":0},{\"name\":\"y\",\"offset\":4}]}\n";
        let report = parse_probe_output(stdout).unwrap();
        assert_eq!(report.layouts.len(), 1);
        assert_eq!(report.layouts[0].fields[1].offset, 4);

        assert!(matches!(
            parse_probe_output("garbage"),
            Err(VerifyError::Output(_))
        ));
    }
}
