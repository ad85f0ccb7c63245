//! Source tracking for C declaration text
//!
//! Every chunk of declaration text handed to the FFI layer (one `cdef` call,
//! a header file read by the CLI, a synthetic bootstrap chunk) is registered
//! here as its own source. Byte offsets produced by the parser are mapped
//! back to 1-based line/column positions for error reporting.

use std::fmt;

/// A resolved position inside a source chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize, byte_offset: usize) -> Self {
        Self {
            line,
            column,
            byte_offset,
        }
    }
}

/// A range of text inside one source chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub start: SourcePosition,
    pub end: SourcePosition,
    pub file_id: FileId,
}

impl SourceSpan {
    pub fn new(start: SourcePosition, end: SourcePosition, file_id: FileId) -> Self {
        Self {
            start,
            end,
            file_id,
        }
    }

    /// Span covering a single character
    pub fn point(pos: SourcePosition, file_id: FileId) -> Self {
        Self {
            start: pos,
            end: SourcePosition::new(pos.line, pos.column + 1, pos.byte_offset + 1),
            file_id,
        }
    }

    pub fn line(&self) -> usize {
        self.start.line
    }
}

/// Identifier of a registered source chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(usize);

impl FileId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One chunk of declaration text with precomputed line starts
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
    line_starts: Vec<usize>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let line_starts = line_starts(&content);
        Self {
            name: name.into(),
            content,
            line_starts,
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Text of a 1-based line without its terminator
    pub fn line_text(&self, line: usize) -> Option<&str> {
        if line == 0 || line > self.line_starts.len() {
            return None;
        }
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .copied()
            .unwrap_or(self.content.len());
        Some(self.content[start..end].trim_end_matches(['\n', '\r']))
    }

    /// Map a byte offset to a 1-based (line, column) pair
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.content.len());
        let index = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let line_start = self.line_starts[index];
        (index + 1, offset - line_start + 1)
    }

    pub fn position(&self, offset: usize) -> SourcePosition {
        let (line, column) = self.line_col(offset);
        SourcePosition::new(line, column, offset.min(self.content.len()))
    }
}

/// Registry of every declaration chunk seen by one FFI instance
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chunk and return its id
    pub fn add_file(&mut self, name: impl Into<String>, content: impl Into<String>) -> FileId {
        let id = FileId(self.files.len());
        self.files.push(SourceFile::new(name, content));
        id
    }

    pub fn get_file(&self, file_id: FileId) -> Option<&SourceFile> {
        self.files.get(file_id.0)
    }

    pub fn line_text(&self, file_id: FileId, line: usize) -> Option<&str> {
        self.get_file(file_id)?.line_text(line)
    }

    /// Build a span from byte offsets inside a registered chunk
    pub fn span(&self, file_id: FileId, start: usize, end: usize) -> Option<SourceSpan> {
        let file = self.get_file(file_id)?;
        Some(SourceSpan::new(
            file.position(start),
            file.position(end.max(start)),
            file_id,
        ))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn line_starts(source: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}
