//! Registry of source files for a translation unit.

use super::{FileId, Span};

/// One registered source file.
#[derive(Debug)]
pub struct SourceFile {
    /// Display name (usually the path as given on the command line).
    pub name: String,
    /// Full file contents.
    pub source: String,
    /// Byte offset of the start of each line.
    line_starts: Vec<u32>,
}

impl SourceFile {
    fn new(name: String, source: String) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self {
            name,
            source,
            line_starts,
        }
    }

    /// The 1-based line containing the byte offset.
    pub fn line_of(&self, offset: u32) -> u32 {
        match self.line_starts.binary_search(&offset) {
            Ok(line) => line as u32 + 1,
            Err(insert) => insert as u32,
        }
    }

    /// Text of a 1-based line, without the trailing newline.
    pub fn line_text(&self, line: u32) -> Option<&str> {
        let idx = line.checked_sub(1)? as usize;
        let start = *self.line_starts.get(idx)? as usize;
        let end = self
            .line_starts
            .get(idx + 1)
            .map(|&e| e as usize)
            .unwrap_or(self.source.len());
        Some(self.source[start..end].trim_end_matches(['\n', '\r']))
    }
}

/// Owns all source files of a translation unit and assigns [`FileId`]s.
#[derive(Debug, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file, returning its id.
    pub fn add_file(&mut self, name: impl Into<String>, source: impl Into<String>) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile::new(name.into(), source.into()));
        id
    }

    /// Look up a registered file.
    pub fn file(&self, id: FileId) -> Option<&SourceFile> {
        self.files.get(id.index())
    }

    /// Display name of a file; `"<unknown>"` if the id is stale.
    pub fn name(&self, id: FileId) -> &str {
        self.file(id).map(|f| f.name.as_str()).unwrap_or("<unknown>")
    }

    /// Source text under a span, if it is in bounds.
    pub fn snippet(&self, span: Span) -> Option<&str> {
        let file = self.file(span.file_id)?;
        file.source.get(span.start as usize..span.end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut map = SourceMap::new();
        let id = map.add_file("main.cpp", "int main() {}\n");
        assert_eq!(map.name(id), "main.cpp");
        assert_eq!(map.file(id).unwrap().source, "int main() {}\n");
    }

    #[test]
    fn test_line_of() {
        let mut map = SourceMap::new();
        let id = map.add_file("t.cpp", "a\nbb\nccc\n");
        let f = map.file(id).unwrap();
        assert_eq!(f.line_of(0), 1);
        assert_eq!(f.line_of(2), 2);
        assert_eq!(f.line_of(5), 3);
    }

    #[test]
    fn test_line_text() {
        let mut map = SourceMap::new();
        let id = map.add_file("t.cpp", "first\nsecond\n");
        let f = map.file(id).unwrap();
        assert_eq!(f.line_text(1), Some("first"));
        assert_eq!(f.line_text(2), Some("second"));
        assert_eq!(f.line_text(3), Some(""));
        assert_eq!(f.line_text(4), None);
    }

    #[test]
    fn test_snippet() {
        let mut map = SourceMap::new();
        let id = map.add_file("t.cpp", "int x = 42;");
        let span = Span::with_file(8, 10, id, 1, 9);
        assert_eq!(map.snippet(span), Some("42"));
    }
}
