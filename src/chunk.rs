//! Chunking strategies: map one file to an ordered sequence of passages.
//!
//! Every strategy is a pure function of the [`FileInfo`] — no I/O, and
//! deterministic per input. The first chunk of every file starts with a
//! `FILE: <path>` header line so file-level passages can be located by
//! prefix later (the markdown exporter relies on this).

use crate::collect::FileInfo;
use crate::config::ChunkStrategy;

/// One text chunk destined for a provider passage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// The passage text.
    pub text: String,
    /// The file this chunk came from, if known.
    pub source_path: Option<String>,
}

/// A chunking strategy.
///
/// The returned sequence is finite, ordered, and deterministic; the first
/// chunk's text begins with `FILE: <path>\n`.
pub trait Chunker: Send + Sync {
    /// Chunk one file.
    fn chunk(&self, file: &FileInfo) -> Vec<Chunk>;

    /// Strategy name, for logs.
    fn name(&self) -> &'static str;
}

/// Build the chunker for a configured strategy.
#[must_use]
pub fn chunker_for(strategy: ChunkStrategy) -> Box<dyn Chunker> {
    match strategy {
        ChunkStrategy::Raw => Box::new(RawChunker),
        #[cfg(feature = "ast-chunk")]
        ChunkStrategy::TreeSitter => Box::new(ast::AstChunker::default()),
        #[cfg(not(feature = "ast-chunk"))]
        ChunkStrategy::TreeSitter => {
            tracing::warn!(
                "built without the 'ast-chunk' feature; falling back to the raw strategy"
            );
            Box::new(RawChunker)
        }
    }
}

/// The `FILE:` header line for a path.
#[must_use]
pub fn file_header(path: &str) -> String {
    format!("FILE: {path}\n")
}

// ---------------------------------------------------------------------------
// Raw strategy
// ---------------------------------------------------------------------------

/// Default strategy: one chunk per file, header plus full content.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawChunker;

impl Chunker for RawChunker {
    fn chunk(&self, file: &FileInfo) -> Vec<Chunk> {
        vec![Chunk {
            text: format!("{}{}", file_header(&file.path), file.content),
            source_path: Some(file.path.clone()),
        }]
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}

// ---------------------------------------------------------------------------
// Tree-sitter strategy
// ---------------------------------------------------------------------------

#[cfg(feature = "ast-chunk")]
mod ast {
    use std::path::Path;

    use tree_sitter::{Language, Parser};

    use super::{Chunk, Chunker, RawChunker, file_header};
    use crate::collect::FileInfo;

    /// Target upper bound for one chunk's content, in bytes. A single
    /// top-level item larger than this still becomes one chunk.
    const MAX_CHUNK_BYTES: usize = 6 * 1024;

    /// Languages the AST strategy can split.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum AstLanguage {
        Rust,
        Python,
        TypeScript,
        JavaScript,
        Go,
    }

    impl AstLanguage {
        /// Detect language from the file extension.
        fn from_path(path: &str) -> Option<Self> {
            match Path::new(path).extension()?.to_str()? {
                "rs" => Some(Self::Rust),
                "py" => Some(Self::Python),
                "ts" | "tsx" => Some(Self::TypeScript),
                "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
                "go" => Some(Self::Go),
                _ => None,
            }
        }

        fn tree_sitter_language(self) -> Language {
            match self {
                Self::Rust => tree_sitter_rust::LANGUAGE.into(),
                Self::Python => tree_sitter_python::LANGUAGE.into(),
                Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
                Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
                Self::Go => tree_sitter_go::LANGUAGE.into(),
            }
        }
    }

    /// Split files at top-level AST item boundaries, grouping consecutive
    /// items until a chunk reaches [`MAX_CHUNK_BYTES`]. Unsupported
    /// languages and files that fail to parse fall back to the raw
    /// strategy, so the output is always non-empty.
    #[derive(Debug, Default)]
    pub struct AstChunker;

    impl Chunker for AstChunker {
        fn chunk(&self, file: &FileInfo) -> Vec<Chunk> {
            let Some(lang) = AstLanguage::from_path(&file.path) else {
                return RawChunker.chunk(file);
            };
            match split_top_level(lang, &file.content) {
                Some(pieces) if !pieces.is_empty() => assemble(file, &pieces),
                _ => RawChunker.chunk(file),
            }
        }

        fn name(&self) -> &'static str {
            "tree-sitter"
        }
    }

    /// Byte spans of the source grouped at top-level node boundaries.
    ///
    /// Returns `None` when the parser cannot be set up or the parse fails.
    fn split_top_level(lang: AstLanguage, source: &str) -> Option<Vec<(usize, usize)>> {
        let mut parser = Parser::new();
        parser.set_language(&lang.tree_sitter_language()).ok()?;
        let tree = parser.parse(source, None)?;
        let root = tree.root_node();

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            let start = child.start_byte();
            let end = child.end_byte();
            let fits = spans
                .last()
                .is_some_and(|&(span_start, _)| end.saturating_sub(span_start) <= MAX_CHUNK_BYTES);
            if fits {
                if let Some(last) = spans.last_mut() {
                    last.1 = end;
                }
            } else {
                spans.push((start, end));
            }
        }
        if spans.is_empty() {
            return None;
        }
        // Stretch the first span back to byte 0 and each span forward to the
        // next start so inter-item trivia (comments, blank lines) is kept.
        let mut stretched = Vec::with_capacity(spans.len());
        for (i, (start, end)) in spans.iter().enumerate() {
            let s = if i == 0 { 0 } else { *start };
            let e = spans.get(i + 1).map_or(source.len(), |next| next.0.max(*end));
            if s < e {
                stretched.push((s, e));
            }
        }
        Some(stretched)
    }

    fn assemble(file: &FileInfo, spans: &[(usize, usize)]) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(spans.len());
        for (i, (start, end)) in spans.iter().enumerate() {
            let body = &file.content[*start..*end];
            let text = if i == 0 {
                format!("{}{}", file_header(&file.path), body)
            } else {
                body.to_owned()
            };
            chunks.push(Chunk {
                text,
                source_path: Some(file.path.clone()),
            });
        }
        chunks
    }
}

#[cfg(feature = "ast-chunk")]
pub use ast::AstChunker;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> FileInfo {
        #[allow(clippy::cast_precision_loss)]
        let size_kb = content.len() as f64 / 1024.0;
        FileInfo {
            path: path.to_owned(),
            content: content.to_owned(),
            size_kb,
        }
    }

    #[test]
    fn raw_produces_single_chunk_with_header() {
        let chunks = RawChunker.chunk(&file("src/a.rs", "fn a() {}\n"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "FILE: src/a.rs\nfn a() {}\n");
        assert_eq!(chunks[0].source_path.as_deref(), Some("src/a.rs"));
    }

    #[test]
    fn raw_is_deterministic() {
        let f = file("a.ts", "const x = 1;\n");
        assert_eq!(RawChunker.chunk(&f), RawChunker.chunk(&f));
    }

    #[cfg(feature = "ast-chunk")]
    mod ast_tests {
        use super::*;

        #[test]
        fn first_chunk_keeps_file_header() {
            let f = file("src/a.rs", "fn a() {}\n\nfn b() {}\n");
            let chunks = AstChunker.chunk(&f);
            assert!(!chunks.is_empty());
            assert!(chunks[0].text.starts_with("FILE: src/a.rs\n"));
        }

        #[test]
        fn chunks_cover_full_content_in_order() {
            let src = "fn a() {}\n\nfn b() {}\nfn c() {}\n";
            let f = file("src/a.rs", src);
            let chunks = AstChunker.chunk(&f);
            let joined: String = chunks
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    if i == 0 {
                        c.text.strip_prefix("FILE: src/a.rs\n").unwrap_or(&c.text)
                    } else {
                        c.text.as_str()
                    }
                })
                .collect();
            assert_eq!(joined, src);
        }

        #[test]
        fn unsupported_language_falls_back_to_raw() {
            let f = file("notes.md", "# heading\n");
            let chunks = AstChunker.chunk(&f);
            assert_eq!(chunks.len(), 1);
            assert!(chunks[0].text.starts_with("FILE: notes.md\n"));
        }

        #[test]
        fn large_file_splits_into_multiple_chunks() {
            let mut src = String::new();
            for i in 0..200 {
                src.push_str(&format!("fn f{i}() {{ let x = {i}; println!(\"{{x}}\"); }}\n"));
            }
            let f = file("src/big.rs", &src);
            let chunks = AstChunker.chunk(&f);
            assert!(chunks.len() > 1, "expected a split, got {}", chunks.len());
        }
    }
}
