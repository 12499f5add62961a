//! Syntax validation for generated file content
//!
//! Tree-sitter grammars cover the source languages we can parse; JSON goes
//! through serde_json. Anything else passes unchecked. Only well-formedness
//! is checked, never semantics.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use tree_sitter::{Node, Parser};

/// File type, derived from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Rust,
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    Go,
    Json,
    Unknown,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => FileKind::Rust,
            "js" | "jsx" | "mjs" | "cjs" => FileKind::JavaScript,
            "ts" | "mts" | "cts" => FileKind::TypeScript,
            "tsx" => FileKind::Tsx,
            "py" | "pyi" => FileKind::Python,
            "go" => FileKind::Go,
            "json" => FileKind::Json,
            _ => FileKind::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileKind::Rust => "Rust",
            FileKind::JavaScript => "JavaScript",
            FileKind::TypeScript => "TypeScript",
            FileKind::Tsx => "TSX",
            FileKind::Python => "Python",
            FileKind::Go => "Go",
            FileKind::Json => "JSON",
            FileKind::Unknown => "unknown",
        }
    }

    /// Fence tag used when quoting this kind of file in prompts and reports.
    pub fn fence_tag(&self) -> &'static str {
        match self {
            FileKind::Rust => "rust",
            FileKind::JavaScript => "javascript",
            FileKind::TypeScript | FileKind::Tsx => "typescript",
            FileKind::Python => "python",
            FileKind::Go => "go",
            FileKind::Json => "json",
            FileKind::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Valid => write!(f, "valid"),
            Validation::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════
//
// Parsers are reused across validations; each runtime worker thread gets its
// own pre-configured set.

thread_local! {
    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A language error surfaces as a failed parse below
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

fn parse_with_pooled_parser(content: &str, kind: FileKind) -> Option<tree_sitter::Tree> {
    match kind {
        FileKind::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::TypeScript => TS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::Tsx => TSX_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        FileKind::Json | FileKind::Unknown => None,
    }
}

/// Check `content` for structural well-formedness according to `path`'s type.
pub fn validate(path: &Path, content: &str) -> Validation {
    validate_kind(FileKind::from_path(path), content)
}

pub fn validate_kind(kind: FileKind, content: &str) -> Validation {
    match kind {
        FileKind::Unknown => Validation::Valid,
        FileKind::Json => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(_) => Validation::Valid,
            Err(e) => Validation::Invalid(format!(
                "{}:{}: {}",
                e.line(),
                e.column(),
                e
            )),
        },
        _ => {
            let Some(tree) = parse_with_pooled_parser(content, kind) else {
                return Validation::Invalid(format!("{} parser produced no tree", kind.name()));
            };
            let root = tree.root_node();
            if !root.has_error() {
                return Validation::Valid;
            }
            let node = first_error(root).unwrap_or(root);
            let pos = node.start_position();
            let what = if node.is_missing() {
                format!("missing `{}`", node.kind())
            } else {
                "unexpected syntax".to_string()
            };
            Validation::Invalid(format!(
                "{}:{}: {} ({} parse)",
                pos.row + 1,
                pos.column + 1,
                what,
                kind.name()
            ))
        }
    }
}

/// Depth-first search for the first ERROR or MISSING node.
fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}
