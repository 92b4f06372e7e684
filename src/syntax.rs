//! Syntax-aware code units via tree-sitter.
//!
//! A source file becomes two kinds of units:
//!
//! - **Definitions** at any depth (functions, methods, classes, structs,
//!   traits, impls, interfaces, ...). The unit's span is exactly the
//!   definition node's first and last line.
//! - **Module blocks**: runs of consecutive top-level statements that are
//!   not definitions (imports, constants, module-level calls), grouped at
//!   node boundaries up to the chunk budget.
//!
//! Both kinds always start and end on statement boundaries, never
//! mid-statement. Files whose tree contains syntax errors are reported as
//! [`SyntaxOutcome::Failed`] so the caller can degrade them.

use tree_sitter::{Language, Node, Parser};

/// A syntactically complete line span (1-based, inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub start_line: usize,
    pub end_line: usize,
    /// Definition name; `None` for module blocks.
    pub symbol: Option<String>,
}

#[derive(Debug)]
pub enum SyntaxOutcome {
    Parsed(Vec<CodeUnit>),
    /// No grammar is bundled for this file type.
    Unsupported,
    /// The grammar exists but the file did not parse cleanly.
    Failed(String),
}

/// Get the tree-sitter language for a file path.
pub fn language_for_path(path: &str) -> Option<Language> {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_lowercase())?;
    match ext.as_str() {
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "ts" | "mts" | "cts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

fn is_definition(kind: &str) -> bool {
    matches!(
        kind,
        // Python
        "function_definition"
            | "class_definition"
            | "decorated_definition"
            // Rust
            | "function_item"
            | "struct_item"
            | "enum_item"
            | "union_item"
            | "trait_item"
            | "impl_item"
            | "mod_item"
            | "macro_definition"
            // JavaScript / TypeScript
            | "function_declaration"
            | "generator_function_declaration"
            | "class_declaration"
            | "abstract_class_declaration"
            | "method_definition"
            | "interface_declaration"
            | "enum_declaration"
            | "type_alias_declaration"
            // Go
            | "method_declaration"
            | "type_declaration"
            // Java
            | "constructor_declaration"
            | "record_declaration"
    )
}

/// Parse `source` and return its code units, sorted by span.
pub fn code_units(path: &str, source: &str, max_chars: usize) -> SyntaxOutcome {
    let Some(language) = language_for_path(path) else {
        return SyntaxOutcome::Unsupported;
    };

    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&language) {
        return SyntaxOutcome::Failed(format!("grammar rejected: {}", e));
    }
    let Some(tree) = parser.parse(source, None) else {
        return SyntaxOutcome::Failed("parser returned no tree".to_string());
    };

    let root = tree.root_node();
    if root.has_error() {
        return SyntaxOutcome::Failed(first_error_location(&root));
    }

    let bytes = source.as_bytes();
    let mut units = Vec::new();
    collect_definitions(&root, bytes, &mut units);
    collect_module_blocks(&root, max_chars, &mut units);

    units.sort_by(|a, b| (a.start_line, a.end_line).cmp(&(b.start_line, b.end_line)));
    units.dedup_by(|a, b| a.start_line == b.start_line && a.end_line == b.end_line);
    SyntaxOutcome::Parsed(units)
}

/// Line span of a node, treating an end at column 0 as the previous line.
fn node_lines(node: &Node) -> (usize, usize) {
    let start = node.start_position();
    let end = node.end_position();
    let end_row = if end.column == 0 && end.row > start.row {
        end.row - 1
    } else {
        end.row
    };
    (start.row + 1, end_row + 1)
}

fn definition_name(node: &Node, source: &[u8]) -> Option<String> {
    let target = if node.kind() == "decorated_definition" {
        node.child_by_field_name("definition")?
    } else {
        *node
    };
    if let Some(name) = target.child_by_field_name("name") {
        return name.utf8_text(source).ok().map(|s| s.to_string());
    }
    // Go type declarations carry the name on their type_spec child;
    // Rust impls on their type.
    let mut cursor = target.walk();
    let found = target
        .named_children(&mut cursor)
        .find_map(|child| child.child_by_field_name("name"))
        .or_else(|| target.child_by_field_name("type"));
    found
        .and_then(|n| n.utf8_text(source).ok())
        .map(|s| s.to_string())
}

fn collect_definitions(node: &Node, source: &[u8], units: &mut Vec<CodeUnit>) {
    let kind = node.kind();
    let wrapped_by_decorator = node
        .parent()
        .map(|p| p.kind() == "decorated_definition")
        .unwrap_or(false);

    if is_definition(kind) && !wrapped_by_decorator {
        let (start_line, end_line) = node_lines(node);
        units.push(CodeUnit {
            start_line,
            end_line,
            symbol: definition_name(node, source),
        });
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_definitions(&child, source, units);
    }
}

fn contains_definition(node: &Node) -> bool {
    let mut cursor = node.walk();
    let found = node
        .named_children(&mut cursor)
        .any(|child| is_definition(child.kind()));
    found
}

/// Group consecutive top-level non-definition statements.
fn collect_module_blocks(root: &Node, max_chars: usize, units: &mut Vec<CodeUnit>) {
    let mut current: Option<(usize, usize, usize)> = None;
    let mut flush = |current: &mut Option<(usize, usize, usize)>| {
        if let Some((start_line, end_line, _)) = current.take() {
            units.push(CodeUnit {
                start_line,
                end_line,
                symbol: None,
            });
        }
    };

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if is_definition(child.kind()) || contains_definition(&child) {
            flush(&mut current);
            continue;
        }
        let (start, end) = node_lines(&child);
        let size = child.end_byte() - child.start_byte();
        current = match current {
            Some((s, _, chars)) if chars + size <= max_chars => Some((s, end, chars + size)),
            Some(_) => {
                flush(&mut current);
                Some((start, end, size))
            }
            None => Some((start, end, size)),
        };
    }
    flush(&mut current);
}

fn first_error_location(root: &Node) -> String {
    let mut stack = vec![*root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            return format!("syntax error at line {}", pos.row + 1);
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    "syntax error".to_string()
}
