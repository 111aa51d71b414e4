//! Top-level outline extraction.
//!
//! A deliberately shallow, line-based scan: only declarations starting in
//! column 0 are reported, which is enough to outline Python, Rust, JS/TS and
//! Go sources without a real parser.

use symdex_cache::{Symbol, SymbolKind};

#[derive(Debug, thiserror::Error)]
pub enum OutlineError {
    #[error("source is not valid UTF-8 (first invalid byte at offset {offset})")]
    NotUtf8 { offset: usize },
}

/// Extract top-level declarations from `bytes`, in source order.
pub fn extract(bytes: &[u8]) -> Result<Vec<Symbol>, OutlineError> {
    let text = std::str::from_utf8(bytes).map_err(|err| OutlineError::NotUtf8 {
        offset: err.valid_up_to(),
    })?;

    let mut symbols = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some((kind, name)) = declaration(line) {
            symbols.push(Symbol::new(name, kind, idx as u32 + 1));
        }
    }
    Ok(symbols)
}

fn declaration(line: &str) -> Option<(SymbolKind, &str)> {
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = strip_modifiers(line);
    let (keyword, rest) = split_word(rest)?;

    let (kind, rest) = match keyword {
        "def" | "fn" | "function" => (SymbolKind::Function, rest),
        "func" => (SymbolKind::Function, skip_receiver(rest)),
        "class" => (SymbolKind::Class, rest),
        "struct" => (SymbolKind::Struct, rest),
        "enum" => (SymbolKind::Enum, rest),
        "trait" => (SymbolKind::Trait, rest),
        "interface" => (SymbolKind::Interface, rest),
        "mod" | "module" => (SymbolKind::Module, rest),
        "const" => match split_word(strip_modifiers(rest)) {
            // Rust `const fn`, `const unsafe fn`, `const async fn`.
            Some(("fn", after)) => (SymbolKind::Function, after),
            _ => (SymbolKind::Constant, rest),
        },
        "type" => return go_type(rest),
        _ => return None,
    };

    let rest = rest.trim_start().trim_start_matches('*').trim_start();
    let name = identifier(rest)?;
    Some((kind, name))
}

/// Drop visibility and async/export qualifiers: `pub(crate) async fn`, `export default class`.
fn strip_modifiers(mut line: &str) -> &str {
    loop {
        let trimmed = line.trim_start();
        let next = if let Some(rest) = trimmed.strip_prefix("pub(") {
            rest.find(')').map(|end| &rest[end + 1..])
        } else {
            match split_word(trimmed) {
                Some((
                    "pub" | "export" | "default" | "async" | "unsafe" | "abstract" | "declare",
                    rest,
                )) => Some(rest),
                _ => None,
            }
        };
        match next {
            Some(rest) => line = rest,
            None => return trimmed,
        }
    }
}

/// Go method receivers: `func (s *Server) Start()`.
fn skip_receiver(rest: &str) -> &str {
    let trimmed = rest.trim_start();
    match trimmed.strip_prefix('(') {
        Some(inner) => inner.find(')').map_or("", |end| &inner[end + 1..]),
        None => trimmed,
    }
}

/// Go `type Name struct` / `type Name interface`. Other type aliases are skipped.
fn go_type(rest: &str) -> Option<(SymbolKind, &str)> {
    let name = identifier(rest.trim_start())?;
    let after = rest.trim_start()[name.len()..].trim_start();
    let (keyword, _) = split_word(after)?;
    match keyword {
        "struct" => Some((SymbolKind::Struct, name)),
        "interface" => Some((SymbolKind::Interface, name)),
        _ => None,
    }
}

fn split_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    let end = input
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(input.len());
    (end > 0).then(|| (&input[..end], &input[end..]))
}

fn identifier(input: &str) -> Option<&str> {
    let end = input
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(input.len());
    let name = &input[..end];
    match name.chars().next() {
        Some(first) if !first.is_ascii_digit() => Some(name),
        _ => None,
    }
}
