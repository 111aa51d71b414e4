use crate::key::CacheKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the symbol extraction output and cache record shape.
///
/// Bump whenever the extractor's output or [`Symbol`] changes; it feeds both
/// the cache key and the persistent store's version marker.
pub const SYMBOL_SCHEMA_VERSION: u32 = 2;

/// Kind of a top-level declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Struct,
    Enum,
    Trait,
    Interface,
    Module,
    Constant,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Trait => "trait",
            SymbolKind::Interface => "interface",
            SymbolKind::Module => "module",
            SymbolKind::Constant => "constant",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-level symbol extracted from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based source line.
    pub line: u32,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, line: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            line: line.max(1),
        }
    }
}

/// A cached symbol list.
///
/// The symbol sequence for a given key never changes once written: a modified
/// file derives a different key and therefore a different entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub symbols: Vec<Symbol>,
    /// Name of the backend the entry was read from or written to.
    pub backend: String,
    pub segment_id: String,
    pub schema_version: u32,
    pub created_at_millis: u64,
}

/// Outcome of a facade lookup, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The symbols were computed but could not be persisted (lock timeout or
    /// storage fault).
    Degraded,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Degraded => "degraded",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
