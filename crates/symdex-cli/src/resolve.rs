use std::path::{Path, PathBuf};
use symdex_cache::normalize_ref;

pub const SYMBOL_REF_SCHEME: &str = "sym://";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("empty symbol reference")]
    Empty,
    #[error("`{symbol_ref}` does not name a file under {root}")]
    NotFound { symbol_ref: String, root: PathBuf },
    #[error("`{symbol_ref}` resolves outside the segment root {root}")]
    OutsideRoot { symbol_ref: String, root: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A symbol reference resolved to a file inside the segment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    /// Canonical absolute path of the file.
    pub path: PathBuf,
    /// Path relative to the segment root with `/` separators.
    pub rel_path: String,
    /// Part after `#`, if any. Informational; the whole file is outlined.
    pub fragment: Option<String>,
}

/// Resolve `sym://<rel path>[#fragment]`, or a plain path, against `root`.
///
/// Plain relative paths are taken relative to `root`, not the working
/// directory, so the same reference means the same file from anywhere.
pub fn resolve(root: &Path, symbol_ref: &str) -> Result<ResolvedRef, ResolveError> {
    let trimmed = symbol_ref.trim();
    let (target, fragment) = match trimmed.strip_prefix(SYMBOL_REF_SCHEME) {
        Some(rest) => {
            let (path, fragment) = match rest.split_once('#') {
                Some((path, fragment)) => (path, Some(fragment.to_owned())),
                None => (rest, None),
            };
            (path.trim_start_matches('/').to_owned(), fragment)
        }
        None => (trimmed.to_owned(), None),
    };
    if target.is_empty() {
        return Err(ResolveError::Empty);
    }

    let root = std::fs::canonicalize(root)?;
    let candidate = {
        let target = PathBuf::from(normalize_ref(&target));
        if target.is_absolute() {
            target
        } else {
            root.join(target)
        }
    };

    let path = match std::fs::canonicalize(&candidate) {
        Ok(path) if path.is_file() => path,
        Ok(_) => {
            return Err(ResolveError::NotFound {
                symbol_ref: symbol_ref.to_owned(),
                root,
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResolveError::NotFound {
                symbol_ref: symbol_ref.to_owned(),
                root,
            })
        }
        Err(err) => return Err(err.into()),
    };

    let Ok(rel) = path.strip_prefix(&root) else {
        return Err(ResolveError::OutsideRoot {
            symbol_ref: symbol_ref.to_owned(),
            root,
        });
    };
    let rel_path = rel
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    Ok(ResolvedRef {
        path,
        rel_path,
        fragment,
    })
}
