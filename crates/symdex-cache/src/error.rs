pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache storage and coordination.
///
/// None of these escape [`crate::SymbolCache::lookup_or_compute`]; the facade
/// degrades to "operate without the cache" instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether the error means the store file itself is unusable (as opposed to
    /// a transient condition such as a busy database).
    pub(crate) fn is_corrupt_store(&self) -> bool {
        match self {
            CacheError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
            ),
            CacheError::Bincode(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_database_is_classified_as_corrupt() {
        let err = CacheError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        ));
        assert!(err.is_corrupt_store());

        let busy = CacheError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(!busy.is_corrupt_store());
    }
}
