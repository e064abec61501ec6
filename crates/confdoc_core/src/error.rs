use thiserror::Error;

/// Failures reported by a page store that callers may want to match on.
///
/// They are returned inside `anyhow::Error`; use `downcast_ref::<StoreError>()`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on page {page_id}: expected version {version} is stale")]
    VersionConflict { page_id: u64, version: u64 },

    #[error("page {0} not found")]
    PageNotFound(u64),

    #[error(
        "Multiple results found for query (pageIds={}). Will only continue for unique result.",
        join_ids(page_ids)
    )]
    AmbiguousPage { query: String, page_ids: Vec<u64> },

    #[error("space {0} has no home page; pass a parent page id")]
    MissingSpaceHome(String),

    #[error("confluence request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn is_version_conflict(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<StoreError>(),
        Some(StoreError::VersionConflict { .. })
    )
}
