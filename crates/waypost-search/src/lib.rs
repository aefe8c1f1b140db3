//! Profile search engine.
//!
//! A search is a conjunction of optional predicates evaluated over a snapshot
//! of profile records:
//!
//! - **type / name**: case-sensitive wildcard match (`*`, `?`)
//! - **extra data**: regular expression from a restricted, statically checked grammar
//! - **location**: haversine distance within a radius
//!
//! Matches are kept in a per-connection [`SearchResultSet`] that can be
//! re-read page by page.

pub mod cursor;
pub mod geo;
pub mod pattern;
pub mod query;
pub mod wildcard;

pub use cursor::SearchResultSet;
pub use query::{CompiledQuery, SearchQuery};

use thiserror::Error;
use waypost_types::error::WaypostError;

/// Errors produced by search validation and paging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    /// A query or paging field is out of range. Holds the wire field name.
    #[error("Invalid value in field '{0}'")]
    InvalidValue(&'static str),
    /// Paging was requested before any search on this connection.
    #[error("No search result set")]
    NoCursor,
}

impl From<SearchError> for WaypostError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidValue(field) => WaypostError::invalid_value(field),
            SearchError::NoCursor => WaypostError::NotAvailable("no search result set".into()),
        }
    }
}

/// Result type for search operations.
pub type SearchResult<T> = Result<T, SearchError>;
