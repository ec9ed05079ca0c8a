//! Errors raised by the pure cleaning and chunking stages.

use thiserror::Error;

/// Why an HTML capture could not be turned into a [`ChunkedDocument`](crate::models::ChunkedDocument).
///
/// The engine never retries; the caller decides whether to skip the
/// capture or fail it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("html input is empty")]
    Empty,

    #[error("html input is {size} bytes, limit is {limit}")]
    Oversized { size: usize, limit: usize },

    #[error("html document has no <body>")]
    MissingBody,
}
