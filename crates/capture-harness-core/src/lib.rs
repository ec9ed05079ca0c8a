//! # Capture Harness Core
//!
//! Pure logic shared by the capture pipeline: inter-stage schemas, HTML
//! cleaning and structural chunking, analysis segment splitting, and the
//! store traits with in-memory implementations.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network code.

pub mod chunk;
pub mod clean;
pub mod error;
pub mod models;
pub mod segment;
pub mod store;

pub use error::ParseError;
