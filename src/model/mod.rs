//! Normalized book records.

pub mod types;

pub use types::{BookEntry, BookMetadata};
