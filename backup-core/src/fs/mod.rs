//! File system helpers: source walking and metadata preservation.

pub mod metadata;
pub mod walker;
