//! Content API access and entity matching

pub mod client;
pub mod matcher;

pub use client::{ContentApiClient, ContentSource};
pub use matcher::match_item;

#[cfg(test)]
pub use client::MockContentSource;
