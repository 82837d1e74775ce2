//! Payloads understood by the extraction, indexing and collector actors.
//!
//! The runtime never interprets these; they are here so every actor in a deployment
//! agrees on tags, shapes and validation rules.

pub mod extractor;
pub mod indexer;
pub mod telegram;
pub mod vk;
