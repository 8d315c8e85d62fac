//! Embedding API

pub mod public;

pub use public::InfiniteTracing;
