//! # Policy QA Chunker
//!
//! Splits extracted document text into overlapping fixed-size windows that
//! serve as the unit of retrieval.
//!
//! The windows are measured in characters, not bytes, so multi-byte text
//! never splits inside a code point. Consecutive chunks share a configurable
//! overlap so that sentences cut by a window boundary still appear whole in
//! a neighboring chunk.
//!
//! ## Example
//!
//! ```rust
//! use policyqa_chunker::{chunk_text, ChunkerConfig};
//!
//! let config = ChunkerConfig { chunk_size: 40, overlap: 10 };
//! let chunks = chunk_text("some long policy text ...", &config).unwrap();
//! for chunk in &chunks {
//!     println!("{chunk}");
//! }
//! ```

mod chunker;
mod config;
mod error;

pub use chunker::chunk_text;
pub use config::ChunkerConfig;
pub use error::{ChunkerError, Result};
