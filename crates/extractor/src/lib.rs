//! # Policy QA Extractor
//!
//! Turns a source document on disk into a single text blob.
//!
//! Dispatch is by file extension:
//! - `.txt` is read verbatim
//! - `.pdf` concatenates per-page extracted text in page order
//! - `.doc`/`.docx` concatenates paragraph text in document order
//!
//! Anything else fails with [`ExtractError::UnsupportedFormat`]; a missing
//! file fails with [`ExtractError::FileNotFound`]. A PDF page that yields no
//! extractable text contributes an empty string instead of failing the
//! whole document.

mod docx;
mod error;
mod extract;
mod pdf;

pub use error::{ExtractError, Result};
pub use extract::extract_text;
