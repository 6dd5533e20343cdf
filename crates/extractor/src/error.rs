use std::path::PathBuf;
use thiserror::Error;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors that can occur while extracting text from a source document
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The source document does not exist
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The file extension is not one of txt/pdf/doc/docx
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// The PDF container could not be parsed
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    /// The word-processor container could not be parsed
    #[error("DOCX error: {0}")]
    Docx(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Create a DOCX parse error
    pub fn docx(msg: impl ToString) -> Self {
        Self::Docx(msg.to_string())
    }
}
