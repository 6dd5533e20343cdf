use std::fs;
use std::path::Path;

use crate::docx::extract_docx_text;
use crate::error::{ExtractError, Result};
use crate::pdf::extract_pdf_text;

/// Extract the full text content of a source document.
///
/// The format is chosen from the (case-insensitive) file extension.
pub fn extract_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ExtractError::FileNotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    log::debug!("Extracting text from {} ({extension})", path.display());

    match extension.as_str() {
        "txt" => Ok(fs::read_to_string(path)?),
        "pdf" => extract_pdf_text(path),
        "doc" | "docx" => extract_docx_text(path),
        _ => Err(ExtractError::UnsupportedFormat(format!(".{extension}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_plain_text_is_read_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.txt");
        fs::write(&path, "  Remote work requires approval.\n").unwrap();

        let text = extract_text(&path).unwrap();
        assert_eq!(text, "  Remote work requires approval.\n");
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.txt");

        let err = extract_text(&path).unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.rtf");
        fs::write(&path, "{\\rtf1 not supported}").unwrap();

        let err = extract_text(&path).unwrap_err();
        match err {
            ExtractError::UnsupportedFormat(ext) => assert_eq!(ext, ".rtf"),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_extension_case_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.TXT");
        fs::write(&path, "case test").unwrap();

        assert_eq!(extract_text(&path).unwrap(), "case test");
    }
}
