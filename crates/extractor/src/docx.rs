use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ExtractError, Result};

/// Extract paragraph text from a word-processor document.
///
/// A `.docx` file is a zip container; the body lives in `word/document.xml`
/// as `<w:p>` paragraphs whose visible text sits in `<w:t>` runs. Paragraphs
/// are emitted in document order, joined by newlines.
pub(crate) fn extract_docx_text(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(ExtractError::docx)?;
    let mut part = archive
        .by_name("word/document.xml")
        .map_err(ExtractError::docx)?;

    let mut xml = String::new();
    part.read_to_string(&mut xml)?;

    paragraphs_from_document_xml(&xml)
}

fn paragraphs_from_document_xml(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => {
                in_run_text = true;
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_run_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Text(text)) if in_run_text => {
                let piece = text.unescape().map_err(ExtractError::docx)?;
                current.push_str(&piece);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ExtractError::docx(err)),
        }
    }

    // A trailing run outside any closed paragraph still counts.
    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    const DOCUMENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Remote work policy</w:t></w:r></w:p>
    <w:p><w:r><w:t>Approval is </w:t></w:r><w:r><w:t>required.</w:t></w:r></w:p>
    <w:p></w:p>
  </w:body>
</w:document>"#;

    fn write_docx(path: &Path, document_xml: &str) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("word/document.xml", options).unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_paragraphs_in_document_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.docx");
        write_docx(&path, DOCUMENT_XML);

        let text = extract_docx_text(&path).unwrap();
        assert_eq!(text, "Remote work policy\nApproval is required.\n");
    }

    #[test]
    fn test_split_runs_are_joined_within_a_paragraph() {
        let text = paragraphs_from_document_xml(
            r#"<w:document xmlns:w="ns"><w:body><w:p><w:r><w:t>a</w:t></w:r><w:r><w:t>b</w:t></w:r></w:p></w:body></w:document>"#,
        )
        .unwrap();
        assert_eq!(text, "ab");
    }

    #[test]
    fn test_not_a_zip_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.docx");
        std::fs::write(&path, "plain text pretending to be docx").unwrap();

        let err = extract_docx_text(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }
}
