use std::path::Path;

use lopdf::Document;

use crate::error::Result;

/// Extract text from a PDF, page by page, joined by newlines.
///
/// A page that yields no extractable text (scanned image, odd encoding)
/// contributes an empty string; only a broken container fails the document.
pub(crate) fn extract_pdf_text(path: &Path) -> Result<String> {
    let document = Document::load(path)?;

    let pages: Vec<String> = document
        .get_pages()
        .keys()
        .map(|page_number| {
            document
                .extract_text(&[*page_number])
                .unwrap_or_else(|err| {
                    log::warn!("No extractable text on PDF page {page_number}: {err}");
                    String::new()
                })
        })
        .collect();

    Ok(pages.join("\n"))
}
