use crate::config::ChunkerConfig;
use crate::error::Result;

/// Split `text` into overlapping windows of `config.chunk_size` characters.
///
/// Each window spans `[start, min(start + chunk_size, len))` in characters
/// and is whitespace-trimmed before storage. The window that reaches the end
/// of the text is the last one; otherwise the next window starts
/// `overlap` characters before the previous end.
///
/// Empty input produces an empty sequence. Input shorter than the chunk size
/// produces exactly one chunk equal to the trimmed input.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Result<Vec<String>> {
    config.validate()?;

    // Byte offset of every character, so windows can be counted in
    // characters while slicing stays on valid boundaries.
    let boundaries: Vec<usize> = text.char_indices().map(|(offset, _)| offset).collect();
    let total_chars = boundaries.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total_chars {
        let end = usize::min(start + config.chunk_size, total_chars);
        let byte_start = boundaries[start];
        let byte_end = if end == total_chars {
            text.len()
        } else {
            boundaries[end]
        };

        chunks.push(text[byte_start..byte_end].trim().to_string());

        if end == total_chars {
            break;
        }
        start = end - config.overlap;
    }

    log::debug!(
        "Chunked {} characters into {} windows (size={}, overlap={})",
        total_chars,
        chunks.len(),
        config.chunk_size,
        config.overlap
    );

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(chunk_size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size,
            overlap,
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunks = chunk_text("", &ChunkerConfig::default()).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_text_yields_single_trimmed_chunk() {
        let chunks = chunk_text("  hello world  ", &ChunkerConfig::default()).unwrap();
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn test_window_arithmetic() {
        // 100 digits, no whitespace, so trimming is a no-op and the raw
        // window lengths are observable.
        let text: String = std::iter::repeat("0123456789").take(10).collect();
        let chunks = chunk_text(&text, &config(40, 10)).unwrap();

        // [0, 40), [30, 70), [60, 100)
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 40);
        assert_eq!(chunks[1].len(), 40);
        assert_eq!(chunks[2].len(), 40);
        assert_eq!(chunks[2], text[60..100]);
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let text: String = ('a'..='z').cycle().take(95).collect();
        let chunks = chunk_text(&text, &config(40, 10)).unwrap();

        for pair in chunks.windows(2) {
            let tail = &pair[0][pair[0].len() - 10..];
            assert!(pair[1].starts_with(tail));
        }
        // The last chunk ends exactly at the end of the text.
        let last = chunks.last().unwrap();
        assert!(text.ends_with(last.as_str()));
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text: String = std::iter::repeat('é').take(50).collect();
        let chunks = chunk_text(&text, &config(20, 5)).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].chars().count(), 20);
    }

    #[test]
    fn test_policy_scenario_produces_three_chunks() {
        let text =
            "The policy allows remote work on Tuesdays. Remote work requires manager approval.";
        assert_eq!(text.len(), 81);

        let chunks = chunk_text(text, &config(40, 10)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].contains("approval"));
    }

    #[test]
    fn test_invalid_overlap_is_rejected() {
        let err = chunk_text("some text", &config(10, 10)).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }
}
