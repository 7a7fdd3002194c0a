use std::cmp;

use crate::shared::utils::estimate_token_count;

/// Extraction failure; surfaces as the document's `error_message` and a
/// `failed` status.
#[derive(Debug)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParseError: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Pluggable text extraction keyed by file type. PDF/DOCX extraction is an
/// integration concern; the built-ins cover the text formats the pipeline
/// owns end to end.
pub trait DocumentParser: Send + Sync + std::fmt::Debug {
    fn parse(&self, data: &[u8]) -> Result<String, ParseError>;
}

#[derive(Debug)]
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, data: &[u8]) -> Result<String, ParseError> {
        let text = String::from_utf8_lossy(data).replace("\r\n", "\n");
        if text.trim().is_empty() {
            return Err(ParseError("document is empty".to_string()));
        }
        Ok(text)
    }
}

#[derive(Debug)]
pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn parse(&self, data: &[u8]) -> Result<String, ParseError> {
        // Markdown is chunked as-is; heading markers carry useful structure
        // for retrieval, so only line endings are normalised.
        PlainTextParser.parse(data)
    }
}

pub fn parser_for(file_type: &str) -> Result<Box<dyn DocumentParser>, ParseError> {
    match file_type.trim_start_matches('.').to_lowercase().as_str() {
        "txt" | "text" | "text/plain" | "log" | "csv" => Ok(Box::new(PlainTextParser)),
        "md" | "markdown" | "text/markdown" => Ok(Box::new(MarkdownParser)),
        other => Err(ParseError(format!("unsupported file type '{}'", other))),
    }
}

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: i32,
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
}

/// Separators tried in priority order when backscanning for a natural split
/// point inside the last 20% of a chunk window.
const SEPARATORS: [&str; 8] = ["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " "];

/// Split text into overlapping chunks of at most `chunk_size` characters,
/// preferring paragraph/sentence boundaries. Offsets are char offsets into
/// the source text.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_index = 0i32;

    while start < total {
        let hard_end = cmp::min(start + chunk_size, total);
        let mut end = hard_end;

        if hard_end < total {
            let search_start = cmp::max(start, hard_end.saturating_sub(chunk_size / 5));
            let window: String = chars[search_start..hard_end].iter().collect();
            for sep in SEPARATORS {
                if let Some(byte_pos) = window.rfind(sep) {
                    let char_pos = window[..byte_pos].chars().count();
                    let candidate = search_start + char_pos + sep.chars().count();
                    if candidate > start {
                        end = candidate;
                    }
                    break;
                }
            }
        }

        let content: String = chars[start..end].iter().collect();
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                content: trimmed.to_string(),
                chunk_index,
                start_char: start,
                end_char: end,
                token_count: estimate_token_count(trimmed),
            });
            chunk_index += 1;
        }

        if end >= total {
            break;
        }
        start = cmp::max(start + 1, end.saturating_sub(overlap));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("", 100, 20).is_empty());
        assert!(chunk_text("   \n\n  ", 100, 20).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = chunk_text("Hello world.", 100, 20);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Hello world.");
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_chunk_indexes_are_contiguous() {
        let text = "one two three four five. ".repeat(50);
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i32);
            assert!(chunk.content.chars().count() <= 100);
        }
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = format!("{}. {}", "a".repeat(80), "b".repeat(80));
        let chunks = chunk_text(&text, 100, 10);
        assert!(chunks[0].content.ends_with('a') || chunks[0].content.ends_with('.'));
    }

    #[test]
    fn test_overlap_repeats_tail_content() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, 60, 20);
        assert!(chunks.len() >= 2);
        // consecutive chunks overlap in source range
        assert!(chunks[1].start_char < chunks[0].end_char);
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "héllo wörld. ".repeat(40);
        let chunks = chunk_text(&text, 50, 10);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_parser_for_known_types() {
        assert!(parser_for("txt").is_ok());
        assert!(parser_for("md").is_ok());
        assert!(parser_for(".markdown").is_ok());
        assert!(parser_for("pdf").is_err());
    }

    #[test]
    fn test_plain_text_parser_rejects_empty() {
        assert!(PlainTextParser.parse(b"   ").is_err());
        assert!(PlainTextParser.parse(b"content").is_ok());
    }

    #[test]
    fn test_plain_text_parser_normalises_crlf() {
        let text = PlainTextParser.parse(b"a\r\nb").unwrap();
        assert_eq!(text, "a\nb");
    }
}
