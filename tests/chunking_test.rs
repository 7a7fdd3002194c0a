use ragserver::documents::parser::{chunk_text, parser_for, DocumentParser, PlainTextParser};

#[test]
fn test_chunks_cover_the_whole_document() {
    let text = "The capital of France is Paris. ".repeat(120);
    let chunks = chunk_text(&text, 500, 100);

    assert!(!chunks.is_empty());
    assert_eq!(chunks[0].start_char, 0);
    assert_eq!(chunks.last().unwrap().end_char, text.chars().count());

    // No gaps between consecutive chunk ranges.
    for pair in chunks.windows(2) {
        assert!(pair[1].start_char <= pair[0].end_char);
        assert!(pair[1].start_char > pair[0].start_char);
    }
}

#[test]
fn test_chunk_indexes_contiguous_from_zero() {
    let text = "word ".repeat(500);
    let chunks = chunk_text(&text, 300, 60);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i32);
        assert!(chunk.token_count > 0);
    }
}

#[test]
fn test_single_oversized_word_still_chunks() {
    let text = "x".repeat(5000);
    let chunks = chunk_text(&text, 1000, 200);
    assert!(chunks.len() >= 5);
    for chunk in &chunks {
        assert!(chunk.content.chars().count() <= 1000);
    }
}

#[test]
fn test_empty_document_fails_parse() {
    assert!(PlainTextParser.parse(b"").is_err());
    assert!(PlainTextParser.parse(b"\n\n   \n").is_err());
}

#[test]
fn test_unsupported_file_type_fails_parse() {
    let err = parser_for("docx").unwrap_err();
    assert!(err.to_string().starts_with("ParseError"));
}

#[test]
fn test_markdown_keeps_structure_markers() {
    let parser = parser_for("md").unwrap();
    let text = parser.parse(b"# Title\r\n\r\nBody text.").unwrap();
    assert!(text.contains("# Title"));
    assert!(!text.contains('\r'));
}
