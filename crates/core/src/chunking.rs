use crate::config::ChunkingOptions;
use crate::error::IngestError;
use crate::models::Chunk;

/// Canonicalizes text before chunking: paragraph breaks survive as exactly
/// one blank line, all other whitespace collapses to single spaces. Chunk
/// ids hash this form, so it is the determinism anchor for re-ingestion.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\u{a0}', " ");
    let mut paragraphs = Vec::new();
    for block in unified.split("\n\n") {
        let collapsed = block.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            paragraphs.push(collapsed);
        }
    }
    paragraphs.join("\n\n")
}

/// Splits a document into ordered, overlapping windows of at most
/// `chunk_chars` characters. Window ends prefer a paragraph break, then a
/// sentence break, before falling back to a hard character cut. Offsets are
/// character offsets into the normalized text.
pub fn split(
    source_id: &str,
    text: &str,
    options: &ChunkingOptions,
) -> Result<Vec<Chunk>, IngestError> {
    if options.chunk_chars == 0 {
        return Err(IngestError::InvalidChunkConfig(
            "chunk_chars must be positive".to_string(),
        ));
    }
    if options.overlap_chars >= options.chunk_chars {
        return Err(IngestError::InvalidChunkConfig(format!(
            "overlap_chars ({}) must be smaller than chunk_chars ({})",
            options.overlap_chars, options.chunk_chars
        )));
    }
    if options.min_chunk_chars > options.chunk_chars {
        return Err(IngestError::InvalidChunkConfig(format!(
            "min_chunk_chars ({}) must not exceed chunk_chars ({})",
            options.min_chunk_chars, options.chunk_chars
        )));
    }

    let normalized = normalize_text(text);
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut start = 0usize;
    loop {
        let remaining = chars.len() - start;
        if remaining <= options.chunk_chars {
            // A sub-minimum tail would be mostly overlap text. Back-shift it
            // to a full-size final window instead, replacing any chunk the
            // shifted window now fully covers.
            if remaining < options.min_chunk_chars && !chunks.is_empty() {
                start = chars.len().saturating_sub(options.chunk_chars);
                while chunks
                    .last()
                    .map_or(false, |prev| prev.start_offset >= start)
                {
                    chunks.pop();
                }
            }
            push_chunk(&mut chunks, source_id, &chars, start, chars.len());
            break;
        }

        let end = cut_point(&chars, start, start + options.chunk_chars, options.min_chunk_chars);
        push_chunk(&mut chunks, source_id, &chars, start, end);
        start = end.saturating_sub(options.overlap_chars).max(start + 1);
    }

    Ok(chunks)
}

fn push_chunk(chunks: &mut Vec<Chunk>, source_id: &str, chars: &[char], start: usize, end: usize) {
    let text: String = chars[start..end].iter().collect();
    let prev_end = chunks
        .last()
        .map(|prev| prev.start_offset + prev.text.chars().count())
        .unwrap_or(0);
    let overlap_with_prev = prev_end.saturating_sub(start).min(end - start);
    let id = Chunk::make_id(source_id, start, &text);
    chunks.push(Chunk {
        id,
        source_id: source_id.to_string(),
        text,
        start_offset: start,
        overlap_with_prev,
    });
}

/// Best cut position in `(start + min_chars, window_end]`: last paragraph
/// break, else last sentence break, else the window end itself.
fn cut_point(chars: &[char], start: usize, window_end: usize, min_chars: usize) -> usize {
    let floor = start + min_chars.max(1);

    let mut i = window_end;
    while i > floor && i >= 2 {
        if chars[i - 1] == '\n' && chars[i - 2] == '\n' {
            return i;
        }
        i -= 1;
    }

    let mut i = window_end;
    while i > floor && i >= 2 {
        if chars[i - 1] == ' ' && matches!(chars[i - 2], '.' | '?' | '!') {
            return i;
        }
        i -= 1;
    }

    window_end
}
