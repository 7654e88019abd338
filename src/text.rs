//! Shared text utilities: chunking for platform length limits, content
//! fingerprinting for the dedup window, and safe truncation.

/// Split text into chunks of at most `max_len` bytes, preferring natural
/// boundaries. Within the window `[max_len / 2, max_len]` the latest newline
/// wins, then the latest sentence end (`". "`), then the latest space;
/// otherwise the text is hard-cut at a char boundary. Whitespace is trimmed
/// at split points, so the concatenation of chunks equals the input modulo
/// that trimming.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0, "chunk limit must be positive");

    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let hard = remaining.floor_char_boundary(max_len);
        let floor = max_len / 2;
        let window = &remaining[..hard];

        let split_at = window
            .rfind('\n')
            .filter(|&i| i >= floor)
            // Keep the period with the sentence it terminates.
            .or_else(|| window.rfind(". ").map(|i| i + 1).filter(|&i| i >= floor))
            .or_else(|| window.rfind(' ').filter(|&i| i >= floor))
            .unwrap_or(hard);

        chunks.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}

/// Stable 32-bit FNV-1a fold of message content, keyed per user in the dedup
/// window. Non-cryptographic: the window is seconds, adversarial collisions
/// are out of threat model.
pub fn content_fingerprint(content: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in content.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Truncate to at most `max_len` bytes on a char boundary, appending an
/// ellipsis when content was dropped.
pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    // The ellipsis char is 3 bytes in UTF-8.
    let cut = text.floor_char_boundary(max_len.saturating_sub(3));
    format!("{}…", text[..cut].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_respect_the_limit_and_preserve_content() {
        let text = "one two three four five six seven eight nine ten ".repeat(40);
        let chunks = chunk_text(&text, 300);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 300, "chunk over limit: {}", chunk.len());
        }

        // Concatenation equals the input modulo whitespace at split points.
        let rejoined: String = chunks.join(" ");
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&rejoined), normalize(&text));
    }

    #[test]
    fn newline_boundary_is_preferred() {
        let text = format!("{}\n{}", "a".repeat(180), "b".repeat(180));
        let chunks = chunk_text(&text, 200);
        assert_eq!(chunks[0], "a".repeat(180));
        assert_eq!(chunks[1], "b".repeat(180));
    }

    #[test]
    fn sentence_boundary_beats_space() {
        let text = format!("{}. {}", "a".repeat(150), "b c d ".repeat(40));
        let chunks = chunk_text(&text, 200);
        assert_eq!(chunks[0], format!("{}.", "a".repeat(150)));
    }

    #[test]
    fn boundaries_below_half_window_are_ignored() {
        // Only boundary is at byte 10, below max/2 = 100: hard cut instead.
        let text = format!("{} {}", "a".repeat(10), "b".repeat(400));
        let chunks = chunk_text(&text, 200);
        assert_eq!(chunks[0].len(), 200);
    }

    #[test]
    fn hard_cut_lands_on_char_boundaries() {
        let text = "é".repeat(300); // 2 bytes each
        for chunk in chunk_text(&text, 101) {
            assert!(chunk.len() <= 101);
            assert!(chunk.chars().all(|c| c == 'é'));
        }
    }

    #[test]
    fn nine_thousand_chars_fit_in_three_chunks_of_4000() {
        let text = "word ".repeat(1800); // 9000 bytes
        let chunks = chunk_text(text.trim_end(), 4000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 4000));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        assert_eq!(
            content_fingerprint("Are you there?"),
            content_fingerprint("Are you there?")
        );
        assert_ne!(
            content_fingerprint("Are you there?"),
            content_fingerprint("Are you there!")
        );
    }

    #[test]
    fn truncation_appends_ellipsis_on_a_char_boundary() {
        let text = "abcdef".repeat(300);
        let truncated = truncate_with_ellipsis(&text, 100);
        assert!(truncated.len() <= 100);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate_with_ellipsis("short", 100), "short");
    }
}
