//! Line-boundary segmenter for analysis payloads.
//!
//! The analysis service accepts a bounded prompt size, so a combined
//! payload is split into ordered segments of at most `max_chars`
//! characters. Splits happen only between lines; a single line longer than
//! the cap becomes its own oversized segment instead of being cut.

/// Default maximum segment size in characters.
pub const DEFAULT_MAX_SEGMENT_CHARS: usize = 12_000;

/// Split `text` into ordered segments at line boundaries.
///
/// Segment length counts characters, including the `\n` separators kept
/// between joined lines. Empty input yields no segments.
///
/// # Example
///
/// ```rust
/// use capture_harness_core::segment::split_into_segments;
///
/// let segments = split_into_segments("aaa\nbbb\nccc", 7);
/// assert_eq!(segments, vec!["aaa\nbbb", "ccc"]);
/// ```
pub fn split_into_segments(text: &str, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let joined_len = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if joined_len > max_chars && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        segments.push(current);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_input_single_segment() {
        let segments = split_into_segments("line one\nline two", 100);
        assert_eq!(segments, vec!["line one\nline two"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(split_into_segments("", 10).is_empty());
        assert!(split_into_segments("\n\n", 10).is_empty());
    }

    #[test]
    fn test_respects_cap_and_order() {
        let text = (0..100)
            .map(|i| format!("line {:03}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let segments = split_into_segments(&text, 50);
        assert!(segments.len() > 1);
        for s in &segments {
            assert!(s.chars().count() <= 50, "segment too long: {}", s.len());
        }
        assert_eq!(segments.join("\n"), text);
    }

    #[test]
    fn test_oversized_line_kept_whole() {
        let long = "x".repeat(30);
        let text = format!("short\n{}\ntail", long);
        let segments = split_into_segments(&text, 10);
        assert_eq!(segments, vec!["short".to_string(), long, "tail".to_string()]);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let text = "ééééé\nééééé";
        let segments = split_into_segments(text, 11);
        assert_eq!(segments.len(), 1);
    }
}
