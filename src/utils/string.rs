//! UTF-8 safe string helpers.
//!
//! Everything here counts Unicode scalar values (chars), never bytes, so
//! cutting text in the middle of a multibyte character cannot panic.

/// Number of chars in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Return the first `n` characters of `s` as a `String`.
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// First `n` characters with a trailing `...` when `s` was longer.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix = prefix_chars(s, n);
    if char_len(s) > n {
        prefix.push_str("...");
    }
    prefix
}

/// Keep at most `max_chars` characters of `s` and append `marker` if
/// anything was cut. The marker is not counted against `max_chars`.
pub fn truncate_with_marker(s: &str, max_chars: usize, marker: &str) -> String {
    if char_len(s) <= max_chars {
        return s.to_string();
    }
    let mut out = prefix_chars(s, max_chars);
    out.push_str(marker);
    out
}

/// Split `s` into consecutive pieces of at most `size` chars.
pub fn chunk_chars(s: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_basic_ascii() {
        let s = "hello world";
        assert_eq!(preview(s, 5), "hello...");
        assert_eq!(preview(s, 20), "hello world");
    }

    #[test]
    fn preview_multibyte() {
        let s = "日本語のテキストです";
        assert_eq!(preview(s, 3), "日本語...");
        assert_eq!(char_len(s), 10);
    }

    #[test]
    fn truncate_with_marker_only_when_cut() {
        assert_eq!(truncate_with_marker("short", 10, "[cut]"), "short");
        assert_eq!(truncate_with_marker("abcdefgh", 3, "[cut]"), "abc[cut]");
        assert_eq!(truncate_with_marker("éééé", 2, "~"), "éé~");
    }

    #[test]
    fn chunk_chars_splits_evenly() {
        let chunks = chunk_chars("abcdefg", 3);
        assert_eq!(chunks, vec!["abc", "def", "g"]);
        assert!(chunk_chars("", 3).is_empty());
    }
}
