//! Small text helpers shared by compaction, events and the CLI.

/// Truncate to at most `max_bytes`, respecting UTF-8 boundaries.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    &s[..cutoff]
}

/// Truncate and append an ellipsis marker when anything was cut.
pub fn snippet(s: &str, max_bytes: usize) -> String {
    let cut = truncate_utf8(s, max_bytes);
    if cut.len() < s.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}
