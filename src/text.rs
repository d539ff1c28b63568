/// Collapse runs of whitespace (including newlines) into single spaces and trim.
pub fn normalize_line(s: &str) -> String {
    let mut out = String::new();
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// First `max_chars` characters of `s`, never splitting a code point.
pub fn excerpt(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Prefix used when looking for a stored subject inside a rendered row.
pub fn match_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_line("  Hello \n\t world  "), "Hello world");
        assert_eq!(normalize_line("   "), "");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("abc", 10), "abc");
    }

    #[test]
    fn match_prefix_cuts_long_subjects() {
        let long = "x".repeat(80);
        assert_eq!(match_prefix(&long, 50).len(), 50);
        assert_eq!(match_prefix("Hello", 50), "Hello");
        assert_eq!(match_prefix("ééé", 2), "éé");
    }
}
