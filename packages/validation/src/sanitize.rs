//! Free-text sanitization for record fields that end up in the UI.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length (in characters) of a sanitized string.
pub const MAX_TEXT_LEN: usize = 500;

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap_or_else(|_| unreachable!())
});

static STYLE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").unwrap_or_else(|_| unreachable!())
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap_or_else(|_| unreachable!()));

/// Strips markup and unsafe characters from a string.
///
/// Script and style blocks are removed along with their content, any other
/// tag is removed, the characters `< > & " '` are dropped, and the result
/// is trimmed and truncated to [`MAX_TEXT_LEN`] characters.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let without_blocks = SCRIPT_BLOCK.replace_all(input, "");
    let without_blocks = STYLE_BLOCK.replace_all(&without_blocks, "");
    let without_tags = TAG.replace_all(&without_blocks, "");

    without_tags
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '&' | '"' | '\''))
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_TEXT_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_tags_and_content() {
        assert_eq!(sanitize("<script>x</script>hello"), "hello");
    }

    #[test]
    fn strips_plain_tags_but_keeps_text() {
        assert_eq!(sanitize("<i>Ursus</i> arctos"), "Ursus arctos");
    }

    #[test]
    fn strips_unsafe_characters() {
        assert_eq!(sanitize(r#"Bob's "field" & co > 1"#), "Bobs field  co  1");
    }

    #[test]
    fn strips_unclosed_bracket() {
        assert_eq!(sanitize("a < b"), "a  b");
    }

    #[test]
    fn trims_and_truncates() {
        let long = format!("  {}  ", "é".repeat(MAX_TEXT_LEN + 20));
        let out = sanitize(&long);
        assert_eq!(out.chars().count(), MAX_TEXT_LEN);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn strips_multiline_style_block() {
        assert_eq!(sanitize("<style>\nbody { color: red }\n</style>Meadow"), "Meadow");
    }
}
