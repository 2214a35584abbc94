//! User input sanitization.

use once_cell::sync::Lazy;
use regex::Regex;

#[allow(clippy::expect_used)]
static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));

/// Remove HTML tags and control characters, then trim surrounding whitespace.
#[must_use]
pub fn sanitize_text(text: &str) -> String {
    let stripped = TAG_PATTERN.replace_all(text, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Length in characters, as shown to users.
#[must_use]
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}
