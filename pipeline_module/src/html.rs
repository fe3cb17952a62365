//! Plain-text extraction from HTML message bodies.

use std::sync::LazyLock;

use regex::Regex;

// Comments go first: a comment may contain tags, and a comment with an
// embedded `>` would otherwise leave fragments behind.
static COMMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Removes HTML comments and tags, leaving the text content.
pub fn strip_html(html: &str) -> String {
    let without_comments = COMMENT_PATTERN.replace_all(html, "");
    TAG_PATTERN
        .replace_all(&without_comments, "")
        .trim()
        .to_string()
}
