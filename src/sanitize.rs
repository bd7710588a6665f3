//! Chat message sanitization.
//!
//! Strips markup, decodes the fixed entity set, caps length, trims.
//! Callers treat an empty result as invalid input.

/// Maximum chat message length after tag stripping.
pub const MAX_MESSAGE_LEN: usize = 200;

/// Sanitize user-supplied chat text before relay.
///
/// Order matters: tags are stripped first so `<b>&amp;</b>` decodes the
/// entity, and `&amp;` decodes last so `&amp;lt;` cannot double-decode
/// into a live angle bracket.
#[must_use]
pub fn sanitize(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    let decoded = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");

    let truncated: String = decoded.chars().take(MAX_MESSAGE_LEN).collect();
    truncated.trim().to_string()
}
