use std::sync::LazyLock;

use regex::Regex;

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>")
        .unwrap_or_else(|err| panic!("invalid script regex: {err}"))
});

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<[^>]*>").unwrap_or_else(|err| panic!("invalid tag regex: {err}"))
});

/// Visible text of an HTML page. Tags become spaces; common entities are decoded.
pub fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, " ");
    let without_tags = TAG.replace_all(&without_code, " ");

    without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
