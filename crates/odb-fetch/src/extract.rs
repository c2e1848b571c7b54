//! Markup to plain text.

use scraper::{Html, Node};

/// Appended when extracted text is cut to fit the prompt budget.
pub const TRUNCATED_SUFFIX: &str = " ...(truncated)";

/// Elements whose text never renders.
const HIDDEN: &[&str] = &["script", "style", "noscript", "template"];

/// Visible text nodes in document order, each trimmed, joined with single spaces.
pub fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();

    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| match a.value() {
            Node::Element(e) => HIDDEN.contains(&e.name()),
            _ => false,
        });
        if hidden {
            continue;
        }
        let t = text.trim();
        if !t.is_empty() {
            parts.push(t);
        }
    }

    parts.join(" ")
}

/// Cut to at most `max_len` characters, suffix included.
pub fn truncate_chars(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let suffix_len = TRUNCATED_SUFFIX.chars().count();
    if max_len <= suffix_len {
        return text.chars().take(max_len).collect();
    }
    let mut out: String = text.chars().take(max_len - suffix_len).collect();
    out.push_str(TRUNCATED_SUFFIX);
    out
}
