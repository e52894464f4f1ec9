//! Markdown to Telegram HTML conversion.
//!
//! Supports the subset droid actually emits: headings, bold, italic,
//! strikethrough, inline code, fenced code and bullets. Code is swapped out for
//! placeholders before the escape pass and restored (escaped once) at the end.

use regex::{Captures, Regex};
use std::sync::OnceLock;

const BLOCK_MARK: char = '\u{E000}';
const INLINE_MARK: char = '\u{E001}';

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static markdown pattern"))
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?s)```(\w*)\n(.*?)```")
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"`([^`\n]+)`")
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?m)^#{1,6}\s+(.+)$")
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?m)^[-*][ \t]+")
}

fn bold_star_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\*\*(.+?)\*\*")
}

fn bold_underscore_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"__(.+?)__")
}

fn strike_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"~~(.+?)~~")
}

fn italic_star_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\*([^*\n]+)\*")
}

// Underscore italics only at word edges, so snake_case survives.
fn italic_underscore_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\b_([^_\n]+)_\b")
}

/// Escape the characters Telegram's HTML parser treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn placeholder(mark: char, index: usize) -> String {
    format!("{mark}{index}{mark}")
}

/// Convert markdown to Telegram HTML.
pub fn markdown_to_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut blocks: Vec<String> = Vec::new();
    let text = fenced_re().replace_all(text, |caps: &Captures| {
        blocks.push(caps[2].to_string());
        placeholder(BLOCK_MARK, blocks.len() - 1)
    });

    let mut inline: Vec<String> = Vec::new();
    let text = inline_code_re().replace_all(&text, |caps: &Captures| {
        inline.push(caps[1].to_string());
        placeholder(INLINE_MARK, inline.len() - 1)
    });

    let text = escape_html(&text);
    let text = heading_re().replace_all(&text, "<b>${1}</b>");
    let text = bullet_re().replace_all(&text, "• ");
    let text = bold_star_re().replace_all(&text, "<b>${1}</b>");
    let text = bold_underscore_re().replace_all(&text, "<b>${1}</b>");
    let text = strike_re().replace_all(&text, "<s>${1}</s>");
    let text = italic_star_re().replace_all(&text, "<i>${1}</i>");
    let mut text = italic_underscore_re()
        .replace_all(&text, "<i>${1}</i>")
        .into_owned();

    for (i, code) in inline.iter().enumerate() {
        let html = format!("<code>{}</code>", escape_html(code));
        text = text.replace(&placeholder(INLINE_MARK, i), &html);
    }
    for (i, code) in blocks.iter().enumerate() {
        let html = format!("<pre>{}</pre>", escape_html(code.trim()));
        text = text.replace(&placeholder(BLOCK_MARK, i), &html);
    }

    text
}
