
use std::sync::LazyLock;

use fancy_regex::Regex;
use pulldown_cmark::{Options, Parser, html};
use scraper::{ElementRef, Html};
use tracing::debug;

const UTF8_BOM: char = '\u{feff}';

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid regex"));

/// Decode bytes as UTF-8, falling back to Latin-1 so decoding never fails
#[inline]
pub fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix(UTF8_BOM).unwrap_or(text).to_string(),
        Err(e) => {
            debug!(
                "Input is not valid UTF-8 ({}), decoding as Latin-1",
                e
            );
            bytes.iter().copied().map(char::from).collect()
        }
    }
}

/// Render Markdown and strip every tag, leaving prose only
#[inline]
pub fn markdown_to_text(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut rendered = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut rendered, Parser::new_ext(markdown, options));

    let fragment = Html::parse_fragment(&rendered);
    let mut content = String::new();
    collect_text(fragment.root_element(), &mut content);

    EXCESS_NEWLINES
        .replace_all(&content, "\n\n")
        .trim()
        .to_string()
}

fn collect_text(element: ElementRef, content: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            match child_element.value().name() {
                "br" => content.push('\n'),
                "td" | "th" => {
                    collect_text(child_element, content);
                    content.push(' ');
                }
                "p" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" | "pre" | "blockquote"
                | "tr" | "table" | "ul" | "ol" | "hr" => {
                    collect_text(child_element, content);
                    content.push('\n');
                }
                _ => collect_text(child_element, content),
            }
        } else if let Some(text_node) = child.value().as_text() {
            content.push_str(text_node);
        }
    }
}
