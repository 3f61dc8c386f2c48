//! Markup stripping for poll descriptions before they go to the completion backend.

use scraper::{Html, Node};

/// Character budget for the description part of a synthesis prompt.
pub const DESCRIPTION_BUDGET: usize = 3000;

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table", "blockquote", "section",
];

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "template"];

/// Strip markup, collapse whitespace inside paragraphs, keep paragraph breaks
/// and cut to `budget` characters on a word boundary.
///
/// Entities are decoded by the HTML parser, so truncation never splits one.
pub fn clean_description(raw: &str, budget: usize) -> String {
    let fragment = Html::parse_fragment(raw);
    let mut flat = String::with_capacity(raw.len());

    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Text(text) => {
                let skipped = node
                    .parent()
                    .and_then(|p| p.value().as_element())
                    .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()));
                if !skipped {
                    // source line breaks are layout, not paragraphs
                    flat.extend(text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
                }
            }
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => flat.push('\n'),
            _ => {}
        }
    }

    let paragraphs: Vec<String> = flat
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();

    truncate_on_boundary(&paragraphs.join("\n\n"), budget)
}

/// Cut `text` to at most `budget` characters, preferring the last whitespace
/// in the kept part so words stay whole.
pub fn truncate_on_boundary(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let cut = text.char_indices().nth(budget).map(|(idx, _)| idx).unwrap_or(text.len());
    let head = &text[..cut];
    let boundary = head
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(idx, _)| idx)
        .filter(|idx| *idx >= cut / 2)
        .unwrap_or(cut);
    head[..boundary].trim_end().to_string()
}
