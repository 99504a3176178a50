//! Turning an inbound mail body into ticket comment text.

use kuchiki::traits::*;
use kuchiki::NodeRef;

pub const MAX_COMMENT_CHARS: usize = 4000;

/// Plain reply text from a message body, or `None` when nothing is left.
///
/// `content_type` is Graph's `body.contentType` (`html` or `text`); the
/// preview is used when the body is absent or empty.
pub fn extract_comment_text(
    content_type: Option<&str>,
    content: Option<&str>,
    preview: Option<&str>,
) -> Option<String> {
    let raw = match content.filter(|value| !value.trim().is_empty()) {
        Some(body) if is_html(content_type, body) => html_to_text(body),
        Some(body) => body.to_string(),
        None => preview.unwrap_or_default().to_string(),
    };

    let reply = strip_quoted_reply(&raw);
    let normalized = normalize_whitespace(&reply);
    let capped: String = normalized.chars().take(MAX_COMMENT_CHARS).collect();
    let capped = capped.trim_end().to_string();
    if capped.is_empty() {
        None
    } else {
        Some(capped)
    }
}

fn is_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(kind) => kind.eq_ignore_ascii_case("html"),
        None => body.contains("</") || body.contains("<br"),
    }
}

pub fn html_to_text(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    let mut out = String::new();
    collect_text(&document, &mut out);
    out
}

fn collect_text(node: &NodeRef, out: &mut String) {
    if let Some(text) = node.as_text() {
        out.push_str(&text.borrow());
        return;
    }
    if let Some(element) = node.as_element() {
        let tag = element.name.local.as_ref();
        if matches!(tag, "head" | "script" | "style" | "title") {
            return;
        }
        if tag == "br" {
            out.push('\n');
            return;
        }
        let block = is_block_tag(tag);
        if block {
            end_line(out);
        }
        for child in node.children() {
            collect_text(&child, out);
        }
        if block {
            end_line(out);
        }
        return;
    }
    for child in node.children() {
        collect_text(&child, out);
    }
}

fn end_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn is_block_tag(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "li"
            | "ul"
            | "ol"
            | "tr"
            | "table"
            | "blockquote"
            | "pre"
            | "hr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "section"
            | "article"
            | "header"
            | "footer"
    )
}

/// Cut the text at the first line that starts a quoted reply or signature.
pub fn strip_quoted_reply(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut kept = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let next = lines.get(index + 1).map(|value| value.trim());
        if starts_quote_block(line, next) {
            break;
        }
        kept.push(*line);
    }
    kept.join("\n")
}

fn starts_quote_block(line: &str, next: Option<&str>) -> bool {
    if line == "-- " || line.trim_end() == "--" {
        return true;
    }
    let trimmed = line.trim();
    if trimmed.starts_with('>') {
        return true;
    }
    if trimmed.starts_with("-----Original Message-----") {
        return true;
    }
    if trimmed.starts_with("On ")
        && (trimmed.contains("wrote:") || next.map(|n| n.contains("wrote:")).unwrap_or(false))
    {
        return true;
    }
    ["From:", "Sent:", "Subject:", "To:"]
        .iter()
        .any(|prefix| has_prefix_ignore_case(trimmed, prefix))
}

fn has_prefix_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

/// Collapse runs of spaces per line and runs of blank lines to one.
fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = false;
    for line in text.lines() {
        let collapsed = line
            .split(|c: char| c.is_whitespace())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if collapsed.is_empty() {
            if !blank_run && !lines.is_empty() {
                lines.push(String::new());
            }
            blank_run = true;
        } else {
            lines.push(collapsed);
            blank_run = false;
        }
    }
    while lines.last().map(|line| line.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}
