//! Matching inbound mail back to a local ticket.

use std::sync::OnceLock;

use regex::Regex;

/// Ticket reference found in an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketRef {
    /// Human-facing code such as `ENG-000042`.
    Code(String),
    /// Internal ticket id.
    Id(String),
}

/// Fields of an inbound message that can carry a ticket reference.
#[derive(Debug, Clone, Default)]
pub struct CorrelationInput<'a> {
    pub subject: Option<&'a str>,
    /// Value of the `X-Ticket-Id` header set on outbound mail.
    pub ticket_id_header: Option<&'a str>,
    pub thread_key_header: Option<&'a str>,
    pub references: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    pub conversation_id: Option<&'a str>,
}

enum Capture {
    Code,
    Id,
}

struct Pattern {
    regex: Regex,
    capture: Capture,
}

fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\[([A-Z]{3}-\d{6})\]", Capture::Code),
            (r"(?i)\[(?:ticket|tkt)[#:\s-]*([A-Za-z0-9-]{4,64})\]", Capture::Id),
            (r"(?i)\bx?-?ticket-id[:=]\s*([A-Za-z0-9-]{4,64})", Capture::Id),
            (r"(?i)ticket-thread-([A-Za-z0-9-]{4,64})", Capture::Id),
            (r"(?i)[?&#]ticket(?:Id)?=([A-Za-z0-9-]{4,64})", Capture::Id),
            (r"(?i)\bticket[_-]([A-Za-z0-9]{4,64})\b", Capture::Id),
        ]
        .into_iter()
        .filter_map(|(source, capture)| {
            Regex::new(source).ok().map(|regex| Pattern { regex, capture })
        })
        .collect()
    })
}

/// Find the ticket a message belongs to.
///
/// An explicit ticket id header wins outright. Otherwise the subject,
/// threading headers, conversation id and thread key are searched together,
/// trying the bracketed ticket code first and looser legacy forms after.
pub fn extract_ticket_ref(input: &CorrelationInput<'_>) -> Option<TicketRef> {
    if let Some(id) = input
        .ticket_id_header
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(TicketRef::Id(id.to_string()));
    }

    let haystack = [
        input.subject,
        input.references,
        input.in_reply_to,
        input.conversation_id,
        input.thread_key_header,
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|value| !value.is_empty())
    .collect::<Vec<_>>()
    .join("\n");
    if haystack.is_empty() {
        return None;
    }

    patterns().iter().find_map(|pattern| {
        let value = pattern.regex.captures(&haystack)?.get(1)?.as_str().to_string();
        Some(match pattern.capture {
            Capture::Code => TicketRef::Code(value),
            Capture::Id => TicketRef::Id(value),
        })
    })
}
