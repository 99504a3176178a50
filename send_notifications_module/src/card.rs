use serde::Serialize;
use serde_json::{json, Value};

pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CardAction {
    pub title: String,
    pub url: String,
}

/// Adaptive card posted to a chat or channel.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveCard {
    pub title: String,
    pub summary: String,
    pub facts: Vec<(String, String)>,
    pub action: Option<CardAction>,
}

impl AdaptiveCard {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_fact(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.push((name.into(), value.into()));
        self
    }

    pub fn with_action(mut self, title: impl Into<String>, url: impl Into<String>) -> Self {
        self.action = Some(CardAction {
            title: title.into(),
            url: url.into(),
        });
        self
    }

    /// The card document itself (schema 1.4).
    pub fn to_card_json(&self) -> Value {
        let mut body = vec![
            json!({
                "type": "TextBlock",
                "text": self.title,
                "weight": "Bolder",
                "size": "Medium",
                "wrap": true,
            }),
            json!({
                "type": "TextBlock",
                "text": self.summary,
                "wrap": true,
            }),
        ];
        let facts: Vec<Value> = self
            .facts
            .iter()
            .filter(|(name, value)| !name.trim().is_empty() && !value.trim().is_empty())
            .map(|(name, value)| json!({ "title": name, "value": value }))
            .collect();
        if !facts.is_empty() {
            body.push(json!({ "type": "FactSet", "facts": facts }));
        }

        let mut card = json!({
            "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
            "type": "AdaptiveCard",
            "version": "1.4",
            "body": body,
        });
        if let Some(action) = &self.action {
            card["actions"] = json!([{
                "type": "Action.OpenUrl",
                "title": action.title,
                "url": action.url,
            }]);
        }
        card
    }

    /// Body for `POST /chats/{id}/messages` or `/teams/{t}/channels/{c}/messages`.
    ///
    /// Graph expects the card serialized as a string inside the attachment and
    /// referenced from the HTML body by attachment id.
    pub fn to_chat_message_payload(&self, attachment_id: &str) -> Value {
        json!({
            "subject": self.title,
            "body": {
                "contentType": "html",
                "content": format!("<attachment id=\"{}\"></attachment>", attachment_id),
            },
            "attachments": [{
                "id": attachment_id,
                "contentType": ADAPTIVE_CARD_CONTENT_TYPE,
                "contentUrl": Value::Null,
                "content": self.to_card_json().to_string(),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_includes_facts_and_action() {
        let card = AdaptiveCard::new("Ticket ENG-000042 updated", "Status changed to Open")
            .with_fact("Priority", "High")
            .with_fact("Assignee", "")
            .with_action("Open ticket", "https://app.example.com/tickets/42");

        let json = card.to_card_json();
        assert_eq!(json["type"], "AdaptiveCard");
        let facts = json["body"][2]["facts"].as_array().expect("facts");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0]["title"], "Priority");
        assert_eq!(json["actions"][0]["url"], "https://app.example.com/tickets/42");
    }

    #[test]
    fn chat_payload_references_attachment() {
        let card = AdaptiveCard::new("Title", "Summary");
        let payload = card.to_chat_message_payload("att-1");
        assert_eq!(
            payload["body"]["content"],
            "<attachment id=\"att-1\"></attachment>"
        );
        assert_eq!(payload["attachments"][0]["contentType"], ADAPTIVE_CARD_CONTENT_TYPE);
        let inner: Value =
            serde_json::from_str(payload["attachments"][0]["content"].as_str().expect("string"))
                .expect("card json");
        assert_eq!(inner["body"][0]["text"], "Title");
        assert!(inner.get("actions").is_none());
    }
}
