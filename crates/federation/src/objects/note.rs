//! `ActivityPub` Note and Question objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ApImage, ObjectRef, OneOrMany, deserialize_urls};

/// `ActivityPub` post object (Note, Question, Article, Page, ...).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApNote {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Url,
    pub attributed_to: ObjectRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "deserialize_urls", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Url>,

    #[serde(default, deserialize_with = "deserialize_urls", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default)]
    pub sensitive: bool,

    #[serde(default)]
    pub tag: OneOrMany<ApTag>,

    #[serde(default)]
    pub attachment: OneOrMany<ApAttachment>,

    // Question fields
    /// Single choice poll options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<ApPollOption>>,

    /// Multiple choice poll options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<ApPollOption>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<DateTime<Utc>>,

    // FEP-e232 / Misskey quote extensions
    #[serde(default, rename = "quoteUrl", skip_serializing_if = "Option::is_none")]
    pub quote_url: Option<Url>,

    #[serde(default, rename = "_misskey_quote", skip_serializing_if = "Option::is_none")]
    pub misskey_quote: Option<Url>,

    #[serde(default, rename = "_misskey_content", skip_serializing_if = "Option::is_none")]
    pub misskey_content: Option<String>,
}

/// Poll option of a Question.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApPollOption {
    #[serde(rename = "type", default = "default_option_type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<ApPollReplies>,
}

/// Vote count of a poll option.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApPollReplies {
    #[serde(default)]
    pub total_items: u64,
}

fn default_option_type() -> String {
    "Note".to_string()
}

/// Mention, hashtag or custom emoji tag.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApTag {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<ApImage>,
}

/// File attachment.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

impl ApNote {
    /// Whether this object carries a poll.
    #[must_use]
    pub fn is_question(&self) -> bool {
        self.kind == "Question" || self.one_of.is_some() || self.any_of.is_some()
    }

    /// Poll choices with their vote counts, and whether multiple answers are allowed.
    #[must_use]
    pub fn poll_choices(&self) -> Option<(Vec<(String, u64)>, bool)> {
        let (options, multiple) = match (&self.one_of, &self.any_of) {
            (Some(options), _) => (options, false),
            (None, Some(options)) => (options, true),
            (None, None) => return None,
        };

        let choices = options
            .iter()
            .map(|o| (o.name.clone(), o.replies.as_ref().map_or(0, |r| r.total_items)))
            .collect();
        Some((choices, multiple))
    }

    /// `href`s of Mention tags.
    #[must_use]
    pub fn mention_uris(&self) -> Vec<Url> {
        self.tag
            .iter()
            .filter(|tag| tag.kind == "Mention")
            .filter_map(|tag| tag.href.clone())
            .collect()
    }

    /// Hashtag names without the leading `#`, lowercased.
    #[must_use]
    pub fn hashtags(&self) -> Vec<String> {
        self.tag
            .iter()
            .filter(|tag| tag.kind == "Hashtag")
            .filter_map(|tag| tag.name.as_deref())
            .map(|name| name.trim_start_matches('#').to_lowercase())
            .collect()
    }

    /// Custom emoji shortcodes without colons.
    #[must_use]
    pub fn emoji_names(&self) -> Vec<String> {
        self.tag
            .iter()
            .filter(|tag| tag.kind == "Emoji" && tag.icon.is_some())
            .filter_map(|tag| tag.name.as_deref())
            .map(|name| name.trim_matches(':').to_string())
            .collect()
    }

    /// Quote target, preferring the Misskey extension.
    #[must_use]
    pub fn quote(&self) -> Option<&Url> {
        self.misskey_quote.as_ref().or(self.quote_url.as_ref())
    }

    /// Plain text of the post: Misskey's source text when present, else stripped HTML.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        if let Some(source) = &self.misskey_content {
            return Some(source.clone());
        }
        self.content.as_deref().map(strip_html_basic)
    }
}

/// Basic HTML stripping for converting post content to plain text.
#[must_use]
pub fn strip_html_basic(html: &str) -> String {
    let html = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</p><p>", "\n\n")
        .replace("</p>", "\n")
        .replace("<p>", "");

    let mut result = String::new();
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    result
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_misskey_note() {
        let note: ApNote = serde_json::from_value(json!({
            "type": "Note",
            "id": "https://remote.example/notes/9a",
            "attributedTo": "https://remote.example/users/alice",
            "content": "<p>hello <a href=\"https://remote.example/tags/rust\">#Rust</a></p>",
            "_misskey_content": "hello #Rust",
            "to": "https://www.w3.org/ns/activitystreams#Public",
            "tag": [
                {"type": "Hashtag", "name": "#Rust"},
                {"type": "Mention", "href": "https://local.example/users/1", "name": "@bob"},
                {"type": "Emoji", "name": ":blob:", "icon": {"url": "https://remote.example/e.png"}}
            ]
        }))
        .unwrap();

        assert_eq!(note.text().as_deref(), Some("hello #Rust"));
        assert_eq!(note.hashtags(), vec!["rust"]);
        assert_eq!(note.mention_uris().len(), 1);
        assert_eq!(note.emoji_names(), vec!["blob"]);
        assert_eq!(note.to.len(), 1);
        assert!(!note.is_question());
    }

    #[test]
    fn test_poll_choices() {
        let note: ApNote = serde_json::from_value(json!({
            "type": "Question",
            "id": "https://remote.example/notes/q",
            "attributedTo": "https://remote.example/users/alice",
            "anyOf": [
                {"name": "a", "replies": {"type": "Collection", "totalItems": 3}},
                {"name": "b"}
            ]
        }))
        .unwrap();

        let (choices, multiple) = note.poll_choices().unwrap();
        assert!(multiple);
        assert_eq!(choices, vec![("a".to_string(), 3), ("b".to_string(), 0)]);
    }

    #[test]
    fn test_strip_html_basic() {
        assert_eq!(strip_html_basic("<p>Hello</p>"), "Hello");
        assert_eq!(strip_html_basic("a &amp;lt; b"), "a &lt; b");
        assert_eq!(strip_html_basic("line1<br>line2"), "line1\nline2");
    }
}
