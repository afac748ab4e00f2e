use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

pub const MIN_TOPIC_CHARS: usize = 3;
pub const MAX_TOPIC_CHARS: usize = 200;

/// Inbound generation request, as posted by the web app or the bot front-end.
/// Enumerated fields stay raw strings until `validate` so a bad value is a
/// `ValidationError` rather than a deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub main_topic: String,
    pub content_type: String,
    pub content_length: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub style_options: HashMap<String, bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "telegram_chat_id")]
    pub requester_chat_id: Option<i64>,
    #[serde(default, alias = "telegram_user_id")]
    pub requester_user_id: Option<i64>,
}

/// Front-ends send `null` for an untouched options panel.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Leaflet,
    Research,
    Summary,
    ActionPlan,
    SocialMediaContent,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Leaflet,
        ContentType::Research,
        ContentType::Summary,
        ContentType::ActionPlan,
        ContentType::SocialMediaContent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Leaflet => "leaflet",
            ContentType::Research => "research",
            ContentType::Summary => "summary",
            ContentType::ActionPlan => "action-plan",
            ContentType::SocialMediaContent => "social-media-content",
        }
    }

    /// Human wording used inside the prompt.
    pub fn label(self) -> &'static str {
        match self {
            ContentType::Leaflet => "a leaflet",
            ContentType::Research => "a research paper",
            ContentType::Summary => "a summary",
            ContentType::ActionPlan => "an action plan",
            ContentType::SocialMediaContent => "social media content",
        }
    }
}

impl FromStr for ContentType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::ContentType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ContentLength {
    VeryBrief,
    Brief,
    Medium,
    Detailed,
    Comprehensive,
}

impl ContentLength {
    pub const ALL: [ContentLength; 5] = [
        ContentLength::VeryBrief,
        ContentLength::Brief,
        ContentLength::Medium,
        ContentLength::Detailed,
        ContentLength::Comprehensive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentLength::VeryBrief => "very-brief",
            ContentLength::Brief => "brief",
            ContentLength::Medium => "medium",
            ContentLength::Detailed => "detailed",
            ContentLength::Comprehensive => "comprehensive",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ContentLength::VeryBrief => "very brief",
            ContentLength::Brief => "brief",
            ContentLength::Medium => "medium",
            ContentLength::Detailed => "detailed",
            ContentLength::Comprehensive => "comprehensive",
        }
    }
}

impl FromStr for ContentLength {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentLength::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| ValidationError::ContentLength(s.to_string()))
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Style switches. Declaration order is the canonical prompt order, and
/// `Ord` follows it, so a `BTreeSet<StyleFlag>` iterates canonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum StyleFlag {
    UseEmoji,
    SimpleLanguage,
    AcademicLanguage,
    BulletPoints,
    DiscussionQuestions,
}

impl StyleFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            StyleFlag::UseEmoji => "use-emoji",
            StyleFlag::SimpleLanguage => "simple-language",
            StyleFlag::AcademicLanguage => "academic-language",
            StyleFlag::BulletPoints => "bullet-points",
            StyleFlag::DiscussionQuestions => "discussion-questions",
        }
    }

    /// Accepts both the kebab-case keys and the camelCase keys the web app sends.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "use-emoji" | "useEmoji" => Some(StyleFlag::UseEmoji),
            "simple-language" | "simpleLanguage" => Some(StyleFlag::SimpleLanguage),
            "academic-language" | "academicLanguage" => Some(StyleFlag::AcademicLanguage),
            "bullet-points" | "bulletPoints" => Some(StyleFlag::BulletPoints),
            "discussion-questions" | "discussionQuestions" => Some(StyleFlag::DiscussionQuestions),
            _ => None,
        }
    }
}

/// A request that passed validation. Only this type flows past the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub topic: String,
    pub content_type: ContentType,
    pub length: ContentLength,
    pub styles: BTreeSet<StyleFlag>,
    pub custom_fields: Vec<(String, String)>,
    pub chat_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl ContentRequest {
    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        if self.main_topic.trim().is_empty() {
            return Err(ValidationError::BlankTopic);
        }
        let len = self.main_topic.chars().count();
        if !(MIN_TOPIC_CHARS..=MAX_TOPIC_CHARS).contains(&len) {
            return Err(ValidationError::TopicLength {
                len,
                min: MIN_TOPIC_CHARS,
                max: MAX_TOPIC_CHARS,
            });
        }

        let content_type: ContentType = self.content_type.parse()?;
        let length: ContentLength = self.content_length.parse()?;

        let styles = self
            .style_options
            .iter()
            .filter(|(_, enabled)| **enabled)
            .filter_map(|(key, _)| StyleFlag::from_key(key))
            .collect();

        let custom_fields = self
            .custom_fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect();

        Ok(ValidatedRequest {
            topic: self.main_topic.clone(),
            content_type,
            length,
            styles,
            custom_fields,
            chat_id: self.requester_chat_id,
            user_id: self.requester_user_id,
        })
    }
}

/// Rendering mode. Only very-brief requests are served on the free tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Paid,
}

impl Tier {
    pub fn for_length(length: ContentLength) -> Self {
        if length == ContentLength::VeryBrief {
            Tier::Free
        } else {
            Tier::Paid
        }
    }
}

/// Where the generated text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Generated,
    CacheHit,
}

/// Successful end state of a pipeline run.
#[derive(Debug)]
pub enum Outcome {
    /// Document sent to the requester's chat.
    Delivered { source: ContentSource },
    /// No chat to deliver to; the caller gets the PDF.
    Document { pdf: Vec<u8>, source: ContentSource },
    /// Quota exhausted; one invoice was sent and nothing was generated.
    PaymentRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    PaymentRequired,
    Rejected,
    Error,
}

/// JSON body returned by `/generate-content`.
#[derive(Debug, Serialize)]
pub struct DeliveryOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_sent: Option<bool>,
}

/// Snapshot of a user's rolling-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    pub user_id: i64,
    pub count: u64,
    pub reset_at: Option<DateTime<Utc>>,
}
