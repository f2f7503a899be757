use bson::oid::ObjectId;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::error::Error;

/// Current time truncated to the millisecond precision BSON dates keep.
pub fn now() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

/// Parses a 24-character hex object id as sent by clients.
pub fn parse_object_id(hex: &str) -> super::error::Result<ObjectId> {
    ObjectId::parse_str(hex.trim()).map_err(|_| Error::InvalidId(hex.into()))
}

mod optional_datetime {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => bson::DateTime::from_chrono(*ts).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(Option::<bson::DateTime>::deserialize(deserializer)?.map(|ts| ts.to_chrono()))
    }
}

#[derive(
    Deserialize,
    Serialize,
    strum::AsRefStr,
    strum::Display,
    strum::EnumString,
    PartialEq,
    Eq,
    Debug,
    Clone,
    Copy,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AttachmentType {
    Image,
    Video,
    File,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub size: i64,
    #[serde(default)]
    pub metadata: bson::Document,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "TEXT".to_string(),
            text: Some(text.into()),
            attachments: vec![],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub conversation_id: ObjectId,
    pub author_id: i64,
    pub content: MessageContent,
    /// Producer-side idempotency key. Omitted rather than null so the sparse
    /// unique index ignores messages without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_datetime"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub(crate) fn from_new(msg: NewMessage) -> Self {
        Self {
            id: ObjectId::new(),
            conversation_id: msg.conversation_id,
            author_id: msg.author_id,
            content: msg.content,
            message_id: msg.message_id,
            created_at: msg.created_at.map(truncate_millis).unwrap_or_else(now),
            updated_at: None,
        }
    }

    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ObjectId,
    pub author_id: i64,
    pub content: MessageContent,
    pub message_id: Option<String>,
    /// Creation time assigned upstream (e.g. by a write-behind cache).
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn text(conversation_id: ObjectId, author_id: i64, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            author_id,
            content: MessageContent::text(text),
            message_id: None,
            created_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageUpdate {
    pub content: MessageContent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: i64,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub joined_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub title: String,
    pub participants: Vec<Participant>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn from_new(conv: NewConversation) -> Self {
        let ts = now();
        let mut participants: Vec<Participant> = Vec::with_capacity(conv.participants.len());
        for user_id in conv.participants {
            if !participants.iter().any(|p| p.user_id == user_id) {
                participants.push(Participant {
                    user_id,
                    joined_at: ts,
                });
            }
        }
        Self {
            id: ObjectId::new(),
            title: conv.title,
            participants,
            created_at: ts,
            updated_at: ts,
        }
    }

    pub fn has_participant(&self, user_id: i64) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewConversation {
    pub title: String,
    pub participants: Vec<i64>,
}

/// Half-open interval `[from, to)`; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn until(to: DateTime<Utc>) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts < to)
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub conversation: Option<ObjectId>,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message: Message,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CountFilter {
    pub conversation: Option<ObjectId>,
    pub range: TimeRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_more::Add, derive_more::AddAssign)]
pub struct InsertReport {
    pub inserted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStat {
    pub today: u64,
    pub yesterday: u64,
    pub before_yesterday: u64,
    pub week: u64,
    pub month: u64,
    pub earlier: u64,
}
