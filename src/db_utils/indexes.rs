use bson::{Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use serde::Serialize;

use super::{CONVERSATIONS_COLLECTION_NAME, MESSAGES_COLLECTION_NAME};

pub const MESSAGES_BY_CONVERSATION_TIME: &str = "conversationId_1_createdAt_-1";
pub const MESSAGES_BY_CONVERSATION_ID: &str = "conversationId_1__id_-1";
pub const MESSAGES_BY_CLIENT_ID: &str = "messageId_1";
pub const MESSAGES_BY_AUTHOR_TIME: &str = "authorId_1_createdAt_-1";
pub const MESSAGES_TEXT: &str = "content.text_text";
pub const CONVERSATIONS_BY_PARTICIPANT: &str = "participants.userId_1_updatedAt_-1";
pub const CONVERSATIONS_BY_UPDATE: &str = "updatedAt_-1";

#[derive(Serialize, strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IndexKey {
    Asc,
    Desc,
    Text,
}

impl IndexKey {
    fn to_bson(self) -> Bson {
        match self {
            IndexKey::Asc => Bson::Int32(1),
            IndexKey::Desc => Bson::Int32(-1),
            IndexKey::Text => Bson::String("text".to_string()),
        }
    }

    fn reversed(self) -> Self {
        match self {
            IndexKey::Asc => IndexKey::Desc,
            IndexKey::Desc => IndexKey::Asc,
            IndexKey::Text => IndexKey::Text,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub name: &'static str,
    pub keys: &'static [(&'static str, IndexKey)],
    pub unique: bool,
    pub sparse: bool,
}

impl IndexSpec {
    const fn new(
        collection: &'static str,
        name: &'static str,
        keys: &'static [(&'static str, IndexKey)],
    ) -> Self {
        Self {
            collection,
            name,
            keys,
            unique: false,
            sparse: false,
        }
    }

    const fn unique_sparse(mut self) -> Self {
        self.unique = true;
        self.sparse = true;
        self
    }

    pub fn keys_document(&self) -> Document {
        self.keys
            .iter()
            .map(|&(field, key)| (field.to_string(), key.to_bson()))
            .collect()
    }

    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|&(_, key)| key == IndexKey::Text)
    }

    pub fn to_model(&self) -> IndexModel {
        IndexModel::builder()
            .keys(self.keys_document())
            .options(
                IndexOptions::builder()
                    .name(self.name.to_string())
                    .unique(self.unique)
                    .sparse(self.sparse)
                    .build(),
            )
            .build()
    }
}

const CATALOGUE: &[IndexSpec] = &[
    IndexSpec::new(
        MESSAGES_COLLECTION_NAME,
        MESSAGES_BY_CONVERSATION_TIME,
        &[("conversationId", IndexKey::Asc), ("createdAt", IndexKey::Desc)],
    ),
    IndexSpec::new(
        MESSAGES_COLLECTION_NAME,
        MESSAGES_BY_CONVERSATION_ID,
        &[("conversationId", IndexKey::Asc), ("_id", IndexKey::Desc)],
    ),
    IndexSpec::new(
        MESSAGES_COLLECTION_NAME,
        MESSAGES_BY_CLIENT_ID,
        &[("messageId", IndexKey::Asc)],
    )
    .unique_sparse(),
    IndexSpec::new(
        MESSAGES_COLLECTION_NAME,
        MESSAGES_BY_AUTHOR_TIME,
        &[("authorId", IndexKey::Asc), ("createdAt", IndexKey::Desc)],
    ),
    IndexSpec::new(
        MESSAGES_COLLECTION_NAME,
        MESSAGES_TEXT,
        &[("content.text", IndexKey::Text)],
    ),
    IndexSpec::new(
        CONVERSATIONS_COLLECTION_NAME,
        CONVERSATIONS_BY_PARTICIPANT,
        &[
            ("participants.userId", IndexKey::Asc),
            ("updatedAt", IndexKey::Desc),
        ],
    ),
    IndexSpec::new(
        CONVERSATIONS_COLLECTION_NAME,
        CONVERSATIONS_BY_UPDATE,
        &[("updatedAt", IndexKey::Desc)],
    ),
];

pub fn catalogue() -> &'static [IndexSpec] {
    CATALOGUE
}

pub fn for_collection(collection: &str) -> impl Iterator<Item = &'static IndexSpec> + '_ {
    CATALOGUE.iter().filter(move |s| s.collection == collection)
}

pub fn text_index(collection: &str) -> Option<&'static IndexSpec> {
    for_collection(collection).find(|s| s.is_text())
}

/// Finds the index serving equality matches on `equality` (in order) followed
/// by `sort`. Sort directions must all agree with the index or all be reversed.
/// A trailing `_id` tiebreaker may sit past the end of the index keys; the
/// server sorts ties on it.
pub fn covering_index(
    collection: &str,
    equality: &[&str],
    sort: &[(&str, IndexKey)],
) -> Option<&'static IndexSpec> {
    for_collection(collection)
        .filter(|s| !s.is_text())
        .find(|spec| serves(spec, equality, sort))
}

fn serves(spec: &IndexSpec, equality: &[&str], sort: &[(&str, IndexKey)]) -> bool {
    let keys = spec.keys;
    if keys.len() < equality.len() || (equality.is_empty() && sort.is_empty()) {
        return false;
    }
    if !keys.iter().zip(equality).all(|(&(field, _), eq)| field == *eq) {
        return false;
    }

    let rest = &keys[equality.len()..];
    let mut reversed = None;
    let mut matched = 0;
    for (i, &(field, dir)) in sort.iter().enumerate() {
        match rest.get(i) {
            Some(&(key_field, key_dir)) => {
                if key_field != field {
                    return false;
                }
                let this = if key_dir == dir {
                    false
                } else if key_dir.reversed() == dir {
                    true
                } else {
                    return false;
                };
                if *reversed.get_or_insert(this) != this {
                    return false;
                }
                matched += 1;
            }
            None => {
                let last = i + 1 == sort.len();
                if !(field == "_id" && last && matched > 0) {
                    return false;
                }
            }
        }
    }
    true
}
