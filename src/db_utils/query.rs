use bson::oid::ObjectId;
use bson::{doc, Document};

use super::cursor::PageCursor;
use super::indexes::{self, IndexKey};
use super::models::{CountFilter, TimeRange};
use super::{CONVERSATIONS_COLLECTION_NAME, MESSAGES_COLLECTION_NAME};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub filter: Document,
    pub sort: Document,
    pub hint: Option<&'static str>,
    pub limit: Option<i64>,
}

fn sort_document(sort: &[(&str, IndexKey)]) -> Document {
    sort.iter()
        .map(|&(field, dir)| {
            let dir = if dir == IndexKey::Asc { 1 } else { -1 };
            (field.to_string(), bson::Bson::Int32(dir))
        })
        .collect()
}

fn plan(
    collection: &str,
    equality: &[&str],
    sort: &[(&str, IndexKey)],
    filter: Document,
    limit: Option<i64>,
) -> QueryPlan {
    let hint = indexes::covering_index(collection, equality, sort).map(|s| s.name);
    if hint.is_none() {
        log::warn!(target: "db_utils::query", "No index serves {:?} sorted by {:?} on {}", equality, sort, collection);
    }
    QueryPlan {
        filter,
        sort: sort_document(sort),
        hint,
        limit,
    }
}

fn overfetch(limit: u32) -> Option<i64> {
    Some(limit as i64 + 1)
}

fn range_document(range: &TimeRange) -> Option<Document> {
    let mut bounds = Document::new();
    if let Some(from) = range.from {
        bounds.insert("$gte", bson::DateTime::from_chrono(from));
    }
    if let Some(to) = range.to {
        bounds.insert("$lt", bson::DateTime::from_chrono(to));
    }
    if bounds.is_empty() {
        None
    } else {
        Some(bounds)
    }
}

/// Strictly-after condition for newest-first keyset pages on `(field, _id)`.
fn keyset(filter: &mut Document, field: &str, cursor: &PageCursor) {
    let ts = bson::DateTime::from_chrono(cursor.created_at);
    filter.insert(field, doc! { "$lte": ts });
    filter.insert(
        "$or",
        vec![
            doc! { field: { "$lt": ts } },
            doc! { field: ts, "_id": { "$lt": cursor.id } },
        ],
    );
}

pub fn conversation_history(
    conversation: ObjectId,
    cursor: Option<&PageCursor>,
    limit: u32,
) -> QueryPlan {
    let mut filter = doc! { "conversationId": conversation };
    if let Some(cursor) = cursor {
        filter.insert("_id", doc! { "$lt": cursor.id });
    }
    plan(
        MESSAGES_COLLECTION_NAME,
        &["conversationId"],
        &[("_id", IndexKey::Desc)],
        filter,
        overfetch(limit),
    )
}

pub fn conversation_range(conversation: ObjectId, range: &TimeRange, limit: u32) -> QueryPlan {
    let mut filter = doc! { "conversationId": conversation };
    if let Some(bounds) = range_document(range) {
        filter.insert("createdAt", bounds);
    }
    plan(
        MESSAGES_COLLECTION_NAME,
        &["conversationId"],
        &[("createdAt", IndexKey::Desc), ("_id", IndexKey::Desc)],
        filter,
        Some(limit as i64),
    )
}

pub fn author_history(author: i64, cursor: Option<&PageCursor>, limit: u32) -> QueryPlan {
    let mut filter = doc! { "authorId": author };
    if let Some(cursor) = cursor {
        keyset(&mut filter, "createdAt", cursor);
    }
    plan(
        MESSAGES_COLLECTION_NAME,
        &["authorId"],
        &[("createdAt", IndexKey::Desc), ("_id", IndexKey::Desc)],
        filter,
        overfetch(limit),
    )
}

pub fn user_conversations(user: i64, cursor: Option<&PageCursor>, limit: u32) -> QueryPlan {
    let mut filter = doc! { "participants.userId": user };
    if let Some(cursor) = cursor {
        keyset(&mut filter, "updatedAt", cursor);
    }
    plan(
        CONVERSATIONS_COLLECTION_NAME,
        &["participants.userId"],
        &[("updatedAt", IndexKey::Desc), ("_id", IndexKey::Desc)],
        filter,
        overfetch(limit),
    )
}

pub fn recent_conversations(cursor: Option<&PageCursor>, limit: u32) -> QueryPlan {
    let mut filter = Document::new();
    if let Some(cursor) = cursor {
        keyset(&mut filter, "updatedAt", cursor);
    }
    plan(
        CONVERSATIONS_COLLECTION_NAME,
        &[],
        &[("updatedAt", IndexKey::Desc), ("_id", IndexKey::Desc)],
        filter,
        overfetch(limit),
    )
}

/// `$text` queries pick the text index themselves and reject hints.
pub fn search(text: &str, conversation: Option<ObjectId>, limit: u32) -> QueryPlan {
    let mut filter = doc! { "$text": { "$search": text } };
    if let Some(conversation) = conversation {
        filter.insert("conversationId", conversation);
    }
    QueryPlan {
        filter,
        sort: doc! { "score": { "$meta": "textScore" }, "_id": -1 },
        hint: None,
        limit: Some(limit as i64),
    }
}

pub fn search_projection() -> Document {
    doc! { "score": { "$meta": "textScore" } }
}

pub fn count(filter: &CountFilter) -> QueryPlan {
    let mut doc = Document::new();
    let mut equality: &[&str] = &[];
    if let Some(conversation) = filter.conversation {
        doc.insert("conversationId", conversation);
        equality = &["conversationId"];
    }
    if let Some(bounds) = range_document(&filter.range) {
        doc.insert("createdAt", bounds);
    }
    let hint = if equality.is_empty() {
        None
    } else {
        indexes::covering_index(MESSAGES_COLLECTION_NAME, equality, &[]).map(|s| s.name)
    };
    QueryPlan {
        filter: doc,
        sort: Document::new(),
        hint,
        limit: None,
    }
}

/// Retention sweep. There is no index on `createdAt` alone; the sweep scans.
pub fn prune(before: chrono::DateTime<chrono::Utc>) -> Document {
    doc! { "createdAt": { "$lt": bson::DateTime::from_chrono(before) } }
}
