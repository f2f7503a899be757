use std::collections::{HashMap, HashSet};

use bson::oid::ObjectId;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{BulkWriteFailure, ErrorKind, WriteFailure};
use mongodb::options::{
    CountOptions, FindOneAndUpdateOptions, FindOptions, Hint, InsertManyOptions, ReturnDocument,
};
use mongodb::{Collection, Database};
use serde::de::DeserializeOwned;

use super::cursor::{Page, PageCursor};
use super::error::{Error, Result};
use super::models::{
    Conversation, CountFilter, InsertReport, Message, MessageUpdate, NewConversation, NewMessage,
    Participant, SearchHit, TimeRange,
};
use super::query::{self, QueryPlan};
use super::text::SearchTerms;
use super::{CONVERSATIONS_COLLECTION_NAME, MESSAGES_COLLECTION_NAME};

const DUPLICATE_KEY: i32 = 11000;

fn messages(db: &Database) -> Collection<Message> {
    db.collection::<Message>(MESSAGES_COLLECTION_NAME)
}

fn conversations(db: &Database) -> Collection<Conversation> {
    db.collection::<Conversation>(CONVERSATIONS_COLLECTION_NAME)
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    is_duplicate_kind(e.kind.as_ref())
}

fn is_duplicate_kind(kind: &ErrorKind) -> bool {
    match kind {
        ErrorKind::Write(WriteFailure::WriteError(w)) => w.code == DUPLICATE_KEY,
        ErrorKind::Command(c) => c.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Batch positions an unordered insert rejected, when every rejection is a
/// duplicate key. `None` for any other failure.
fn duplicate_positions(failure: &BulkWriteFailure) -> Option<HashSet<usize>> {
    if failure.write_concern_error.is_some() {
        return None;
    }
    let errors = failure.write_errors.as_deref().unwrap_or_default();
    if errors.iter().all(|w| w.code == DUPLICATE_KEY) {
        Some(errors.iter().map(|w| w.index).collect())
    } else {
        None
    }
}

fn bulk_duplicates(e: &mongodb::error::Error) -> Option<HashSet<usize>> {
    match e.kind.as_ref() {
        ErrorKind::BulkWrite(failure) => duplicate_positions(failure),
        _ => None,
    }
}

/// Counts of an insert attempt and, per conversation, the newest message
/// actually stored.
fn settle_batch(
    docs: &[Message],
    rejected: &HashSet<usize>,
) -> (InsertReport, HashMap<ObjectId, DateTime<Utc>>) {
    let mut report = InsertReport::default();
    let mut latest = HashMap::<ObjectId, DateTime<Utc>>::new();
    for (i, msg) in docs.iter().enumerate() {
        if rejected.contains(&i) {
            report.duplicates += 1;
            continue;
        }
        report.inserted += 1;
        let ts = latest.entry(msg.conversation_id).or_insert(msg.created_at);
        *ts = (*ts).max(msg.created_at);
    }
    (report, latest)
}

async fn find_planned<T>(col: Collection<T>, plan: QueryPlan) -> Result<Vec<T>>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    let mut options = FindOptions::builder().sort(plan.sort).build();
    options.limit = plan.limit;
    options.hint = plan.hint.map(|h| Hint::Name(h.to_string()));
    let rows = col
        .find(plan.filter, options)
        .await?
        .try_collect::<Vec<_>>()
        .await
        .map_err(|e| {
            log::error!(target: "db_utils::db::find_planned", "Can't read cursor: {}", &e);
            e
        })?;
    Ok(rows)
}

fn message_key(m: &Message) -> PageCursor {
    PageCursor::new(m.created_at, m.id)
}

fn conversation_key(c: &Conversation) -> PageCursor {
    PageCursor::new(c.updated_at, c.id)
}

pub async fn create_conversation(db: &Database, conv: NewConversation) -> Result<Conversation> {
    let conv = Conversation::from_new(conv);
    conversations(db).insert_one(&conv, None).await?;
    log::debug!("Conversation {} created", conv.id);
    Ok(conv)
}

pub async fn get_conversation(db: &Database, id: ObjectId) -> Result<Option<Conversation>> {
    Ok(conversations(db).find_one(doc! { "_id": id }, None).await?)
}

async fn require_conversation(db: &Database, id: ObjectId) -> Result<Conversation> {
    get_conversation(db, id)
        .await?
        .ok_or_else(|| Error::not_found("conversation", id))
}

pub async fn add_participant(db: &Database, id: ObjectId, user_id: i64) -> Result<Conversation> {
    let now = super::models::now();
    let participant = bson::to_bson(&Participant {
        user_id,
        joined_at: now,
    })?;
    conversations(db)
        .update_one(
            doc! { "_id": id, "participants.userId": { "$ne": user_id } },
            doc! {
                "$push": { "participants": participant },
                "$max": { "updatedAt": bson::DateTime::from_chrono(now) },
            },
            None,
        )
        .await?;
    require_conversation(db, id).await
}

pub async fn remove_participant(
    db: &Database,
    id: ObjectId,
    user_id: i64,
) -> Result<Conversation> {
    let now = bson::DateTime::from_chrono(super::models::now());
    conversations(db)
        .update_one(
            doc! { "_id": id, "participants.userId": user_id },
            doc! {
                "$pull": { "participants": { "userId": user_id } },
                "$max": { "updatedAt": now },
            },
            None,
        )
        .await?;
    require_conversation(db, id).await
}

pub async fn delete_conversation(db: &Database, id: ObjectId) -> Result<u64> {
    let deleted = conversations(db)
        .delete_one(doc! { "_id": id }, None)
        .await?
        .deleted_count;
    if deleted == 0 {
        return Err(Error::not_found("conversation", id));
    }
    let messages = messages(db)
        .delete_many(doc! { "conversationId": id }, None)
        .await?
        .deleted_count;
    log::info!("Conversation {} deleted with {} messages", id, messages);
    Ok(messages)
}

pub async fn user_conversations(
    db: &Database,
    user_id: i64,
    cursor: Option<PageCursor>,
    limit: u32,
) -> Result<Page<Conversation>> {
    let plan = query::user_conversations(user_id, cursor.as_ref(), limit);
    let rows = find_planned(conversations(db), plan).await?;
    Ok(Page::from_overfetch(rows, limit, conversation_key))
}

pub async fn recent_conversations(
    db: &Database,
    cursor: Option<PageCursor>,
    limit: u32,
) -> Result<Page<Conversation>> {
    let plan = query::recent_conversations(cursor.as_ref(), limit);
    let rows = find_planned(conversations(db), plan).await?;
    Ok(Page::from_overfetch(rows, limit, conversation_key))
}

fn check_author(conv: &Conversation, author_id: i64) -> Result<()> {
    if conv.has_participant(author_id) {
        Ok(())
    } else {
        Err(Error::NotParticipant {
            conversation: conv.id.to_hex().into(),
            user: author_id,
        })
    }
}

async fn find_by_client_id(db: &Database, message_id: &str) -> Result<Option<Message>> {
    Ok(messages(db)
        .find_one(doc! { "messageId": message_id }, None)
        .await?)
}

async fn touch_conversation(db: &Database, id: ObjectId, ts: DateTime<Utc>) -> Result<()> {
    conversations(db)
        .update_one(
            doc! { "_id": id },
            doc! { "$max": { "updatedAt": bson::DateTime::from_chrono(ts) } },
            None,
        )
        .await?;
    Ok(())
}

pub async fn insert_message(db: &Database, msg: NewMessage) -> Result<Message> {
    let conv = require_conversation(db, msg.conversation_id).await?;
    check_author(&conv, msg.author_id)?;

    if let Some(client_id) = msg.message_id.as_deref() {
        if let Some(existing) = find_by_client_id(db, client_id).await? {
            log::debug!("Message {} already stored as {}", client_id, existing.id);
            return Ok(existing);
        }
    }

    let msg = Message::from_new(msg);
    if let Err(e) = messages(db).insert_one(&msg, None).await {
        if let (true, Some(client_id)) = (is_duplicate_key(&e), msg.message_id.as_deref()) {
            if let Some(existing) = find_by_client_id(db, client_id).await? {
                return Ok(existing);
            }
        }
        log::error!(target: "db_utils::db::insert_message", "Can't insert message: {}", &e);
        return Err(e.into());
    }

    touch_conversation(db, msg.conversation_id, msg.created_at).await?;
    Ok(msg)
}

pub async fn insert_messages(db: &Database, batch: Vec<NewMessage>) -> Result<InsertReport> {
    let mut report = InsertReport::default();
    if batch.is_empty() {
        return Ok(report);
    }

    let ids = batch
        .iter()
        .map(|m| m.conversation_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let convs = conversations(db)
        .find(doc! { "_id": { "$in": ids } }, None)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .map(|c| (c.id, c))
        .collect::<HashMap<_, _>>();

    for msg in &batch {
        let conv = convs
            .get(&msg.conversation_id)
            .ok_or_else(|| Error::not_found("conversation", msg.conversation_id))?;
        check_author(conv, msg.author_id)?;
    }

    let mut seen = HashSet::new();
    let mut docs = Vec::with_capacity(batch.len());
    for msg in batch {
        if let Some(client_id) = &msg.message_id {
            if !seen.insert(client_id.clone()) {
                report.duplicates += 1;
                continue;
            }
        }
        docs.push(Message::from_new(msg));
    }
    if docs.is_empty() {
        return Ok(report);
    }

    let options = InsertManyOptions::builder().ordered(false).build();
    let rejected = match messages(db).insert_many(&docs, options).await {
        Ok(_) => HashSet::new(),
        Err(e) => match bulk_duplicates(&e) {
            Some(rejected) => rejected,
            None => {
                log::error!(target: "db_utils::db::insert_messages", "Can't insert batch: {}", &e);
                return Err(e.into());
            }
        },
    };

    let (stored, latest) = settle_batch(&docs, &rejected);
    report += stored;
    for (id, ts) in latest {
        touch_conversation(db, id, ts).await?;
    }
    Ok(report)
}

pub async fn get_message(db: &Database, id: ObjectId) -> Result<Option<Message>> {
    Ok(messages(db).find_one(doc! { "_id": id }, None).await?)
}

pub async fn update_message(db: &Database, id: ObjectId, update: MessageUpdate) -> Result<Message> {
    let content = bson::to_bson(&update.content)?;
    let options = FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build();
    messages(db)
        .find_one_and_update(
            doc! { "_id": id },
            doc! { "$set": {
                "content": content,
                "updatedAt": bson::DateTime::from_chrono(super::models::now()),
            } },
            options,
        )
        .await?
        .ok_or_else(|| Error::not_found("message", id))
}

pub async fn delete_message(db: &Database, id: ObjectId) -> Result<bool> {
    Ok(messages(db)
        .delete_one(doc! { "_id": id }, None)
        .await?
        .deleted_count
        > 0)
}

pub async fn conversation_messages(
    db: &Database,
    conversation: ObjectId,
    cursor: Option<PageCursor>,
    limit: u32,
) -> Result<Page<Message>> {
    let plan = query::conversation_history(conversation, cursor.as_ref(), limit);
    let rows = find_planned(messages(db), plan).await?;
    Ok(Page::from_overfetch(rows, limit, message_key))
}

pub async fn conversation_messages_between(
    db: &Database,
    conversation: ObjectId,
    range: TimeRange,
    limit: u32,
) -> Result<Vec<Message>> {
    let plan = query::conversation_range(conversation, &range, limit);
    find_planned(messages(db), plan).await
}

pub async fn author_messages(
    db: &Database,
    author_id: i64,
    cursor: Option<PageCursor>,
    limit: u32,
) -> Result<Page<Message>> {
    let plan = query::author_history(author_id, cursor.as_ref(), limit);
    let rows = find_planned(messages(db), plan).await?;
    Ok(Page::from_overfetch(rows, limit, message_key))
}

pub async fn search_messages(
    db: &Database,
    text: &str,
    conversation: Option<ObjectId>,
    limit: u32,
) -> Result<Vec<SearchHit>> {
    SearchTerms::parse(text)?;
    let plan = query::search(text, conversation, limit);
    let mut options = FindOptions::builder()
        .sort(plan.sort)
        .projection(query::search_projection())
        .build();
    options.limit = plan.limit;

    let docs = db
        .collection::<Document>(MESSAGES_COLLECTION_NAME)
        .find(plan.filter, options)
        .await?
        .try_collect::<Vec<_>>()
        .await?;

    let mut hits = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let score = doc.get_f64("score").unwrap_or_default();
        doc.remove("score");
        hits.push(SearchHit {
            message: bson::from_document(doc)?,
            score,
        });
    }
    Ok(hits)
}

pub async fn count_messages(db: &Database, filter: CountFilter) -> Result<u64> {
    let plan = query::count(&filter);
    let mut options = CountOptions::builder().build();
    options.hint = plan.hint.map(|h| Hint::Name(h.to_string()));
    Ok(messages(db).count_documents(plan.filter, options).await?)
}

pub async fn prune_messages(db: &Database, before: DateTime<Utc>) -> Result<u64> {
    let deleted = messages(db)
        .delete_many(query::prune(before), None)
        .await?
        .deleted_count;
    log::info!("Pruned {} messages created before {}", deleted, before);
    Ok(deleted)
}
