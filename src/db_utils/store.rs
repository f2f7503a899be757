use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use mongodb::{Client, Database};

use super::cursor::{Page, PageLimits, PageRequest};
use super::db;
use super::error::Result;
use super::models::{
    Conversation, CountFilter, InsertReport, Message, MessageUpdate, NewConversation, NewMessage,
    SearchHit, SearchQuery, TimeRange,
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    fn limits(&self) -> PageLimits;

    async fn create_conversation(&self, conv: NewConversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: ObjectId) -> Result<Option<Conversation>>;

    /// Adds `user_id` unless already present.
    async fn add_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation>;

    async fn remove_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation>;

    /// Deletes the conversation and its messages; returns the number of messages removed.
    async fn delete_conversation(&self, id: ObjectId) -> Result<u64>;

    /// Conversations `user_id` takes part in, most recently active first.
    async fn user_conversations(&self, user_id: i64, page: PageRequest)
        -> Result<Page<Conversation>>;

    async fn recent_conversations(&self, page: PageRequest) -> Result<Page<Conversation>>;

    /// Stores a message. A repeated `message_id` yields the stored message.
    async fn insert_message(&self, msg: NewMessage) -> Result<Message>;

    /// Batch ingest. Every message is validated before anything is written;
    /// repeated `message_id`s are counted as duplicates.
    async fn insert_messages(&self, batch: Vec<NewMessage>) -> Result<InsertReport>;

    async fn get_message(&self, id: ObjectId) -> Result<Option<Message>>;

    async fn update_message(&self, id: ObjectId, update: MessageUpdate) -> Result<Message>;

    async fn delete_message(&self, id: ObjectId) -> Result<bool>;

    /// Conversation history, newest first.
    async fn conversation_messages(
        &self,
        conversation: ObjectId,
        page: PageRequest,
    ) -> Result<Page<Message>>;

    async fn conversation_messages_between(
        &self,
        conversation: ObjectId,
        range: TimeRange,
        limit: u32,
    ) -> Result<Vec<Message>>;

    async fn author_messages(&self, author_id: i64, page: PageRequest) -> Result<Page<Message>>;

    async fn search_messages(&self, query: SearchQuery) -> Result<Vec<SearchHit>>;

    async fn count_messages(&self, filter: CountFilter) -> Result<u64>;

    /// Deletes messages created strictly before `before`.
    async fn prune_messages(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone)]
pub struct MongoStore {
    client: Arc<Client>,
    db_name: String,
    limits: PageLimits,
}

impl MongoStore {
    pub fn new(client: Arc<Client>, db_name: impl Into<String>, limits: PageLimits) -> Self {
        Self {
            client,
            db_name: db_name.into(),
            limits,
        }
    }

    pub fn database(&self) -> Database {
        self.client.database(&self.db_name)
    }
}

#[async_trait]
impl MessageStore for MongoStore {
    fn limits(&self) -> PageLimits {
        self.limits
    }

    async fn create_conversation(&self, conv: NewConversation) -> Result<Conversation> {
        db::create_conversation(&self.database(), conv).await
    }

    async fn get_conversation(&self, id: ObjectId) -> Result<Option<Conversation>> {
        db::get_conversation(&self.database(), id).await
    }

    async fn add_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation> {
        db::add_participant(&self.database(), id, user_id).await
    }

    async fn remove_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation> {
        db::remove_participant(&self.database(), id, user_id).await
    }

    async fn delete_conversation(&self, id: ObjectId) -> Result<u64> {
        db::delete_conversation(&self.database(), id).await
    }

    async fn user_conversations(
        &self,
        user_id: i64,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let limit = self.limits.clamp(page.limit);
        db::user_conversations(&self.database(), user_id, page.cursor, limit).await
    }

    async fn recent_conversations(&self, page: PageRequest) -> Result<Page<Conversation>> {
        let limit = self.limits.clamp(page.limit);
        db::recent_conversations(&self.database(), page.cursor, limit).await
    }

    async fn insert_message(&self, msg: NewMessage) -> Result<Message> {
        db::insert_message(&self.database(), msg).await
    }

    async fn insert_messages(&self, batch: Vec<NewMessage>) -> Result<InsertReport> {
        db::insert_messages(&self.database(), batch).await
    }

    async fn get_message(&self, id: ObjectId) -> Result<Option<Message>> {
        db::get_message(&self.database(), id).await
    }

    async fn update_message(&self, id: ObjectId, update: MessageUpdate) -> Result<Message> {
        db::update_message(&self.database(), id, update).await
    }

    async fn delete_message(&self, id: ObjectId) -> Result<bool> {
        db::delete_message(&self.database(), id).await
    }

    async fn conversation_messages(
        &self,
        conversation: ObjectId,
        page: PageRequest,
    ) -> Result<Page<Message>> {
        let limit = self.limits.clamp(page.limit);
        db::conversation_messages(&self.database(), conversation, page.cursor, limit).await
    }

    async fn conversation_messages_between(
        &self,
        conversation: ObjectId,
        range: TimeRange,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let limit = self.limits.clamp(limit);
        db::conversation_messages_between(&self.database(), conversation, range, limit).await
    }

    async fn author_messages(&self, author_id: i64, page: PageRequest) -> Result<Page<Message>> {
        let limit = self.limits.clamp(page.limit);
        db::author_messages(&self.database(), author_id, page.cursor, limit).await
    }

    async fn search_messages(&self, query: SearchQuery) -> Result<Vec<SearchHit>> {
        let limit = self.limits.clamp(query.limit);
        db::search_messages(&self.database(), &query.text, query.conversation, limit).await
    }

    async fn count_messages(&self, filter: CountFilter) -> Result<u64> {
        db::count_messages(&self.database(), filter).await
    }

    async fn prune_messages(&self, before: DateTime<Utc>) -> Result<u64> {
        db::prune_messages(&self.database(), before).await
    }
}
