use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::cursor::{Page, PageCursor, PageLimits, PageRequest};
use super::error::{Error, Result};
use super::models::{
    self, Conversation, CountFilter, InsertReport, Message, MessageUpdate, NewConversation,
    NewMessage, Participant, SearchHit, SearchQuery, TimeRange,
};
use super::store::MessageStore;
use super::text::{tokenize, SearchTerms};

fn min_id() -> ObjectId {
    ObjectId::from_bytes([0; 12])
}

fn max_id() -> ObjectId {
    ObjectId::from_bytes([0xff; 12])
}

fn min_ts() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

fn max_ts() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// Walks `set` between the bounds from the high end, newest first.
fn take_desc<K: Ord + Clone>(set: &BTreeSet<K>, lo: Bound<K>, hi: Bound<K>, n: usize) -> Vec<K> {
    set.range((lo, hi)).rev().take(n).cloned().collect()
}

#[derive(Default, Debug, PartialEq)]
struct Inner {
    messages: HashMap<ObjectId, Message>,
    /// conversationId_1__id_-1
    by_conversation_id: BTreeSet<(ObjectId, ObjectId)>,
    /// conversationId_1_createdAt_-1
    by_conversation_time: BTreeSet<(ObjectId, DateTime<Utc>, ObjectId)>,
    /// authorId_1_createdAt_-1
    by_author_time: BTreeSet<(i64, DateTime<Utc>, ObjectId)>,
    /// messageId_1, unique and sparse
    by_client_id: HashMap<String, ObjectId>,
    /// content.text_text
    text: HashMap<String, HashSet<ObjectId>>,

    conversations: HashMap<ObjectId, Conversation>,
    /// participants.userId_1_updatedAt_-1
    by_participant: BTreeSet<(i64, DateTime<Utc>, ObjectId)>,
    /// updatedAt_-1
    by_update: BTreeSet<(DateTime<Utc>, ObjectId)>,
}

impl Inner {
    fn index_message(&mut self, m: &Message) {
        self.by_conversation_id.insert((m.conversation_id, m.id));
        self.by_conversation_time
            .insert((m.conversation_id, m.created_at, m.id));
        self.by_author_time.insert((m.author_id, m.created_at, m.id));
        if let Some(client_id) = &m.message_id {
            self.by_client_id.insert(client_id.clone(), m.id);
        }
        for token in tokenize(m.text()) {
            self.text.entry(token).or_default().insert(m.id);
        }
    }

    fn unindex_message(&mut self, m: &Message) {
        self.by_conversation_id.remove(&(m.conversation_id, m.id));
        self.by_conversation_time
            .remove(&(m.conversation_id, m.created_at, m.id));
        self.by_author_time.remove(&(m.author_id, m.created_at, m.id));
        if let Some(client_id) = &m.message_id {
            self.by_client_id.remove(client_id);
        }
        for token in tokenize(m.text()) {
            if let Some(ids) = self.text.get_mut(&token) {
                ids.remove(&m.id);
                if ids.is_empty() {
                    self.text.remove(&token);
                }
            }
        }
    }

    fn put_message(&mut self, m: Message) {
        self.index_message(&m);
        self.messages.insert(m.id, m);
    }

    fn take_message(&mut self, id: &ObjectId) -> Option<Message> {
        let m = self.messages.remove(id)?;
        self.unindex_message(&m);
        Some(m)
    }

    fn index_conversation(&mut self, c: &Conversation) {
        for p in &c.participants {
            self.by_participant.insert((p.user_id, c.updated_at, c.id));
        }
        self.by_update.insert((c.updated_at, c.id));
    }

    fn unindex_conversation(&mut self, c: &Conversation) {
        for p in &c.participants {
            self.by_participant.remove(&(p.user_id, c.updated_at, c.id));
        }
        self.by_update.remove(&(c.updated_at, c.id));
    }

    fn put_conversation(&mut self, c: Conversation) {
        self.index_conversation(&c);
        self.conversations.insert(c.id, c);
    }

    fn modify_conversation(
        &mut self,
        id: &ObjectId,
        f: impl FnOnce(&mut Conversation),
    ) -> Option<Conversation> {
        let mut c = self.conversations.remove(id)?;
        self.unindex_conversation(&c);
        f(&mut c);
        self.put_conversation(c.clone());
        Some(c)
    }

    fn touch_conversation(&mut self, id: &ObjectId, ts: DateTime<Utc>) {
        self.modify_conversation(id, |c| c.updated_at = c.updated_at.max(ts));
    }

    fn check_insert(&self, msg: &NewMessage) -> Result<()> {
        let conv = self
            .conversations
            .get(&msg.conversation_id)
            .ok_or_else(|| Error::not_found("conversation", msg.conversation_id))?;
        if !conv.has_participant(msg.author_id) {
            return Err(Error::NotParticipant {
                conversation: conv.id.to_hex().into(),
                user: msg.author_id,
            });
        }
        Ok(())
    }

    fn stored_duplicate(&self, msg: &NewMessage) -> Option<&Message> {
        let id = self.by_client_id.get(msg.message_id.as_deref()?)?;
        self.messages.get(id)
    }

    fn insert_checked(&mut self, msg: NewMessage) -> Message {
        let msg = Message::from_new(msg);
        self.put_message(msg.clone());
        self.touch_conversation(&msg.conversation_id, msg.created_at);
        msg
    }

    fn messages_for(&self, ids: impl IntoIterator<Item = ObjectId>) -> Vec<Message> {
        ids.into_iter()
            .filter_map(|id| self.messages.get(&id).cloned())
            .collect()
    }

    fn conversations_for(&self, ids: impl IntoIterator<Item = ObjectId>) -> Vec<Conversation> {
        ids.into_iter()
            .filter_map(|id| self.conversations.get(&id).cloned())
            .collect()
    }

    /// Ids worth scoring for `terms`. Phrases match as substrings, which the
    /// token postings cannot answer, so phrase queries scan the scope.
    fn search_candidates(
        &self,
        terms: &SearchTerms,
        conversation: Option<ObjectId>,
    ) -> HashSet<ObjectId> {
        if terms.phrases.is_empty() {
            return terms
                .candidate_tokens()
                .iter()
                .filter_map(|t| self.text.get(t))
                .flatten()
                .copied()
                .collect();
        }
        match conversation {
            Some(conv) => self
                .by_conversation_id
                .range((conv, min_id())..=(conv, max_id()))
                .map(|&(_, id)| id)
                .collect(),
            None => self.messages.keys().copied().collect(),
        }
    }

    /// Secondary structures recomputed from the primary records.
    #[cfg(test)]
    fn rebuilt(&self) -> Inner {
        let mut fresh = Inner::default();
        for m in self.messages.values() {
            fresh.put_message(m.clone());
        }
        for c in self.conversations.values() {
            fresh.put_conversation(c.clone());
        }
        fresh
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    limits: PageLimits,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(PageLimits::default())
    }
}

impl MemoryStore {
    pub fn new(limits: PageLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            limits,
        }
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        let inner = self.inner.read().await;
        assert!(*inner == inner.rebuilt(), "secondary indexes drifted");
    }
}

fn keyset_upper<K>(cursor: Option<&PageCursor>, key: impl FnOnce(&PageCursor) -> K, last: K) -> Bound<K> {
    match cursor {
        Some(c) => Bound::Excluded(key(c)),
        None => Bound::Included(last),
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    fn limits(&self) -> PageLimits {
        self.limits
    }

    async fn create_conversation(&self, conv: NewConversation) -> Result<Conversation> {
        let conv = Conversation::from_new(conv);
        self.inner.write().await.put_conversation(conv.clone());
        log::debug!("Conversation {} created", conv.id);
        Ok(conv)
    }

    async fn get_conversation(&self, id: ObjectId) -> Result<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(&id).cloned())
    }

    async fn add_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation> {
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get(&id)
            .ok_or_else(|| Error::not_found("conversation", id))?;
        if conv.has_participant(user_id) {
            return Ok(conv.clone());
        }
        let now = models::now();
        inner
            .modify_conversation(&id, |c| {
                c.participants.push(Participant {
                    user_id,
                    joined_at: now,
                });
                c.updated_at = c.updated_at.max(now);
            })
            .ok_or_else(|| Error::not_found("conversation", id))
    }

    async fn remove_participant(&self, id: ObjectId, user_id: i64) -> Result<Conversation> {
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get(&id)
            .ok_or_else(|| Error::not_found("conversation", id))?;
        if !conv.has_participant(user_id) {
            return Ok(conv.clone());
        }
        let now = models::now();
        inner
            .modify_conversation(&id, |c| {
                c.participants.retain(|p| p.user_id != user_id);
                c.updated_at = c.updated_at.max(now);
            })
            .ok_or_else(|| Error::not_found("conversation", id))
    }

    async fn delete_conversation(&self, id: ObjectId) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .remove(&id)
            .ok_or_else(|| Error::not_found("conversation", id))?;
        inner.unindex_conversation(&conv);

        let ids = inner
            .by_conversation_id
            .range((id, min_id())..=(id, max_id()))
            .map(|&(_, m)| m)
            .collect::<Vec<_>>();
        for m in &ids {
            inner.take_message(m);
        }
        log::info!("Conversation {} deleted with {} messages", id, ids.len());
        Ok(ids.len() as u64)
    }

    async fn user_conversations(
        &self,
        user_id: i64,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let limit = self.limits.clamp(page.limit);
        let inner = self.inner.read().await;
        let keys = take_desc(
            &inner.by_participant,
            Bound::Included((user_id, min_ts(), min_id())),
            keyset_upper(
                page.cursor.as_ref(),
                |c| (user_id, c.created_at, c.id),
                (user_id, max_ts(), max_id()),
            ),
            limit as usize + 1,
        );
        let rows = inner.conversations_for(keys.into_iter().map(|(_, _, id)| id));
        Ok(Page::from_overfetch(rows, limit, |c| {
            PageCursor::new(c.updated_at, c.id)
        }))
    }

    async fn recent_conversations(&self, page: PageRequest) -> Result<Page<Conversation>> {
        let limit = self.limits.clamp(page.limit);
        let inner = self.inner.read().await;
        let keys = take_desc(
            &inner.by_update,
            Bound::Unbounded,
            keyset_upper(page.cursor.as_ref(), |c| (c.created_at, c.id), (max_ts(), max_id())),
            limit as usize + 1,
        );
        let rows = inner.conversations_for(keys.into_iter().map(|(_, id)| id));
        Ok(Page::from_overfetch(rows, limit, |c| {
            PageCursor::new(c.updated_at, c.id)
        }))
    }

    async fn insert_message(&self, msg: NewMessage) -> Result<Message> {
        let mut inner = self.inner.write().await;
        inner.check_insert(&msg)?;
        if let Some(existing) = inner.stored_duplicate(&msg) {
            log::debug!("Message {:?} already stored as {}", msg.message_id, existing.id);
            return Ok(existing.clone());
        }
        Ok(inner.insert_checked(msg))
    }

    async fn insert_messages(&self, batch: Vec<NewMessage>) -> Result<InsertReport> {
        let mut inner = self.inner.write().await;
        for msg in &batch {
            inner.check_insert(msg)?;
        }
        let mut report = InsertReport::default();
        for msg in batch {
            if inner.stored_duplicate(&msg).is_some() {
                report.duplicates += 1;
            } else {
                inner.insert_checked(msg);
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn get_message(&self, id: ObjectId) -> Result<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn update_message(&self, id: ObjectId, update: MessageUpdate) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let mut msg = inner
            .take_message(&id)
            .ok_or_else(|| Error::not_found("message", id))?;
        msg.content = update.content;
        msg.updated_at = Some(models::now());
        inner.put_message(msg.clone());
        Ok(msg)
    }

    async fn delete_message(&self, id: ObjectId) -> Result<bool> {
        Ok(self.inner.write().await.take_message(&id).is_some())
    }

    async fn conversation_messages(
        &self,
        conversation: ObjectId,
        page: PageRequest,
    ) -> Result<Page<Message>> {
        let limit = self.limits.clamp(page.limit);
        let inner = self.inner.read().await;
        let keys = take_desc(
            &inner.by_conversation_id,
            Bound::Included((conversation, min_id())),
            keyset_upper(
                page.cursor.as_ref(),
                |c| (conversation, c.id),
                (conversation, max_id()),
            ),
            limit as usize + 1,
        );
        let rows = inner.messages_for(keys.into_iter().map(|(_, id)| id));
        Ok(Page::from_overfetch(rows, limit, |m| {
            PageCursor::new(m.created_at, m.id)
        }))
    }

    async fn conversation_messages_between(
        &self,
        conversation: ObjectId,
        range: TimeRange,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let limit = self.limits.clamp(limit);
        if let (Some(from), Some(to)) = (range.from, range.to) {
            if from >= to {
                return Ok(Vec::new());
            }
        }
        let inner = self.inner.read().await;
        let lo = Bound::Included((conversation, range.from.unwrap_or_else(min_ts), min_id()));
        let hi = match range.to {
            Some(to) => Bound::Excluded((conversation, to, min_id())),
            None => Bound::Included((conversation, max_ts(), max_id())),
        };
        let keys = take_desc(&inner.by_conversation_time, lo, hi, limit as usize);
        Ok(inner.messages_for(keys.into_iter().map(|(_, _, id)| id)))
    }

    async fn author_messages(&self, author_id: i64, page: PageRequest) -> Result<Page<Message>> {
        let limit = self.limits.clamp(page.limit);
        let inner = self.inner.read().await;
        let keys = take_desc(
            &inner.by_author_time,
            Bound::Included((author_id, min_ts(), min_id())),
            keyset_upper(
                page.cursor.as_ref(),
                |c| (author_id, c.created_at, c.id),
                (author_id, max_ts(), max_id()),
            ),
            limit as usize + 1,
        );
        let rows = inner.messages_for(keys.into_iter().map(|(_, _, id)| id));
        Ok(Page::from_overfetch(rows, limit, |m| {
            PageCursor::new(m.created_at, m.id)
        }))
    }

    async fn search_messages(&self, query: SearchQuery) -> Result<Vec<SearchHit>> {
        let terms = SearchTerms::parse(&query.text)?;
        let limit = self.limits.clamp(query.limit) as usize;
        let inner = self.inner.read().await;

        let mut hits = inner
            .search_candidates(&terms, query.conversation)
            .into_iter()
            .filter_map(|id| inner.messages.get(&id))
            .filter(|m| query.conversation.map_or(true, |c| m.conversation_id == c))
            .filter_map(|m| {
                terms.score(m.text()).map(|score| SearchHit {
                    message: m.clone(),
                    score,
                })
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.message.id.cmp(&a.message.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_messages(&self, filter: CountFilter) -> Result<u64> {
        let inner = self.inner.read().await;
        let count = match filter.conversation {
            Some(conv) => inner
                .by_conversation_time
                .range((conv, min_ts(), min_id())..=(conv, max_ts(), max_id()))
                .filter(|&&(_, ts, _)| filter.range.contains(ts))
                .count(),
            None => inner
                .messages
                .values()
                .filter(|m| filter.range.contains(m.created_at))
                .count(),
        };
        Ok(count as u64)
    }

    async fn prune_messages(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let expired = inner
            .messages
            .values()
            .filter(|m| m.created_at < before)
            .map(|m| m.id)
            .collect::<Vec<_>>();
        for id in &expired {
            inner.take_message(id);
        }
        log::info!("Pruned {} messages created before {}", expired.len(), before);
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_utils::models::MessageContent;
    use chrono::{Duration, TimeZone};

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    async fn conversation(store: &MemoryStore, participants: Vec<i64>) -> Conversation {
        store
            .create_conversation(NewConversation {
                title: "general".into(),
                participants,
            })
            .await
            .unwrap()
    }

    fn message_at(conv: ObjectId, author: i64, text: &str, ts: DateTime<Utc>) -> NewMessage {
        NewMessage {
            created_at: Some(ts),
            ..NewMessage::text(conv, author, text)
        }
    }

    fn with_client_id(mut msg: NewMessage, id: &str) -> NewMessage {
        msg.message_id = Some(id.to_string());
        msg
    }

    #[tokio::test]
    async fn insert_requires_existing_conversation_and_membership() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1, 2]).await;

        let err = store
            .insert_message(NewMessage::text(ObjectId::new(), 1, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "conversation", .. }));

        let err = store
            .insert_message(NewMessage::text(conv.id, 3, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotParticipant { user: 3, .. }));

        let msg = store
            .insert_message(NewMessage::text(conv.id, 2, "hi"))
            .await
            .unwrap();
        assert_eq!(store.get_message(msg.id).await.unwrap(), Some(msg));
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn repeated_client_id_returns_stored_message() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;

        let first = store
            .insert_message(with_client_id(NewMessage::text(conv.id, 1, "once"), "c-1"))
            .await
            .unwrap();
        let again = store
            .insert_message(with_client_id(NewMessage::text(conv.id, 1, "twice"), "c-1"))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(store.count_messages(CountFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_counts_duplicates_in_batch_and_in_store() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1, 2]).await;
        store
            .insert_message(with_client_id(NewMessage::text(conv.id, 1, "a"), "a"))
            .await
            .unwrap();

        let report = store
            .insert_messages(vec![
                with_client_id(NewMessage::text(conv.id, 1, "a"), "a"),
                with_client_id(NewMessage::text(conv.id, 2, "b"), "b"),
                with_client_id(NewMessage::text(conv.id, 2, "b"), "b"),
                NewMessage::text(conv.id, 1, "no id"),
                NewMessage::text(conv.id, 1, "no id"),
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            InsertReport {
                inserted: 3,
                duplicates: 2
            }
        );
        assert_eq!(store.count_messages(CountFilter::default()).await.unwrap(), 4);
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn invalid_batch_writes_nothing() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;

        let err = store
            .insert_messages(vec![
                NewMessage::text(conv.id, 1, "fine"),
                NewMessage::text(conv.id, 99, "intruder"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotParticipant { user: 99, .. }));
        assert_eq!(store.count_messages(CountFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_pages_cover_everything_exactly_once() {
        let store = MemoryStore::new(PageLimits { default: 10, max: 10 });
        let conv = conversation(&store, vec![1]).await;
        let other = conversation(&store, vec![1]).await;

        let mut inserted = Vec::new();
        for i in 0..25 {
            let msg = store
                .insert_message(NewMessage::text(conv.id, 1, format!("message {}", i)))
                .await
                .unwrap();
            inserted.push(msg.id);
            store
                .insert_message(NewMessage::text(other.id, 1, "noise"))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut page = PageRequest::first(0);
        let mut sizes = Vec::new();
        loop {
            let res = store.conversation_messages(conv.id, page).await.unwrap();
            sizes.push(res.items.len());
            seen.extend(res.items.iter().map(|m| m.id));
            match res.next {
                Some(next) => page = PageRequest::after(next, 0),
                None => break,
            }
        }

        inserted.reverse();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(seen, inserted);
    }

    #[tokio::test]
    async fn author_pages_break_timestamp_ties() {
        let store = MemoryStore::new(PageLimits { default: 2, max: 50 });
        let conv = conversation(&store, vec![7]).await;
        let ts = at(1_000_000);

        let batch = (0..5)
            .map(|i| message_at(conv.id, 7, &format!("tie {}", i), ts))
            .chain(std::iter::once(message_at(conv.id, 7, "older", ts - Duration::seconds(1))))
            .collect::<Vec<_>>();
        store.insert_messages(batch).await.unwrap();

        let mut seen = Vec::new();
        let mut page = PageRequest::first(0);
        loop {
            let res = store.author_messages(7, page).await.unwrap();
            assert!(res.items.len() <= 2);
            seen.extend(res.items);
            match res.next {
                Some(next) => page = PageRequest::after(next, 0),
                None => break,
            }
        }

        assert_eq!(seen.len(), 6);
        assert_eq!(seen.last().map(|m| m.text()), Some("older"));
        let ids = seen.iter().map(|m| m.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 6);
        assert!(seen[..5].windows(2).all(|w| w[0].id > w[1].id));
    }

    #[tokio::test]
    async fn range_query_is_half_open_and_newest_first() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;
        let batch = [100, 200, 300, 400]
            .iter()
            .map(|&ms| message_at(conv.id, 1, &ms.to_string(), at(ms)))
            .collect::<Vec<_>>();
        store.insert_messages(batch).await.unwrap();

        let texts = |msgs: Vec<Message>| msgs.iter().map(|m| m.text().to_string()).collect::<Vec<_>>();

        let res = store
            .conversation_messages_between(conv.id, TimeRange::between(at(200), at(400)), 0)
            .await
            .unwrap();
        assert_eq!(texts(res), vec!["300", "200"]);

        let res = store
            .conversation_messages_between(conv.id, TimeRange::since(at(300)), 0)
            .await
            .unwrap();
        assert_eq!(texts(res), vec!["400", "300"]);

        let res = store
            .conversation_messages_between(conv.id, TimeRange::default(), 1)
            .await
            .unwrap();
        assert_eq!(texts(res), vec!["400"]);
    }

    #[tokio::test]
    async fn inbox_follows_latest_activity() {
        let store = MemoryStore::default();
        let a = conversation(&store, vec![1, 2]).await;
        let b = conversation(&store, vec![1]).await;
        let _other = conversation(&store, vec![2]).await;

        store
            .insert_message(message_at(a.id, 2, "bump", models::now() + Duration::seconds(5)))
            .await
            .unwrap();

        let inbox = store
            .user_conversations(1, PageRequest::first(0))
            .await
            .unwrap();
        let ids = inbox.items.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(inbox.next.is_none());

        let recent = store
            .recent_conversations(PageRequest::first(2))
            .await
            .unwrap();
        assert_eq!(recent.items[0].id, a.id);
        assert_eq!(recent.items.len(), 2);
        let rest = store
            .recent_conversations(PageRequest::after(recent.next.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next.is_none());
        assert!(!recent.items.iter().any(|c| c.id == rest.items[0].id));
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn late_messages_never_move_activity_backwards() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;

        store
            .insert_message(message_at(conv.id, 1, "old", at(1_000)))
            .await
            .unwrap();

        let stored = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, conv.updated_at);
    }

    #[tokio::test]
    async fn membership_changes_update_inbox() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;

        let added = store.add_participant(conv.id, 2).await.unwrap();
        assert!(added.has_participant(2));
        let again = store.add_participant(conv.id, 2).await.unwrap();
        assert_eq!(again.participants.len(), 2);

        let inbox = store.user_conversations(2, PageRequest::first(0)).await.unwrap();
        assert_eq!(inbox.items.len(), 1);

        let removed = store.remove_participant(conv.id, 2).await.unwrap();
        assert!(!removed.has_participant(2));
        assert!(removed.updated_at >= added.updated_at);
        let inbox = store.user_conversations(2, PageRequest::first(0)).await.unwrap();
        assert!(inbox.items.is_empty());

        let untouched = store.remove_participant(conv.id, 42).await.unwrap();
        assert_eq!(untouched.updated_at, removed.updated_at);
        assert_eq!(untouched.participants, removed.participants);

        let err = store.add_participant(ObjectId::new(), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let err = store.remove_participant(ObjectId::new(), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "conversation", .. }));
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn deleting_a_conversation_cascades() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;
        let keep = conversation(&store, vec![1]).await;
        for _ in 0..3 {
            store
                .insert_message(NewMessage::text(conv.id, 1, "bye"))
                .await
                .unwrap();
        }
        store
            .insert_message(NewMessage::text(keep.id, 1, "stay"))
            .await
            .unwrap();

        assert_eq!(store.delete_conversation(conv.id).await.unwrap(), 3);
        assert!(store.get_conversation(conv.id).await.unwrap().is_none());
        assert_eq!(store.count_messages(CountFilter::default()).await.unwrap(), 1);
        assert!(matches!(
            store.delete_conversation(conv.id).await,
            Err(Error::NotFound { .. })
        ));
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn edits_refresh_the_text_index() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;
        let msg = store
            .insert_message(NewMessage::text(conv.id, 1, "original wording"))
            .await
            .unwrap();

        let updated = store
            .update_message(
                msg.id,
                MessageUpdate {
                    content: MessageContent::text("revised wording"),
                },
            )
            .await
            .unwrap();
        assert!(updated.updated_at.is_some());
        assert_eq!(updated.created_at, msg.created_at);

        let search = |text: &str| SearchQuery {
            text: text.into(),
            conversation: None,
            limit: 0,
        };
        assert!(store.search_messages(search("original")).await.unwrap().is_empty());
        assert_eq!(store.search_messages(search("revised")).await.unwrap().len(), 1);

        let missing = store
            .update_message(
                ObjectId::new(),
                MessageUpdate {
                    content: MessageContent::text("x"),
                },
            )
            .await;
        assert!(matches!(missing, Err(Error::NotFound { kind: "message", .. })));
        store.assert_consistent().await;
    }

    #[tokio::test]
    async fn search_ranks_and_scopes() {
        let store = MemoryStore::default();
        let a = conversation(&store, vec![1]).await;
        let b = conversation(&store, vec![1]).await;
        let both = store
            .insert_message(NewMessage::text(a.id, 1, "deploy the rollback"))
            .await
            .unwrap();
        let one = store
            .insert_message(NewMessage::text(a.id, 1, "deploy today"))
            .await
            .unwrap();
        store
            .insert_message(NewMessage::text(a.id, 1, "deploy to staging"))
            .await
            .unwrap();
        let elsewhere = store
            .insert_message(NewMessage::text(b.id, 1, "rollback plan"))
            .await
            .unwrap();

        let hits = store
            .search_messages(SearchQuery {
                text: "deploy rollback -staging".into(),
                conversation: None,
                limit: 0,
            })
            .await
            .unwrap();
        let ids = hits.iter().map(|h| h.message.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![both.id, elsewhere.id, one.id]);
        assert!(hits[0].score > hits[1].score);

        let scoped = store
            .search_messages(SearchQuery {
                text: "rollback".into(),
                conversation: Some(b.id),
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].message.id, elsewhere.id);

        let empty = store
            .search_messages(SearchQuery {
                text: "-staging".into(),
                conversation: None,
                limit: 0,
            })
            .await;
        assert!(matches!(empty, Err(Error::EmptySearch)));
    }

    #[tokio::test]
    async fn search_agrees_with_a_full_scan() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;
        let texts = [
            "please renew versions today",
            "New Version shipped",
            "deploy the new version",
            "nothing relevant",
        ];
        for text in texts.iter() {
            store
                .insert_message(NewMessage::text(conv.id, 1, *text))
                .await
                .unwrap();
        }

        for query in [r#""new version""#, r#"deploy "new version""#, "version", "renew -today"] {
            let terms = SearchTerms::parse(query).unwrap();
            let mut expected = texts
                .iter()
                .filter(|t| terms.matches(t))
                .map(|t| t.to_string())
                .collect::<Vec<_>>();
            expected.sort();

            let hits = store
                .search_messages(SearchQuery {
                    text: query.into(),
                    conversation: Some(conv.id),
                    limit: 0,
                })
                .await
                .unwrap();
            let mut found = hits
                .iter()
                .map(|h| h.message.text().to_string())
                .collect::<Vec<_>>();
            found.sort();
            assert_eq!(found, expected, "{}", query);
        }

        let hits = store
            .search_messages(SearchQuery {
                text: r#""new version""#.into(),
                conversation: None,
                limit: 0,
            })
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.message.text() == "please renew versions today"));
    }

    #[tokio::test]
    async fn prune_and_count_respect_time_bounds() {
        let store = MemoryStore::default();
        let conv = conversation(&store, vec![1]).await;
        let batch = [10, 20, 30, 40]
            .iter()
            .map(|&ms| message_at(conv.id, 1, "x", at(ms)))
            .collect::<Vec<_>>();
        store.insert_messages(batch).await.unwrap();

        let count = |range| CountFilter {
            conversation: Some(conv.id),
            range,
        };
        assert_eq!(store.count_messages(count(TimeRange::between(at(20), at(40)))).await.unwrap(), 2);
        assert_eq!(store.count_messages(count(TimeRange::default())).await.unwrap(), 4);

        assert_eq!(store.prune_messages(at(30)).await.unwrap(), 2);
        assert_eq!(store.count_messages(CountFilter::default()).await.unwrap(), 2);
        assert!(!store.delete_message(ObjectId::new()).await.unwrap());
        store.assert_consistent().await;
    }
}
