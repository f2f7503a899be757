use std::fmt;
use std::str::FromStr;

use bson::oid::ObjectId;
use chrono::{DateTime, TimeZone, Utc};

use super::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: ObjectId,
}

impl PageCursor {
    pub fn new(created_at: DateTime<Utc>, id: ObjectId) -> Self {
        Self { created_at, id }
    }

    /// True when `(ts, id)` sorts strictly after the cursor in newest-first order.
    pub fn precedes(&self, ts: DateTime<Utc>, id: ObjectId) -> bool {
        (ts, id) < (self.created_at, self.id)
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.created_at.timestamp_millis(), self.id.to_hex())
    }
}

impl FromStr for PageCursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidCursor(s.into());
        let (millis, id) = s.split_once('.').ok_or_else(bad)?;
        let millis = millis.parse::<i64>().map_err(|_| bad())?;
        let created_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(bad)?;
        let id = ObjectId::parse_str(id).map_err(|_| bad())?;
        Ok(Self { created_at, id })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageRequest {
    pub cursor: Option<PageCursor>,
    /// Zero selects the configured default.
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub fn after(cursor: PageCursor, limit: u32) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default: u32,
    pub max: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default: 50,
            max: 200,
        }
    }
}

impl PageLimits {
    pub fn clamp(&self, requested: u32) -> u32 {
        match requested {
            0 => self.default.min(self.max),
            n => n.min(self.max),
        }
        .max(1)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

impl<T> Page<T> {
    /// Builds a page from up to `limit + 1` rows fetched in page order.
    /// The extra row only signals that another page exists.
    pub fn from_overfetch(mut rows: Vec<T>, limit: u32, key: impl Fn(&T) -> PageCursor) -> Self {
        let limit = limit as usize;
        let more = rows.len() > limit;
        rows.truncate(limit);
        let next = if more { rows.last().map(key) } else { None };
        Self { items: rows, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_token_round_trips() {
        let cursor = PageCursor::new(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(), ObjectId::new());
        let token = cursor.to_string();
        assert!(token.starts_with("1700000000123."));
        assert_eq!(token.parse::<PageCursor>().unwrap(), cursor);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "123", "abc.507f1f77bcf86cd799439011", "123.zz", "123.507f1f77"] {
            assert!(
                matches!(token.parse::<PageCursor>(), Err(Error::InvalidCursor(_))),
                "{} should be rejected",
                token
            );
        }
    }

    #[test]
    fn precedes_breaks_timestamp_ties_by_id() {
        let ts = Utc.timestamp_millis_opt(5_000).unwrap();
        let low = ObjectId::from_bytes([0; 12]);
        let high = ObjectId::from_bytes([0xff; 12]);
        let cursor = PageCursor::new(ts, high);
        assert!(cursor.precedes(ts, low));
        assert!(!cursor.precedes(ts, high));
        assert!(!PageCursor::new(ts, low).precedes(ts, high));
        assert!(cursor.precedes(Utc.timestamp_millis_opt(4_999).unwrap(), high));
    }

    #[test]
    fn limits_are_clamped() {
        let limits = PageLimits { default: 20, max: 100 };
        assert_eq!(limits.clamp(0), 20);
        assert_eq!(limits.clamp(7), 7);
        assert_eq!(limits.clamp(1_000), 100);
    }

    #[test]
    fn overfetch_sets_next_only_when_more_rows_exist() {
        let ts = Utc.timestamp_millis_opt(0).unwrap();
        let ids = (0..3).map(|_| ObjectId::new()).collect::<Vec<_>>();
        let key = |id: &ObjectId| PageCursor::new(ts, *id);

        let page = Page::from_overfetch(ids.clone(), 2, key);
        assert_eq!(page.items, ids[..2]);
        assert_eq!(page.next, Some(PageCursor::new(ts, ids[1])));

        let page = Page::from_overfetch(ids.clone(), 3, key);
        assert_eq!(page.items.len(), 3);
        assert!(page.next.is_none());
    }
}
