use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use zmta_proto::WireEvent;

use super::normalize::{normalize_address, normalize_message_id, normalize_recipients};

/// One persisted delivery event (`messages` table).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: String,
    pub seq: Option<String>,
    pub action: Option<String>,
    pub fields: Map<String, Value>,
    pub t: OffsetDateTime,
    pub e: OffsetDateTime,
}

impl StoredEvent {
    pub fn from_wire(
        event: WireEvent,
        t: OffsetDateTime,
        e: OffsetDateTime
    ) -> Self {
        Self {
            id: event.id,
            seq: event.seq,
            action: event.action.map(|action| action.to_string()),
            fields: event.fields,
            t,
            e,
        }
    }
}

/// Upper bound of the `TIMESTAMP` columns, 2038-01-19 03:14:07 UTC.
pub const LATEST_TIMESTAMP: i64 = i32::MAX as i64;

/// Expiry of a row stamped at `t`, or `None` when it falls outside what the
/// timestamp columns can hold.
pub fn expiry_after(
    t: OffsetDateTime,
    retention: Duration
) -> Option<OffsetDateTime> {
    let retention = time::Duration::try_from(retention).ok()?;
    t.checked_add(retention)
        .filter(|e| e.unix_timestamp() <= LATEST_TIMESTAMP)
}

/// Lookup record of the `mids` table.
///
/// Entries are idempotent on their natural key (`mid`, `from`, `to`, `id`):
/// writing the same entry twice leaves one row and the second write reports
/// [`StoreError::Duplicate`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub mid: String,
    pub from: String,
    pub to: Vec<String>,
    pub id: String,
    pub t: OffsetDateTime,
    pub e: OffsetDateTime,
}

impl IndexEntry {
    /// Derives the index entry for an event whose action reveals the
    /// message-id. Returns `None` for other actions or when no message-id is
    /// present.
    pub fn derive(
        event: &WireEvent,
        t: OffsetDateTime,
        e: OffsetDateTime
    ) -> Option<Self> {
        if !event.action.as_ref()?.indexes_message_id() {
            return None;
        }
        let raw_mid = event.field_text("message-id").filter(|mid| !mid.is_empty())?;

        Some(Self {
            mid: normalize_message_id(&raw_mid),
            from: event
                .field_text("from")
                .map(|from| normalize_address(&from))
                .unwrap_or_default(),
            to: event
                .fields
                .get("to")
                .map(normalize_recipients)
                .unwrap_or_default(),
            id: event.id.clone(),
            t,
            e,
        })
    }

    /// Hex SHA-256 over the NUL separated natural key.
    pub fn natural_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mid.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.from.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.to.join(",").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Index entry with its unique, insertion ordered row key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub key: u64,
    pub entry: IndexEntry,
}

/// Conjunction of search terms against the `mids` table. All values are
/// expected in normalized form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub mid: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    /// Literal, case-sensitive substring of `mid`.
    pub text: Option<String>,
}

impl IndexFilter {
    #[cfg(test)]
    pub fn matches(
        &self,
        entry: &IndexEntry
    ) -> bool {
        self.from.as_ref().is_none_or(|from| &entry.from == from)
            && self.to.as_ref().is_none_or(|to| entry.to.contains(to))
            && self.id.as_ref().is_none_or(|id| &entry.id == id)
            && self.mid.as_ref().is_none_or(|mid| &entry.mid == mid)
            && self.start.is_none_or(|start| entry.t >= start)
            && self.end.is_none_or(|end| entry.t <= end)
            && self.text.as_ref().is_none_or(|text| entry.mid.contains(text.as_str()))
    }
}

/// Position of a page relative to an already seen row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Rows with a smaller key (older).
    Before(u64),
    /// Rows with a larger key (newer).
    After(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub messages: u64,
    pub mids: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key")]
    Duplicate,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Duplicate,
            _ => Self::Database(err),
        }
    }
}

/// Persistence used by the ingest sink, the search service and the admin
/// views.
pub trait EventStore: Send + Sync + 'static {
    fn insert_event(
        &self,
        event: &StoredEvent
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_index_entry(
        &self,
        entry: &IndexEntry
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delivery log of one queue id, oldest first.
    fn events_for(
        &self,
        id: &str
    ) -> impl Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send;

    /// Up to `limit` matching rows, newest first. With an anchor, the rows
    /// closest to the anchor key on the requested side are returned.
    fn fetch_index_page(
        &self,
        filter: &IndexFilter,
        anchor: Option<Anchor>,
        limit: u32
    ) -> impl Future<Output = Result<Vec<IndexRow>, StoreError>> + Send;

    fn count_index(
        &self,
        filter: &IndexFilter
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Deletes events and index entries whose expiry is before `now`.
    fn purge_expired(
        &self,
        now: OffsetDateTime
    ) -> impl Future<Output = Result<PurgeStats, StoreError>> + Send;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// In-memory store with the same natural key semantics as MySQL.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        events: Vec<StoredEvent>,
        rows: Vec<IndexRow>,
        keys: HashSet<String>,
        next_key: u64,
        fail_events: bool,
        fail_index: bool,
    }

    impl MemoryStore {
        pub fn failing_events() -> Self {
            let store = Self::default();
            store.state.lock().unwrap().fail_events = true;
            store
        }

        pub fn failing_index() -> Self {
            let store = Self::default();
            store.state.lock().unwrap().fail_index = true;
            store
        }

        pub fn events(&self) -> Vec<StoredEvent> {
            self.state.lock().unwrap().events.clone()
        }

        pub fn index_rows(&self) -> Vec<IndexRow> {
            self.state.lock().unwrap().rows.clone()
        }
    }

    impl EventStore for MemoryStore {
        async fn insert_event(
            &self,
            event: &StoredEvent
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_events {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            state.events.push(event.clone());
            Ok(())
        }

        async fn insert_index_entry(
            &self,
            entry: &IndexEntry
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_index {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            if !state.keys.insert(entry.natural_key()) {
                return Err(StoreError::Duplicate);
            }
            state.next_key += 1;
            let key = state.next_key;
            state.rows.push(IndexRow { key, entry: entry.clone() });
            Ok(())
        }

        async fn events_for(
            &self,
            id: &str
        ) -> Result<Vec<StoredEvent>, StoreError> {
            let state = self.state.lock().unwrap();
            let mut events: Vec<StoredEvent> =
                state.events.iter().filter(|event| event.id == id).cloned().collect();
            events.sort_by_key(|event| event.t);
            Ok(events)
        }

        async fn fetch_index_page(
            &self,
            filter: &IndexFilter,
            anchor: Option<Anchor>,
            limit: u32
        ) -> Result<Vec<IndexRow>, StoreError> {
            let state = self.state.lock().unwrap();
            let mut rows: Vec<IndexRow> = state
                .rows
                .iter()
                .filter(|row| filter.matches(&row.entry))
                .filter(|row| match anchor {
                    None => true,
                    Some(Anchor::Before(key)) => row.key < key,
                    Some(Anchor::After(key)) => row.key > key,
                })
                .cloned()
                .collect();

            match anchor {
                Some(Anchor::After(_)) => {
                    rows.sort_by_key(|row| row.key);
                    rows.truncate(limit as usize);
                    rows.reverse();
                }
                _ => {
                    rows.sort_by(|a, b| b.key.cmp(&a.key));
                    rows.truncate(limit as usize);
                }
            }
            Ok(rows)
        }

        async fn count_index(
            &self,
            filter: &IndexFilter
        ) -> Result<u64, StoreError> {
            let state = self.state.lock().unwrap();
            Ok(state.rows.iter().filter(|row| filter.matches(&row.entry)).count()
                as u64)
        }

        async fn purge_expired(
            &self,
            now: OffsetDateTime
        ) -> Result<PurgeStats, StoreError> {
            let mut state = self.state.lock().unwrap();
            let events_before = state.events.len();
            let rows_before = state.rows.len();
            state.events.retain(|event| event.e >= now);
            state.rows.retain(|row| row.entry.e >= now);
            Ok(PurgeStats {
                messages: (events_before - state.events.len()) as u64,
                mids: (rows_before - state.rows.len()) as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use zmta_proto::Action;

    use super::*;

    const T: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);
    const E: OffsetDateTime = datetime!(2024-03-08 12:00:00 UTC);

    #[test]
    fn index_entry_is_derived_for_queued_with_message_id() {
        let event = WireEvent::new("ab12cd34ef56gh78ij")
            .with_action(Action::Queued)
            .with_field("message-id", " <Msg.1@Example.com> ")
            .with_field("from", " <Alice@Example.com> ")
            .with_field("to", "Bob@example.com, carol@EXAMPLE.com");

        let entry = IndexEntry::derive(&event, T, E).unwrap();
        assert_eq!(entry.mid, "Msg.1@Example.com");
        assert_eq!(entry.from, "alice@example.com");
        assert_eq!(entry.to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(entry.id, "ab12cd34ef56gh78ij");
        assert_eq!(entry.t, T);
        assert_eq!(entry.e, E);
    }

    #[test]
    fn no_index_entry_for_other_actions_or_missing_message_id() {
        let accepted = WireEvent::new("x")
            .with_action(Action::Accepted)
            .with_field("message-id", "<a@b>");
        assert!(IndexEntry::derive(&accepted, T, E).is_none());

        let queued = WireEvent::new("x").with_action(Action::Queued);
        assert!(IndexEntry::derive(&queued, T, E).is_none());

        let no_action = WireEvent::new("x").with_field("message-id", "<a@b>");
        assert!(IndexEntry::derive(&no_action, T, E).is_none());
    }

    #[test]
    fn natural_key_ignores_timestamps() {
        let event = WireEvent::new("x")
            .with_action(Action::Drop)
            .with_field("message-id", "<a@b>");
        let first = IndexEntry::derive(&event, T, E).unwrap();
        let second = IndexEntry::derive(&event, E, E).unwrap();
        assert_eq!(first.natural_key(), second.natural_key());

        let other = IndexEntry { id: "y".to_string(), ..first.clone() };
        assert_ne!(first.natural_key(), other.natural_key());
    }

    #[test]
    fn filter_matches_every_term() {
        let entry = IndexEntry {
            mid: "Msg.1@Example.com".to_string(),
            from: "alice@example.com".to_string(),
            to: vec!["bob@example.com".to_string()],
            id: "x".to_string(),
            t: T,
            e: E,
        };

        assert!(IndexFilter::default().matches(&entry));
        assert!(
            IndexFilter {
                from: Some("alice@example.com".to_string()),
                to: Some("bob@example.com".to_string()),
                end: Some(T),
                text: Some("1@Ex".to_string()),
                ..Default::default()
            }
            .matches(&entry)
        );
        assert!(
            !IndexFilter { text: Some("1@ex".to_string()), ..Default::default() }
                .matches(&entry)
        );
        assert!(
            !IndexFilter {
                start: Some(datetime!(2024-03-02 00:00:00 UTC)),
                ..Default::default()
            }
            .matches(&entry)
        );
    }

    #[test]
    fn expiry_stays_inside_timestamp_range() {
        assert_eq!(expiry_after(T, Duration::from_secs(7 * 86_400)), Some(E));
        assert_eq!(expiry_after(T, Duration::MAX), None);
        assert_eq!(
            expiry_after(T, Duration::from_secs(300_000 * 365 * 86_400)),
            None
        );
        assert_eq!(
            expiry_after(datetime!(2038-01-19 03:00:00 UTC), Duration::from_secs(3600)),
            None
        );
        assert!(
            expiry_after(datetime!(2038-01-19 03:00:00 UTC), Duration::from_secs(60))
                .is_some()
        );
    }
}
