use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use super::normalize::{is_queue_id, normalize_address, normalize_message_id, normalize_term};
use super::store::{Anchor, EventStore, IndexFilter, IndexRow, StoreError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid date for `{term}`: {value}")]
    BadDate { term: &'static str, value: String },
    #[error("invalid cursor")]
    BadCursor,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a search box query resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedQuery {
    /// The whole query is a queue id (optionally `id.seq`); open it directly.
    Lookup(String),
    Filter(IndexFilter),
}

/// Splits `from:… to:… id:… message-id:… start:… end:…` terms from the free
/// text remainder. Unknown `key:value` tokens stay part of the free text.
pub fn parse_query(raw: &str) -> Result<ParsedQuery, QueryError> {
    let mut filter = IndexFilter::default();
    let mut structured = false;
    let mut text = Vec::new();

    for token in raw.split_whitespace() {
        let Some((key, value)) = token.split_once(':') else {
            text.push(token);
            continue;
        };
        if value.is_empty() {
            text.push(token);
            continue;
        }

        match key.to_ascii_lowercase().as_str() {
            "from" => filter.from = Some(normalize_address(value)),
            "to" => filter.to = Some(normalize_address(value)),
            "id" => filter.id = Some(value.to_string()),
            "message-id" | "mid" => filter.mid = Some(normalize_message_id(value)),
            "start" => filter.start = Some(parse_date("start", value)?),
            "end" => filter.end = Some(parse_date("end", value)?),
            _ => {
                text.push(token);
                continue;
            }
        }
        structured = true;
    }

    let text = normalize_term(&text.join(" "));
    if !structured && is_queue_id(&text) {
        return Ok(ParsedQuery::Lookup(text));
    }
    if !text.is_empty() {
        filter.text = Some(text);
    }
    Ok(ParsedQuery::Filter(filter))
}

/// `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
fn parse_date(
    term: &'static str,
    value: &str
) -> Result<OffsetDateTime, QueryError> {
    let day = format_description!("[year]-[month]-[day]");
    if let Ok(date) = Date::parse(value, &day) {
        return Ok(date.midnight().assume_utc());
    }
    OffsetDateTime::parse(value, &Rfc3339).map_err(|_| QueryError::BadDate {
        term,
        value: value.to_string(),
    })
}

/// Opaque page pointer: the row key the page continues from and the
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Next(u64),
    Previous(u64),
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = match self {
            Self::Next(key) => format!("n:{key}"),
            Self::Previous(key) => format!("p:{key}"),
        };
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(value: &str) -> Result<Self, QueryError> {
        let raw = URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|_| QueryError::BadCursor)?;
        let raw = String::from_utf8(raw).map_err(|_| QueryError::BadCursor)?;
        let (direction, key) = raw.split_once(':').ok_or(QueryError::BadCursor)?;
        let key = key.parse::<u64>().map_err(|_| QueryError::BadCursor)?;
        match direction {
            "n" => Ok(Self::Next(key)),
            "p" => Ok(Self::Previous(key)),
            _ => Err(QueryError::BadCursor),
        }
    }

    fn anchor(&self) -> Anchor {
        match *self {
            Self::Next(key) => Anchor::Before(key),
            Self::Previous(key) => Anchor::After(key),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub filter: IndexFilter,
    pub cursor: Option<Cursor>,
    pub limit: Option<u32>,
    /// Display only; never used to locate rows.
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub rows: Vec<IndexRow>,
    pub has_next: bool,
    pub has_previous: bool,
    pub next: Option<Cursor>,
    pub previous: Option<Cursor>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

pub struct SearchService<S> {
    store: Arc<S>,
    default_limit: u32,
    max_limit: u32,
}

impl<S: EventStore> SearchService<S> {
    pub fn new(
        store: Arc<S>,
        default_limit: u32,
        max_limit: u32
    ) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            store,
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
        }
    }

    pub fn clamp_limit(
        &self,
        requested: Option<u32>
    ) -> u32 {
        requested.unwrap_or(self.default_limit).clamp(1, self.max_limit)
    }

    /// One page of index entries, newest first. The total is counted with a
    /// separate query and may drift from the page under concurrent writes.
    pub async fn search(
        &self,
        request: &SearchRequest
    ) -> Result<SearchPage, QueryError> {
        let limit = self.clamp_limit(request.limit);

        let (page, total) = tokio::join!(
            self.fetch_page(&request.filter, request.cursor, limit),
            self.store.count_index(&request.filter)
        );
        let (rows, has_next, has_previous) = page?;
        let total = total?;

        let page = match request.page {
            Some(page) if has_previous => page.max(2),
            _ if has_previous => 2,
            _ => 1,
        };

        Ok(SearchPage {
            next: has_next
                .then(|| rows.last().map(|row| Cursor::Next(row.key)))
                .flatten(),
            previous: has_previous
                .then(|| match (rows.first(), request.cursor) {
                    (Some(row), _) => Some(Cursor::Previous(row.key)),
                    // every older row is gone; step back to the rows the cursor came from
                    (None, Some(Cursor::Next(key))) => {
                        Some(Cursor::Previous(key.saturating_sub(1)))
                    }
                    (None, _) => None,
                })
                .flatten(),
            rows,
            has_next,
            has_previous,
            total,
            page,
            limit,
        })
    }

    async fn fetch_page(
        &self,
        filter: &IndexFilter,
        cursor: Option<Cursor>,
        limit: u32
    ) -> Result<(Vec<IndexRow>, bool, bool), StoreError> {
        let fetch = limit.saturating_add(1);

        match cursor {
            Some(Cursor::Previous(_)) => {
                let anchor = cursor.map(|cursor| cursor.anchor());
                let mut rows = self.store.fetch_index_page(filter, anchor, fetch).await?;
                if rows.is_empty() {
                    // nothing newer left, start over from the top
                    return self.first_page(filter, limit).await;
                }
                let has_previous = rows.len() > limit as usize;
                if has_previous {
                    rows.remove(0);
                }
                Ok((rows, true, has_previous))
            }
            Some(Cursor::Next(_)) => {
                let anchor = cursor.map(|cursor| cursor.anchor());
                let mut rows = self.store.fetch_index_page(filter, anchor, fetch).await?;
                let has_next = rows.len() > limit as usize;
                rows.truncate(limit as usize);
                Ok((rows, has_next, true))
            }
            None => self.first_page(filter, limit).await,
        }
    }

    async fn first_page(
        &self,
        filter: &IndexFilter,
        limit: u32
    ) -> Result<(Vec<IndexRow>, bool, bool), StoreError> {
        let mut rows = self
            .store
            .fetch_index_page(filter, None, limit.saturating_add(1))
            .await?;
        let has_next = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        Ok((rows, has_next, false))
    }
}
