use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::types::Json;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::normalize::escape_like;
use super::store::{
    Anchor, EventStore, IndexEntry, IndexFilter, IndexRow, PurgeStats,
    StoreError, StoredEvent,
};

const SCHEMA: &[(&str, &str)] = &[
    (
        "messages",
        "CREATE TABLE IF NOT EXISTS messages (
            pk BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
            id VARCHAR(255) NOT NULL,
            seq VARCHAR(255) NULL,
            action VARCHAR(255) NULL,
            fields JSON NOT NULL,
            t TIMESTAMP(3) NOT NULL,
            e TIMESTAMP(3) NOT NULL,
            KEY messages_id_t (id, t),
            KEY messages_e (e)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
    ),
    (
        "mids",
        "CREATE TABLE IF NOT EXISTS mids (
            pk BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
            natural_key CHAR(64) NOT NULL,
            mid VARCHAR(998) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
            mail_from VARCHAR(998) NOT NULL,
            recipients JSON NOT NULL,
            id VARCHAR(255) NOT NULL,
            t TIMESTAMP(3) NOT NULL,
            e TIMESTAMP(3) NOT NULL,
            UNIQUE KEY mids_natural_key (natural_key),
            KEY mids_mid (mid(191)),
            KEY mids_from (mail_from(191)),
            KEY mids_id (id),
            KEY mids_t (t),
            KEY mids_e (e)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
    ),
];

#[derive(Debug)]
pub struct Database {
    pool: MySqlPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to open mysql pool")?;

        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database ping failed")?;

        Ok(Self { pool })
    }

    /// Creates the `messages` and `mids` tables with their indexes when they
    /// do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for (table, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to create table {table}"))?;
            debug!("schema ensured: table={table}");
        }
        info!("database schema ready: tables={}", SCHEMA.len());
        Ok(())
    }
}

impl EventStore for Database {
    async fn insert_event(
        &self,
        event: &StoredEvent
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, seq, action, fields, t, e) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.seq.as_deref())
        .bind(event.action.as_deref())
        .bind(Json(&event.fields))
        .bind(event.t)
        .bind(event.e)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_index_entry(
        &self,
        entry: &IndexEntry
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mids (natural_key, mid, mail_from, recipients, id, t, e) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.natural_key())
        .bind(&entry.mid)
        .bind(&entry.from)
        .bind(Json(&entry.to))
        .bind(&entry.id)
        .bind(entry.t)
        .bind(entry.e)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for(
        &self,
        id: &str
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, seq, action, fields, t, e FROM messages WHERE id = ? ORDER BY t ASC, pk ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_event_row).collect()
    }

    async fn fetch_index_page(
        &self,
        filter: &IndexFilter,
        anchor: Option<Anchor>,
        limit: u32
    ) -> Result<Vec<IndexRow>, StoreError> {
        let rows = index_page_query(filter, anchor, limit)
            .build()
            .fetch_all(&self.pool)
            .await?;
        let mut page = rows
            .iter()
            .map(decode_index_row)
            .collect::<Result<Vec<_>, _>>()?;

        if matches!(anchor, Some(Anchor::After(_))) {
            page.reverse();
        }
        Ok(page)
    }

    async fn count_index(
        &self,
        filter: &IndexFilter
    ) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM mids");
        push_filter(&mut query, filter);

        let count = query.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn purge_expired(
        &self,
        now: OffsetDateTime
    ) -> Result<PurgeStats, StoreError> {
        let messages = sqlx::query("DELETE FROM messages WHERE e < ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let mids = sqlx::query("DELETE FROM mids WHERE e < ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PurgeStats { messages, mids })
    }
}

/// Keyset page over `mids`. Rows after an anchor come back oldest first and
/// are reversed by the caller.
fn index_page_query(
    filter: &IndexFilter,
    anchor: Option<Anchor>,
    limit: u32
) -> QueryBuilder<'static, MySql> {
    let mut query = QueryBuilder::<MySql>::new(
        "SELECT pk, mid, mail_from, recipients, id, t, e FROM mids",
    );
    push_filter(&mut query, filter);

    match anchor {
        Some(Anchor::Before(key)) => {
            query.push(" AND pk < ").push_bind(key);
            query.push(" ORDER BY pk DESC");
        }
        Some(Anchor::After(key)) => {
            query.push(" AND pk > ").push_bind(key);
            query.push(" ORDER BY pk ASC");
        }
        None => {
            query.push(" ORDER BY pk DESC");
        }
    }
    query.push(" LIMIT ").push_bind(limit);
    query
}

fn push_filter(
    query: &mut QueryBuilder<'_, MySql>,
    filter: &IndexFilter
) {
    query.push(" WHERE 1 = 1");

    if let Some(from) = &filter.from {
        query.push(" AND mail_from = ").push_bind(from.clone());
    }
    if let Some(to) = &filter.to {
        query
            .push(" AND JSON_CONTAINS(recipients, JSON_QUOTE(")
            .push_bind(to.clone())
            .push("))");
    }
    if let Some(id) = &filter.id {
        query.push(" AND id = ").push_bind(id.clone());
    }
    if let Some(mid) = &filter.mid {
        query.push(" AND mid = ").push_bind(mid.clone());
    }
    if let Some(start) = filter.start {
        query.push(" AND t >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        query.push(" AND t <= ").push_bind(end);
    }
    if let Some(text) = &filter.text {
        // `mid` uses a binary collation, so LIKE is case-sensitive here.
        query
            .push(" AND mid LIKE ")
            .push_bind(contains_pattern(text));
    }
}

fn contains_pattern(text: &str) -> String {
    format!("%{}%", escape_like(text))
}

fn decode_event_row(row: &MySqlRow) -> Result<StoredEvent, StoreError> {
    let Json(fields): Json<Map<String, Value>> = row.try_get("fields")?;
    Ok(StoredEvent {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        action: row.try_get("action")?,
        fields,
        t: row.try_get("t")?,
        e: row.try_get("e")?,
    })
}

fn decode_index_row(row: &MySqlRow) -> Result<IndexRow, StoreError> {
    let Json(to): Json<Vec<String>> = row.try_get("recipients")?;
    Ok(IndexRow {
        key: row.try_get("pk")?,
        entry: IndexEntry {
            mid: row.try_get("mid")?,
            from: row.try_get("mail_from")?,
            to,
            id: row.try_get("id")?,
            t: row.try_get("t")?,
            e: row.try_get("e")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use zmta_proto::MAX_ENVELOPE_CHARS;

    use super::*;

    #[test]
    fn every_filter_term_is_a_bound_condition() {
        let filter = IndexFilter {
            from: Some("alice@example.com".to_string()),
            to: Some("bob@example.com".to_string()),
            id: Some("ab12cd34ef56gh78ij".to_string()),
            mid: Some("m1@example.com".to_string()),
            start: Some(datetime!(2024-01-01 00:00:00 UTC)),
            end: Some(datetime!(2024-01-02 00:00:00 UTC)),
            text: Some("50%_off".to_string()),
        };

        let mut query = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM mids");
        push_filter(&mut query, &filter);
        assert_eq!(
            query.sql(),
            "SELECT COUNT(*) FROM mids WHERE 1 = 1 \
             AND mail_from = ? \
             AND JSON_CONTAINS(recipients, JSON_QUOTE(?)) \
             AND id = ? \
             AND mid = ? \
             AND t >= ? \
             AND t <= ? \
             AND mid LIKE ?"
        );

        let mut query = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM mids");
        push_filter(&mut query, &IndexFilter::default());
        assert_eq!(query.sql(), "SELECT COUNT(*) FROM mids WHERE 1 = 1");

        assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn page_anchor_picks_direction() {
        let filter = IndexFilter {
            from: Some("alice@example.com".to_string()),
            ..Default::default()
        };
        let select = "SELECT pk, mid, mail_from, recipients, id, t, e FROM mids WHERE 1 = 1 AND mail_from = ?";

        assert_eq!(
            index_page_query(&filter, None, 11).sql(),
            format!("{select} ORDER BY pk DESC LIMIT ?")
        );
        assert_eq!(
            index_page_query(&filter, Some(Anchor::Before(40)), 11).sql(),
            format!("{select} AND pk < ? ORDER BY pk DESC LIMIT ?")
        );
        assert_eq!(
            index_page_query(&filter, Some(Anchor::After(40)), 11).sql(),
            format!("{select} AND pk > ? ORDER BY pk ASC LIMIT ?")
        );
    }

    #[test]
    fn envelope_columns_hold_the_longest_accepted_value() {
        let (_, messages) = SCHEMA[0];
        for column in ["id", "seq", "action"] {
            assert!(
                messages.contains(&format!("{column} VARCHAR({MAX_ENVELOPE_CHARS})")),
                "messages.{column}"
            );
        }

        let (_, mids) = SCHEMA[1];
        assert!(mids.contains(&format!("id VARCHAR({MAX_ENVELOPE_CHARS})")));
        // RFC 5322 line limit
        assert!(mids.contains("mid VARCHAR(998)"));
        assert!(mids.contains("mail_from VARCHAR(998)"));
    }
}
