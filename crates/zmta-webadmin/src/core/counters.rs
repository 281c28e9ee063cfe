use std::collections::HashMap;

use redis::aio::ConnectionManager;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::info;

use super::remote::RemoteError;

const TOP_DOMAINS: isize = 10;

/// Delivered and bounced totals of one zone for the current UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneCounter {
    pub delivered: u64,
    pub bounced: u64,
}

impl ZoneCounter {
    pub fn total(&self) -> u64 {
        self.delivered + self.bounced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopDomain {
    pub index: usize,
    pub domain: String,
    pub messages: u64,
    /// Percent of all delivered and bounced messages of the day.
    pub share: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayCounters {
    pub zones: HashMap<String, ZoneCounter>,
    pub top: Vec<TopDomain>,
}

/// Reads the day-scoped counters the delivery service keeps in Redis.
///
/// The connection is opened on first use so the admin console starts even
/// when Redis is down.
pub struct RedisCounters {
    client: redis::Client,
    prefix: String,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCounters {
    pub fn new(
        redis_url: &str,
        prefix: Option<&str>
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: key_prefix(prefix),
            connection: OnceCell::new(),
        })
    }

    pub async fn day_counters(
        &self,
        zones: &[String]
    ) -> Result<DayCounters, RemoteError> {
        let day = day_stamp(OffsetDateTime::now_utc().date());

        let mut pipe = redis::pipe();
        pipe.atomic();
        for zone in zones {
            pipe.get(counter_key(&self.prefix, "delivered", zone, &day));
            pipe.get(counter_key(&self.prefix, "bounced", zone, &day));
        }
        pipe.zrevrange_withscores(domains_key(&self.prefix, &day), 0, TOP_DOMAINS - 1);

        let mut connection = self.connection().await?;
        let values: Vec<redis::Value> = pipe.query_async(&mut connection).await?;

        let mut counters = DayCounters::default();
        let mut values = values.into_iter();
        for zone in zones {
            let delivered = counter_value(values.next());
            let bounced = counter_value(values.next());
            counters
                .zones
                .insert(zone.clone(), ZoneCounter { delivered, bounced });
        }

        let ranking = values
            .next()
            .and_then(|value| redis::from_redis_value::<Vec<String>>(&value).ok())
            .unwrap_or_default();
        let total = counters.zones.values().map(ZoneCounter::total).sum();
        counters.top = rank_domains(&ranking, total);

        Ok(counters)
    }

    async fn connection(&self) -> Result<ConnectionManager, RemoteError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("counter store connected");
                Ok::<_, RemoteError>(manager)
            })
            .await?;
        Ok(connection.clone())
    }
}

fn key_prefix(prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}_"),
        _ => String::new(),
    }
}

/// `YYYY/MM/DD` of the given UTC day.
pub fn day_stamp(date: Date) -> String {
    format!("{:04}/{:02}/{:02}", date.year(), u8::from(date.month()), date.day())
}

fn counter_key(
    prefix: &str,
    kind: &str,
    zone: &str,
    day: &str
) -> String {
    format!("{prefix}{kind}_{zone}^{day}")
}

fn domains_key(
    prefix: &str,
    day: &str
) -> String {
    format!("{prefix}domains^{day}")
}

fn counter_value(value: Option<redis::Value>) -> u64 {
    value
        .and_then(|value| redis::from_redis_value::<Option<u64>>(&value).ok())
        .flatten()
        .unwrap_or_default()
}

/// Turns a flat `member, score, member, score` ranking into numbered entries
/// with their share of `total`.
fn rank_domains(
    ranking: &[String],
    total: u64
) -> Vec<TopDomain> {
    ranking
        .chunks_exact(2)
        .enumerate()
        .map(|(position, pair)| {
            let messages = pair[1].parse::<f64>().map(|score| score as u64).unwrap_or_default();
            TopDomain {
                index: position + 1,
                domain: pair[0].clone(),
                messages,
                share: if total == 0 {
                    0.0
                } else {
                    messages as f64 / total as f64 * 100.0
                },
            }
        })
        .collect()
}
