mod counters;
mod database;
mod ingest;
mod logserver;
mod normalize;
mod rate;
mod remote;
mod retention;
mod search;
mod store;

pub use counters::{DayCounters, RedisCounters, TopDomain};
pub use database::Database;
pub use ingest::IngestSink;
pub use logserver::{bind_logserver, run_logserver};
pub use normalize::{is_queue_id, normalize_term, split_queue_id};
pub use rate::{LiveCounterSource, RateEstimator, SpeedBoard};
pub use remote::{
    QueueClient, QueueMember, QueuedMessage, RemoteError, SmtpLogLine, SuppressionEntry,
    ZoneSnapshot
};
pub use retention::run_retention_sweeper;
pub use search::{Cursor, ParsedQuery, QueryError, SearchPage, SearchRequest, SearchService, parse_query};
pub use store::{EventStore, IndexFilter, IndexRow, StoreError, StoredEvent, expiry_after};
