use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use zmta_proto::{ProtoError, decode_event};

use super::store::{EventStore, IndexEntry, StoreError, StoredEvent, expiry_after};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("undecodable payload: {0}")]
    Decode(ProtoError),
    #[error("event without id: {0}")]
    MissingId(String),
}

impl From<ProtoError> for IngestError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::MissingId { message } => Self::MissingId(message),
            other => Self::Decode(other),
        }
    }
}

/// What happened to the message-id index after a successful event write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWrite {
    NotApplicable,
    Written,
    Duplicate,
    Failed,
}

/// Result of one datagram. Only used for logging and tests; the sender never
/// learns about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Discarded,
    StoreFailed,
    Stored(IndexWrite),
}

/// Decodes delivery event datagrams and persists them with best-effort,
/// at-most-once semantics: nothing is retried and no error leaves `ingest`.
pub struct IngestSink<S> {
    store: Arc<S>,
    retention: Duration,
}

impl<S: EventStore> IngestSink<S> {
    pub fn new(
        store: Arc<S>,
        retention: Duration
    ) -> Self {
        Self { store, retention }
    }

    pub async fn ingest(
        &self,
        payload: &[u8],
        source: SocketAddr
    ) -> IngestOutcome {
        self.ingest_at(payload, source, OffsetDateTime::now_utc()).await
    }

    pub(crate) async fn ingest_at(
        &self,
        payload: &[u8],
        source: SocketAddr,
        received_at: OffsetDateTime
    ) -> IngestOutcome {
        let event = match decode_event(payload).map_err(IngestError::from) {
            Ok(event) => event,
            Err(IngestError::Decode(err)) => {
                info!(
                    "INVALIDMSG from={} encoded=\"{}\" error={}",
                    source,
                    BASE64.encode(payload),
                    err
                );
                return IngestOutcome::Discarded;
            }
            Err(IngestError::MissingId(message)) => {
                info!("INVALIDMSG from={source} message={message}");
                return IngestOutcome::Discarded;
            }
        };

        let t = truncate_to_millis(received_at);
        let Some(e) = expiry_after(t, self.retention) else {
            warn!(
                "LOGFAIL {} from={} size={} error=expiry out of range retention_secs={}",
                event.id,
                source,
                payload.len(),
                self.retention.as_secs()
            );
            return IngestOutcome::StoreFailed;
        };
        let index_entry = IndexEntry::derive(&event, t, e);
        let stored = StoredEvent::from_wire(event, t, e);

        if let Err(err) = self.store.insert_event(&stored).await {
            warn!(
                "LOGFAIL {} from={} size={} error={}",
                stored.id,
                source,
                payload.len(),
                err
            );
            return IngestOutcome::StoreFailed;
        }
        debug!(
            "LOGMSG {} from={} size={} action={}",
            stored.id,
            source,
            payload.len(),
            stored.action.as_deref().unwrap_or("-")
        );

        let Some(entry) = index_entry else {
            return IngestOutcome::Stored(IndexWrite::NotApplicable);
        };

        let index = match self.store.insert_index_entry(&entry).await {
            Ok(()) => IndexWrite::Written,
            Err(StoreError::Duplicate) => IndexWrite::Duplicate,
            Err(err) => {
                warn!(
                    "LOGFAIL {} from={} size={} index=mids error={}",
                    stored.id,
                    source,
                    payload.len(),
                    err
                );
                IndexWrite::Failed
            }
        };
        IngestOutcome::Stored(index)
    }
}

/// Timestamps are persisted with millisecond precision.
fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_millisecond(value.millisecond()).unwrap_or(value)
}
