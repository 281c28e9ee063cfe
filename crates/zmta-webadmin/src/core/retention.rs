use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{EventStore, PurgeStats, StoreError};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Deletes expired delivery events and index entries.
pub async fn sweep_expired<S: EventStore>(
    store: &S,
    now: OffsetDateTime
) -> Result<PurgeStats, StoreError> {
    let stats = store.purge_expired(now).await?;
    if stats.messages > 0 || stats.mids > 0 {
        info!(
            "retention sweep done: messages={}, mids={}",
            stats.messages, stats.mids
        );
    } else {
        debug!("retention sweep done: nothing expired");
    }
    Ok(stats)
}

/// Periodic retention loop; failures are logged and retried on the next tick.
pub async fn run_retention_sweeper<S: EventStore>(
    store: Arc<S>,
    every: Duration,
    shutdown: CancellationToken
) {
    let every = every.max(MIN_SWEEP_INTERVAL);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "retention sweeper started: every={}",
        humantime::format_duration(every)
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep_expired(store.as_ref(), OffsetDateTime::now_utc()).await {
                    warn!("retention sweep failed: error={err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use zmta_proto::{Action, WireEvent};

    use super::*;
    use crate::core::store::memory::MemoryStore;
    use crate::core::store::{IndexEntry, StoredEvent};

    #[tokio::test]
    async fn only_expired_rows_are_removed() {
        let store = MemoryStore::default();
        let t = datetime!(2024-01-01 00:00:00 UTC);
        for (id, e) in [
            ("old", datetime!(2024-01-02 00:00:00 UTC)),
            ("new", datetime!(2024-01-09 00:00:00 UTC)),
        ] {
            let event = WireEvent::new(id)
                .with_action(Action::Queued)
                .with_field("message-id", format!("<{id}@x>"));
            let entry = IndexEntry::derive(&event, t, e).unwrap();
            store.insert_event(&StoredEvent::from_wire(event, t, e)).await.unwrap();
            store.insert_index_entry(&entry).await.unwrap();
        }

        let stats = sweep_expired(&store, datetime!(2024-01-05 00:00:00 UTC))
            .await
            .unwrap();
        assert_eq!(stats, PurgeStats { messages: 1, mids: 1 });
        assert_eq!(store.events()[0].id, "new");
        assert_eq!(store.index_rows()[0].entry.id, "new");
    }

    #[tokio::test]
    async fn zero_interval_still_sweeps_and_stops() {
        let store = Arc::new(MemoryStore::default());
        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(run_retention_sweeper(
            store,
            Duration::ZERO,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        sweeper.await.expect("sweeper should stop without panicking");
    }
}
