use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{QueueClient, RedisCounters, SearchService, SpeedBoard};

pub struct AppState<S> {
    pub store: Arc<S>,
    pub queue: QueueClient,
    pub counters: Arc<RedisCounters>,
    pub speeds: SpeedBoard,
    pub search: Arc<SearchService<S>>,
    pub shutdown: CancellationToken,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            speeds: self.speeds.clone(),
            search: self.search.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
