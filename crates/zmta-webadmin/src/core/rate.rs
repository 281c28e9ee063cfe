use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::counters::{RedisCounters, ZoneCounter};
use super::remote::{QueueClient, RemoteError};

/// Where the estimator reads zone names and day counters from.
pub trait CounterSource: Send + Sync + 'static {
    fn zone_names(&self) -> impl Future<Output = Result<Vec<String>, RemoteError>> + Send;

    fn zone_counters(
        &self,
        zones: &[String]
    ) -> impl Future<Output = Result<HashMap<String, ZoneCounter>, RemoteError>> + Send;
}

/// Zone names from the queue service, counters from Redis.
pub struct LiveCounterSource {
    queue: QueueClient,
    counters: Arc<RedisCounters>,
}

impl LiveCounterSource {
    pub fn new(
        queue: QueueClient,
        counters: Arc<RedisCounters>
    ) -> Self {
        Self { queue, counters }
    }
}

impl CounterSource for LiveCounterSource {
    async fn zone_names(&self) -> Result<Vec<String>, RemoteError> {
        let zones = self.queue.list_zones(false).await?;
        Ok(zones.into_iter().map(|zone| zone.name).collect())
    }

    async fn zone_counters(
        &self,
        zones: &[String]
    ) -> Result<HashMap<String, ZoneCounter>, RemoteError> {
        Ok(self.counters.day_counters(zones).await?.zones)
    }
}

/// Latest published messages-per-second value of every zone. Readers never
/// wait for a tick.
#[derive(Debug, Clone, Default)]
pub struct SpeedBoard {
    speeds: Arc<RwLock<HashMap<String, f64>>>,
}

impl SpeedBoard {
    #[cfg(test)]
    pub fn get(
        &self,
        zone: &str
    ) -> Option<f64> {
        let speeds = self.speeds.read().unwrap_or_else(PoisonError::into_inner);
        speeds.get(zone).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.speeds.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(
        &self,
        values: HashMap<String, f64>
    ) {
        let mut speeds = self.speeds.write().unwrap_or_else(PoisonError::into_inner);
        speeds.extend(values);
    }
}

#[derive(Debug)]
struct Sample {
    at: Instant,
    counters: HashMap<String, ZoneCounter>,
}

/// Estimator state owned by the scheduling loop and handed to each tick.
#[derive(Debug, Default)]
pub struct RateState {
    zones: Option<Vec<String>>,
    previous: Option<Sample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Zone list fetched and cached; the next tick should follow at once.
    ZonesCached(usize),
    /// First counter sample taken; nothing to compare against yet.
    Primed,
    Published(usize),
}

pub struct RateEstimator<C> {
    source: C,
    board: SpeedBoard,
}

impl<C: CounterSource> RateEstimator<C> {
    pub fn new(
        source: C,
        board: SpeedBoard
    ) -> Self {
        Self { source, board }
    }

    /// Runs one polling step. On error `state` is left untouched so the
    /// published speeds stay as they were.
    pub async fn tick(
        &self,
        state: &mut RateState,
        now: Instant
    ) -> Result<TickOutcome, RemoteError> {
        let Some(zones) = &state.zones else {
            let zones = self.source.zone_names().await?;
            let count = zones.len();
            state.zones = Some(zones);
            return Ok(TickOutcome::ZonesCached(count));
        };

        let counters = self.source.zone_counters(zones).await?;
        let current = Sample { at: now, counters };

        let outcome = match state.previous.take() {
            Some(previous) if now > previous.at => {
                let speeds = compute_speeds(&previous, &current);
                let count = speeds.len();
                self.board.publish(speeds);
                TickOutcome::Published(count)
            }
            _ => TickOutcome::Primed,
        };
        state.previous = Some(current);
        Ok(outcome)
    }

    /// Polls every `interval` until `shutdown` is cancelled. The next tick is
    /// only scheduled after the previous one finished.
    pub async fn run(
        self,
        interval: Duration,
        shutdown: CancellationToken
    ) {
        let mut state = RateState::default();
        let mut delay = Duration::from_millis(100);

        info!("rate estimator started: interval={}", humantime::format_duration(interval));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("rate estimator stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.tick(&mut state, Instant::now()).await {
                Ok(TickOutcome::ZonesCached(count)) => {
                    debug!("rate estimator zones cached: zones={count}");
                    Duration::ZERO
                }
                Ok(TickOutcome::Primed) => interval,
                Ok(TickOutcome::Published(count)) => {
                    debug!("zone speeds published: zones={count}");
                    interval
                }
                Err(err) => {
                    warn!("rate estimator tick failed: error={err}");
                    interval
                }
            };
        }
    }
}

/// Messages per second between two samples. A counter that went down (the day
/// key rolled over) reads as zero rather than a negative rate.
fn compute_speeds(
    previous: &Sample,
    current: &Sample
) -> HashMap<String, f64> {
    let elapsed = current.at.duration_since(previous.at).as_secs_f64();

    current
        .counters
        .iter()
        .map(|(zone, counter)| {
            let before = previous.counters.get(zone).map(ZoneCounter::total).unwrap_or_default();
            let delta = counter.total().saturating_sub(before);
            (zone.clone(), delta as f64 / elapsed)
        })
        .collect()
}
