mod app;
mod config;
mod core;
mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::{
    Database, IngestSink, LiveCounterSource, QueueClient, RateEstimator, RedisCounters,
    SearchService, SpeedBoard, bind_logserver, run_logserver, run_retention_sweeper
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use zmta_helpers::logging::{self, LogSettings};
use zmta_helpers::shutdown;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    logging::init_logging(&LogSettings {
        target: "zmta_webadmin",
        level: &config.log.level,
        env_key: "ZMTA_LOG",
        service_name: "zmta-webadmin",
    });

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .context("failed to connect database")?,
    );
    db.ensure_schema().await.context("failed to prepare database schema")?;

    let queue = QueueClient::new(&config.api_server, config.api_timeout)?;
    let counters = Arc::new(
        RedisCounters::new(&config.redis_url, config.counter_prefix.as_deref())
            .context("invalid redis url")?,
    );
    let search = Arc::new(SearchService::new(
        db.clone(),
        config.page_size,
        config.max_page_size,
    ));

    let state = AppState {
        store: db,
        queue,
        counters,
        speeds: SpeedBoard::default(),
        search,
        shutdown: CancellationToken::new(),
    };

    info!(
        "webadmin starting: listen={}, api_server={}, retention_secs={}",
        config.listen,
        config.api_server,
        config.retention.as_secs()
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    let estimator = RateEstimator::new(
        LiveCounterSource::new(state.queue.clone(), state.counters.clone()),
        state.speeds.clone(),
    );
    tokio::spawn(estimator.run(config.poll_interval, state.shutdown.clone()));

    tokio::spawn(run_retention_sweeper(
        state.store.clone(),
        config.retention_sweep_interval(),
        state.shutdown.clone(),
    ));

    if config.logserver.enabled {
        let socket = bind_logserver(&config.logserver).await?;
        let sink = Arc::new(IngestSink::new(state.store.clone(), config.retention));
        tokio::spawn(run_logserver(socket, sink, state.shutdown.clone()));
    } else {
        info!("log server disabled");
    }

    http::run_http_server(&config.listen, state, config.max_post_size).await
}
