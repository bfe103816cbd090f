use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::{PublisherConfig, RelayConfig};
use crate::enqueue::EnqueueService;
use crate::error::RelayError;
use crate::pool::{ShutdownToken, WorkerPool};
use crate::publisher::{BusPublisher, BusTransport, SimulatedBus};
use crate::store::postgres::PostgresOutboxStore;
use crate::store::OutboxStore;
use crate::telemetry;

/// Build the bus transport for the configured brokers, falling back to
/// simulation mode when no bus is reachable or compiled in.
pub fn build_transport(config: &PublisherConfig) -> Arc<dyn BusTransport> {
    if !config.is_bus_enabled() {
        info!("no brokers configured, publisher running in simulation mode");
        return Arc::new(SimulatedBus);
    }

    #[cfg(feature = "kafka")]
    match crate::kafka::KafkaTransport::new(config) {
        Ok(transport) => return Arc::new(transport),
        Err(err) => {
            warn!("failed to create kafka transport: {err}, falling back to simulation mode");
        }
    }

    #[cfg(not(feature = "kafka"))]
    warn!("built without kafka support, publisher running in simulation mode");

    Arc::new(SimulatedBus)
}

/// A fully wired relay: database pool, outbox store, publisher, worker
/// pool, metrics endpoint, and retention sweeper.
///
/// Owns every shared resource and passes it explicitly to the
/// subsystems; there are no hidden globals.
pub struct Relay {
    db: PgPool,
    pool: WorkerPool<PostgresOutboxStore, BusPublisher>,
    store: Arc<PostgresOutboxStore>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
    #[cfg(feature = "metrics")]
    metrics_server: Option<tokio::task::JoinHandle<()>>,
}

impl Relay {
    /// Validate the configuration, connect to the database, wire every
    /// subsystem, and start the pool.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        if config.database.url.is_empty() {
            return Err(RelayError::validation("database url is required"));
        }
        telemetry::init_metrics()
            .map_err(|err| RelayError::validation(format!("metrics init failed: {err}")))?;

        let db = PgPoolOptions::new()
            .max_connections(config.database.pool_connections(config.worker.pool_size))
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&config.database.url)
            .await
            .map_err(|err| RelayError::transient(format!("failed to connect to database: {err}")))?;
        info!("database connection pool established");

        let store = Arc::new(PostgresOutboxStore::new(
            db.clone(),
            config.worker.max_retries,
        ));

        let breaker = config
            .breaker
            .enabled
            .then(|| Arc::new(CircuitBreaker::new(&config.breaker)));
        if breaker.is_some() {
            info!(
                failure_threshold = config.breaker.failure_threshold,
                success_threshold = config.breaker.success_threshold,
                reset_timeout_ms = config.breaker.reset_timeout_ms,
                "circuit breaker enabled"
            );
        }

        let transport = build_transport(&config.publisher);
        let publisher = Arc::new(BusPublisher::new(
            config.publisher.clone(),
            transport,
            breaker,
        ));

        let pool = WorkerPool::new(config.worker.clone(), Arc::clone(&store), publisher);
        pool.start().await;

        let sweeper = config.worker.cleanup_retention().map(|retention| {
            let store = Arc::clone(&store);
            let interval = config.worker.cleanup_interval();
            let shutdown = pool.shutdown_token();
            tokio::spawn(async move {
                retention_loop(store, retention, interval, shutdown).await;
            })
        });

        #[cfg(feature = "metrics")]
        let metrics_server = config.metrics.enabled.then(|| {
            let metrics_config = config.metrics.clone();
            tokio::spawn(async move {
                if let Err(err) = crate::metrics::serve(metrics_config).await {
                    warn!("metrics endpoint failed: {err}");
                }
            })
        });

        Ok(Self {
            db,
            pool,
            store,
            sweeper,
            #[cfg(feature = "metrics")]
            metrics_server,
        })
    }

    /// The write-path service backed by the same connection pool.
    pub fn enqueue_service(&self) -> EnqueueService {
        EnqueueService::new(self.db.clone())
    }

    pub fn store(&self) -> &Arc<PostgresOutboxStore> {
        &self.store
    }

    /// Block until SIGINT/SIGTERM, then drain and stop everything.
    pub async fn run_until_shutdown(self) -> Result<(), RelayError> {
        wait_for_signal().await;
        info!("shutdown signal received");
        self.shutdown().await
    }

    /// Drain the worker pool, stop the background tasks, close the
    /// database pool.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        self.pool.shutdown().await;

        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        #[cfg(feature = "metrics")]
        if let Some(server) = self.metrics_server {
            server.abort();
        }

        self.db.close().await;
        info!("relay stopped");
        Ok(())
    }
}

async fn retention_loop(
    store: Arc<PostgresOutboxStore>,
    retention: std::time::Duration,
    interval: std::time::Duration,
    shutdown: ShutdownToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("retention sweeper shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = store.cleanup(retention).await {
                    warn!("retention sweep failed: {err}");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
