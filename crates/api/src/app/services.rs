use std::sync::Arc;

use anyhow::Context;

use complyflow_analysis::{InMemoryInputLocator, InputLocator, Pipeline};
use complyflow_auth::{EntitlementGate, Hs256JwtValidator, InMemoryEntitlements, JwtValidator};
use complyflow_infra::broadcast::{ProgressBus, ProgressHub};
use complyflow_infra::config::JobConfig;
use complyflow_infra::entitlements::{self, PostgresEntitlements};
use complyflow_infra::jobs::{
    AnalysisWorker, InMemoryJobRecordStore, InMemoryTaskQueue, JobRecordStore, PostgresJobRecordStore,
    PostgresTaskQueue, Producer, TaskQueue, WorkerPool, postgres::ensure_schema,
};

use crate::config::ServerConfig;
use crate::realtime::RealtimeGateway;

/// Shared storage and transport, chosen at startup.
#[derive(Clone)]
pub struct Backends {
    pub records: Arc<dyn JobRecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub bus: ProgressBus,
    pub entitlements: Arc<dyn EntitlementGate>,
}

impl Backends {
    /// Single-process mode: everything lives in memory and every tenant is
    /// entitled.
    pub fn in_memory() -> Self {
        Self {
            records: Arc::new(InMemoryJobRecordStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
            bus: ProgressBus::in_process(),
            entitlements: Arc::new(InMemoryEntitlements::permissive()),
        }
    }

    /// Postgres (records, queue and subscriptions) when `DATABASE_URL` is
    /// set, Redis pub/sub when `REDIS_URL` is set; in-memory otherwise.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let mut backends = Self::in_memory();

        if let Some(url) = &config.database_url {
            let pool = sqlx::PgPool::connect(url).await.context("connect to postgres")?;
            ensure_schema(&pool).await.context("create job tables")?;
            entitlements::ensure_schema(&pool)
                .await
                .context("create subscription table")?;
            backends.records = Arc::new(PostgresJobRecordStore::new(pool.clone()));
            backends.queue = Arc::new(PostgresTaskQueue::new(pool.clone()));
            backends.entitlements = Arc::new(PostgresEntitlements::new(pool));
            tracing::info!("job records, task queue and entitlements backed by postgres");
        } else {
            tracing::warn!("DATABASE_URL not set; job state is in-memory and every tenant is entitled");
        }

        backends.bus = Self::progress_bus(config.redis_url.as_deref())?;
        tracing::info!(bus = backends.bus.kind(), "progress bus selected");

        Ok(backends)
    }

    #[cfg(feature = "redis")]
    fn progress_bus(redis_url: Option<&str>) -> anyhow::Result<ProgressBus> {
        match redis_url {
            Some(url) => ProgressBus::redis(url).context("connect to redis"),
            None => Ok(ProgressBus::in_process()),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn progress_bus(redis_url: Option<&str>) -> anyhow::Result<ProgressBus> {
        if redis_url.is_some() {
            tracing::warn!("REDIS_URL set but built without the `redis` feature; progress stays in-process");
        }
        Ok(ProgressBus::in_process())
    }
}

/// Everything the HTTP layer and the local worker pool share.
#[derive(Clone)]
pub struct AppServices {
    pub records: Arc<dyn JobRecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub bus: ProgressBus,
    pub hub: ProgressHub,
    pub producer: Producer,
    pub gateway: RealtimeGateway,
    pub jwt: Arc<dyn JwtValidator>,
    pub jobs: JobConfig,
    pub instance_id: String,
}

impl AppServices {
    /// Wire services and start routing bus events into this instance's hub.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        backends: Backends,
        jwt: Arc<dyn JwtValidator>,
        inputs: Arc<dyn InputLocator>,
        jobs: JobConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        let Backends {
            records,
            queue,
            bus,
            entitlements,
        } = backends;

        let hub = ProgressHub::new();
        // Detached: the pump ends when the bus closes.
        let _ = hub.attach(&bus);

        let producer = Producer::new(
            records.clone(),
            queue.clone(),
            inputs,
            entitlements,
            jobs.max_attempts,
        );
        let gateway = RealtimeGateway::new(jwt.clone(), records.clone(), hub.clone());

        Self {
            records,
            queue,
            bus,
            hub,
            producer,
            gateway,
            jwt,
            jobs,
            instance_id: instance_id.into(),
        }
    }

    /// In-memory services with permissive entitlements and an input locator
    /// that resolves any reference. Used for local runs and tests.
    pub fn in_memory(jwt_secret: &str, jobs: JobConfig) -> Self {
        Self::with_backends(Backends::in_memory(), jwt_secret, jobs)
    }

    /// Like [`AppServices::in_memory`] over caller-chosen backends.
    pub fn with_backends(backends: Backends, jwt_secret: &str, jobs: JobConfig) -> Self {
        Self::new(
            backends,
            Arc::new(Hs256JwtValidator::new(jwt_secret)),
            Arc::new(InMemoryInputLocator::accept_any()),
            jobs,
            "local",
        )
    }

    /// Start `jobs.worker_concurrency` workers on this instance.
    pub fn spawn_workers(&self, pipeline: Pipeline) -> WorkerPool {
        let worker = AnalysisWorker::new(
            self.records.clone(),
            self.queue.clone(),
            self.bus.clone(),
            Arc::new(pipeline),
            self.jobs.worker_config(format!("{}-worker", self.instance_id)),
        );
        worker.spawn_pool(self.jobs.worker_concurrency)
    }
}
