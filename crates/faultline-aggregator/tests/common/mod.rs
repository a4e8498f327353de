//! Common test utilities for aggregation integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use faultline_aggregator::{
    AdmissionThrottle, AggregateError, AggregateId, AggregationRunner, AggregationTask,
    AggregationWorker, AggregatorConfig, ErrorQueries, ErrorReport, IngestOutcome, Ingestor,
    ProjectDirectory, ReportIntake, RunSignal,
};
use faultline_state::{LockBackend, LockGuard, MemoryKv, MemoryLockProvider, MemoryQueue};

use fixtures::{FailingStore, FlakyQueue};

/// Complete aggregation setup over memory backends, with failure switches
/// on the store and the queue.
pub struct TestHarness {
    pub config: AggregatorConfig,
    pub store: Arc<FailingStore>,
    pub kv: MemoryKv,
    pub queue: Arc<FlakyQueue>,
    pub locks: MemoryLockProvider,
    pub throttle: AdmissionThrottle,
    pub ingestor: Arc<Ingestor>,
    pub worker: Arc<AggregationWorker>,
    pub queries: ErrorQueries,
}

impl TestHarness {
    /// Creates a harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(AggregatorConfig::default())
    }

    /// Creates a harness with custom configuration.
    pub fn with_config(config: AggregatorConfig) -> Self {
        let store = Arc::new(FailingStore::new());
        let kv = MemoryKv::new();
        let queue = Arc::new(FlakyQueue::new(MemoryQueue::new()));
        let locks = MemoryLockProvider::new();

        let throttle = AdmissionThrottle::new(
            Arc::new(kv.clone()),
            queue.clone(),
            config.queues.runs.clone(),
            &config.throttle,
        );

        let projects = ProjectDirectory::new(
            store.clone(),
            Arc::new(kv.clone()),
            config.projects.cache_ttl(),
        );

        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            projects,
            queue.clone(),
            config.queues.aggregation.clone(),
            throttle.clone(),
        ));

        let worker = Arc::new(AggregationWorker::new(
            store.clone(),
            queue.clone(),
            Arc::new(locks.clone()),
            throttle.clone(),
            config.queues.aggregation.clone(),
            config.worker.clone(),
        ));

        let queries = ErrorQueries::new(store.clone());

        Self {
            config,
            store,
            kv,
            queue,
            locks,
            throttle,
            ingestor,
            worker,
            queries,
        }
    }

    pub async fn ingest(&self, report: ErrorReport) -> IngestOutcome {
        self.ingestor.ingest(&report).await.unwrap()
    }

    pub async fn aggregate(&self, id: AggregateId) -> AggregateError {
        self.queries
            .error_detail(&id, &Default::default())
            .await
            .unwrap()
            .expect("aggregate not found")
            .aggregate
    }

    /// Every task on the aggregation queue, leased or not.
    pub async fn aggregation_tasks(&self) -> Vec<AggregationTask> {
        self.queue
            .inner
            .payloads(&self.config.queues.aggregation)
            .await
            .iter()
            .map(|p| AggregationTask::decode(p).unwrap())
            .collect()
    }

    /// Run ids of every pending run signal.
    pub async fn run_signals(&self) -> Vec<u64> {
        self.queue
            .inner
            .payloads(&self.config.queues.runs)
            .await
            .iter()
            .map(|p| RunSignal::decode(p).unwrap().run_id)
            .collect()
    }

    /// Takes the aggregate's lock as another worker would.
    pub async fn hold_lock(&self, id: AggregateId) -> LockGuard {
        self.locks
            .try_acquire(&format!("aggregate:{id}"), std::time::Duration::from_secs(600))
            .await
            .unwrap()
            .expect("lock already held")
    }

    pub fn intake(&self) -> ReportIntake {
        ReportIntake::new(
            0,
            self.queue.clone(),
            self.config.queues.reports.clone(),
            self.ingestor.clone(),
            self.config.intake.clone(),
        )
    }

    pub fn runner(&self) -> AggregationRunner {
        AggregationRunner::new(
            0,
            self.queue.clone(),
            self.config.queues.runs.clone(),
            self.throttle.clone(),
            self.worker.clone(),
            self.config.runner.clone(),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
