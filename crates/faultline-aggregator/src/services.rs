//! Wiring and lifecycle of the long-running loops.

use std::sync::Arc;

use faultline_aggregator::{
    store, AdmissionThrottle, AggregationRunner, AggregationWorker, AggregatorConfig, Ingestor,
    ProjectDirectory, ReportIntake,
};
use faultline_state::StateProvider;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Owns the spawned intake consumers and aggregation runners.
pub struct Services {
    runners: Vec<Arc<AggregationRunner>>,
    intakes: Vec<Arc<ReportIntake>>,
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Services {
    /// Connect backends and build every component.
    pub async fn build(config: &AggregatorConfig) -> anyhow::Result<Self> {
        let state = StateProvider::from_config(&config.state).await?;
        let kv = state.kv()?;
        let queue = state.queue()?;
        let locks = state.lock()?;

        let store = store::from_config(&config.store).await?;
        info!("error store ready");

        let throttle = AdmissionThrottle::new(
            kv.clone(),
            queue.clone(),
            config.queues.runs.clone(),
            &config.throttle,
        );

        let projects = ProjectDirectory::new(store.clone(), kv, config.projects.cache_ttl());

        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            projects,
            queue.clone(),
            config.queues.aggregation.clone(),
            throttle.clone(),
        ));

        let worker = Arc::new(AggregationWorker::new(
            store,
            queue.clone(),
            locks,
            throttle.clone(),
            config.queues.aggregation.clone(),
            config.worker.clone(),
        ));

        let runners = (0..config.runner.runners)
            .map(|id| {
                Arc::new(AggregationRunner::new(
                    id,
                    queue.clone(),
                    config.queues.runs.clone(),
                    throttle.clone(),
                    worker.clone(),
                    config.runner.clone(),
                ))
            })
            .collect();

        let intakes = (0..config.intake.consumers)
            .map(|id| {
                Arc::new(ReportIntake::new(
                    id,
                    queue.clone(),
                    config.queues.reports.clone(),
                    ingestor.clone(),
                    config.intake.clone(),
                ))
            })
            .collect();

        Ok(Self {
            runners,
            intakes,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Spawn every loop.
    pub fn start(&mut self) {
        for (id, runner) in self.runners.iter().enumerate() {
            let runner = runner.clone();
            let cancel = self.cancel.clone();
            let name = format!("runner-{id}");
            let handle = tokio::spawn(async move { runner.run(cancel).await });
            self.handles.push((name, handle));
        }

        for (id, intake) in self.intakes.iter().enumerate() {
            let intake = intake.clone();
            let cancel = self.cancel.clone();
            let name = format!("intake-{id}");
            let handle = tokio::spawn(async move { intake.run(cancel).await });
            self.handles.push((name, handle));
        }

        info!(tasks = self.handles.len(), "all services started");
    }

    /// Get the cancellation token for external shutdown triggers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for shutdown, then for every loop to finish its current item.
    pub async fn wait(&mut self) {
        self.cancel.cancelled().await;
        info!("shutdown requested, waiting for services");

        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(service = %name, error = %e, "service panicked");
            }
        }
    }
}
