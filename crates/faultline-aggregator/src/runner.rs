//! Long-running aggregation runners.

use std::sync::Arc;

use faultline_state::{Message, QueueBackend};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::Result;
use crate::throttle::{AdmissionThrottle, RunSignal};
use crate::worker::{AggregationWorker, BatchReport};

/// What a runner did with one run signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    /// The run was admitted and executed.
    Executed(BatchReport),
    /// A later run supersedes this one.
    Skipped,
    /// The run was admitted but could not lease any work.
    Failed,
    /// The signal could not be decoded.
    Discarded,
}

/// Consumes run signals and executes admitted aggregation runs.
pub struct AggregationRunner {
    id: usize,
    queue: Arc<dyn QueueBackend>,
    run_queue: String,
    throttle: AdmissionThrottle,
    worker: Arc<AggregationWorker>,
    config: RunnerConfig,
}

impl AggregationRunner {
    #[must_use]
    pub fn new(
        id: usize,
        queue: Arc<dyn QueueBackend>,
        run_queue: impl Into<String>,
        throttle: AdmissionThrottle,
        worker: Arc<AggregationWorker>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            run_queue: run_queue.into(),
            throttle,
            worker,
            config,
        }
    }

    /// Run until the cancellation token is triggered.
    ///
    /// Besides consuming signals, each runner periodically schedules a run
    /// of its own so tasks whose signal was lost are still processed.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(runner_id = self.id, "aggregation runner started");

        let period = self.config.sweep_interval();
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let received = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!(runner_id = self.id, "aggregation runner shutting down");
                    break;
                }

                _ = sweep.tick() => {
                    match self.throttle.schedule().await {
                        Ok(run_id) => debug!(runner_id = self.id, run_id, "sweep scheduled run"),
                        Err(e) => warn!(runner_id = self.id, error = %e, "sweep failed to schedule run"),
                    }
                    continue;
                }

                result = self.queue.receive(&self.run_queue, self.worker.lease_ttl()) => result,
            };

            match received {
                Ok(Some(message)) => {
                    self.finish(&message).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(runner_id = self.id, error = %e, "failed to receive run signal");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!(runner_id = self.id, "aggregation runner stopped");
    }

    /// Receive and handle one run signal, if any is waiting.
    pub async fn process_next(&self) -> Result<Option<RunDisposition>> {
        let Some(message) = self
            .queue
            .receive(&self.run_queue, self.worker.lease_ttl())
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(self.finish(&message).await))
    }

    async fn finish(&self, message: &Message) -> RunDisposition {
        let disposition = self.handle(message).await;

        if let Err(e) = self.queue.ack(&self.run_queue, &message.id).await {
            warn!(runner_id = self.id, message_id = %message.id, error = %e, "failed to ack run signal");
        }

        disposition
    }

    async fn handle(&self, message: &Message) -> RunDisposition {
        let signal = match RunSignal::decode(&message.payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(runner_id = self.id, message_id = %message.id, error = %e, "discarding malformed run signal");
                return RunDisposition::Discarded;
            }
        };

        if !self.throttle.admit(signal.run_id).await {
            debug!(runner_id = self.id, run_id = signal.run_id, "run superseded, skipping");
            return RunDisposition::Skipped;
        }

        match self.worker.run_batch().await {
            Ok(report) => RunDisposition::Executed(report),
            Err(e) => {
                warn!(runner_id = self.id, run_id = signal.run_id, error = %e, "aggregation run failed");
                RunDisposition::Failed
            }
        }
    }
}

impl std::fmt::Debug for AggregationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationRunner")
            .field("id", &self.id)
            .field("run_queue", &self.run_queue)
            .finish_non_exhaustive()
    }
}
