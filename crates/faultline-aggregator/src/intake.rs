//! Consumer for the raw report queue.

use std::sync::Arc;

use faultline_state::{Message, MessageId, QueueBackend};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntakeConfig;
use crate::error::Result;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::report::ErrorReport;

/// What the intake did with one queued report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeDisposition {
    Ingested(IngestOutcome),
    /// The report was malformed or invalid and has been removed.
    Dropped,
    /// Ingestion failed; the report will be redelivered.
    Requeued,
}

/// Feeds queued reports to the [`Ingestor`].
pub struct ReportIntake {
    id: usize,
    queue: Arc<dyn QueueBackend>,
    report_queue: String,
    ingestor: Arc<Ingestor>,
    config: IntakeConfig,
}

impl ReportIntake {
    #[must_use]
    pub fn new(
        id: usize,
        queue: Arc<dyn QueueBackend>,
        report_queue: impl Into<String>,
        ingestor: Arc<Ingestor>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            id,
            queue,
            report_queue: report_queue.into(),
            ingestor,
            config,
        }
    }

    /// Enqueue a raw JSON report for ingestion.
    pub async fn submit(&self, payload: &[u8]) -> Result<MessageId> {
        Ok(self.queue.publish(&self.report_queue, payload).await?)
    }

    /// Run until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(consumer_id = self.id, "report intake started");

        loop {
            let received = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!(consumer_id = self.id, "report intake shutting down");
                    break;
                }

                result = self.queue.receive(&self.report_queue, self.config.visibility_timeout()) => result,
            };

            match received {
                Ok(Some(message)) => {
                    self.handle(&message).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(consumer_id = self.id, error = %e, "failed to receive report");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!(consumer_id = self.id, "report intake stopped");
    }

    /// Receive and handle one report, if any is waiting.
    pub async fn process_next(&self) -> Result<Option<IntakeDisposition>> {
        let Some(message) = self
            .queue
            .receive(&self.report_queue, self.config.visibility_timeout())
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(self.handle(&message).await))
    }

    async fn handle(&self, message: &Message) -> IntakeDisposition {
        let outcome = match ErrorReport::from_slice(&message.payload) {
            Ok(report) => self.ingestor.ingest(&report).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                self.settle(&message.id, true).await;
                IntakeDisposition::Ingested(outcome)
            }
            Err(e) if e.is_permanent() => {
                warn!(consumer_id = self.id, message_id = %message.id, error = %e, "dropping invalid report");
                self.settle(&message.id, true).await;
                IntakeDisposition::Dropped
            }
            Err(e) => {
                warn!(
                    consumer_id = self.id,
                    message_id = %message.id,
                    attempt = message.attempt,
                    error = %e,
                    "ingestion failed, requeueing report"
                );
                self.settle(&message.id, false).await;
                IntakeDisposition::Requeued
            }
        }
    }

    async fn settle(&self, id: &MessageId, done: bool) {
        let result = if done {
            self.queue.ack(&self.report_queue, id).await
        } else {
            self.queue.nack(&self.report_queue, id).await
        };

        match result {
            Ok(()) => debug!(consumer_id = self.id, message_id = %id, done, "report settled"),
            Err(e) => warn!(consumer_id = self.id, message_id = %id, error = %e, "failed to settle report"),
        }
    }
}

impl std::fmt::Debug for ReportIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportIntake")
            .field("id", &self.id)
            .field("report_queue", &self.report_queue)
            .finish_non_exhaustive()
    }
}
