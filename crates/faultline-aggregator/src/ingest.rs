//! The ingestion decision: create a new aggregate or defer a merge.

use std::collections::BTreeSet;
use std::sync::Arc;

use faultline_state::QueueBackend;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::project::ProjectDirectory;
use crate::report::{sanitise_error_type, truncate_chars, ErrorReport, MAX_MESSAGE_CHARS};
use crate::resolver::DedupResolver;
use crate::store::ErrorStore;
use crate::task::AggregationTask;
use crate::throttle::AdmissionThrottle;
use crate::types::{AggregateError, AggregateId, ErrorInstance, InstanceId};

/// What ingestion did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new aggregate was created from this report.
    Created(AggregateId),
    /// The report matched an existing aggregate; its merge is queued.
    Deferred(AggregateId),
}

impl IngestOutcome {
    #[must_use]
    pub const fn aggregate_id(&self) -> AggregateId {
        match self {
            Self::Created(id) | Self::Deferred(id) => *id,
        }
    }
}

/// Turns validated reports into stored instances and aggregation work.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn ErrorStore>,
    projects: ProjectDirectory,
    resolver: DedupResolver,
    queue: Arc<dyn QueueBackend>,
    task_queue: String,
    throttle: AdmissionThrottle,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ErrorStore>,
        projects: ProjectDirectory,
        queue: Arc<dyn QueueBackend>,
        task_queue: impl Into<String>,
        throttle: AdmissionThrottle,
    ) -> Self {
        Self {
            resolver: DedupResolver::new(store.clone()),
            store,
            projects,
            queue,
            task_queue: task_queue.into(),
            throttle,
        }
    }

    /// Ingest one report.
    ///
    /// Storage and task enqueue failures are returned. A failure to schedule
    /// the follow-up aggregation run is logged only, since the task is
    /// already queued and a later run will pick it up.
    pub async fn ingest(&self, report: &ErrorReport) -> Result<IngestOutcome> {
        report.validate()?;

        let occurred_at = report.occurred_at()?;
        let project = self.projects.get_or_create(&report.project).await?;
        let error_type = sanitise_error_type(report.error_type());
        let fingerprint = Fingerprint::compute(&error_type, report.backtrace());

        let existing = self
            .resolver
            .resolve_active(&project.name, &fingerprint)
            .await?;

        let aggregate_id = existing
            .as_ref()
            .map_or_else(AggregateId::generate, |agg| agg.id);

        let instance = ErrorInstance {
            id: InstanceId::generate(),
            project: project.name.clone(),
            aggregate_id,
            environment: report.environment().to_owned(),
            server: report.server_name.clone(),
            level: report.level(),
            occurred_at,
            message: report.message().to_owned(),
            log_message: report.log_message.clone(),
            backtrace: report.backtrace().to_owned(),
            context: report.context.clone(),
            affected_user: report.affected_user(),
        };

        if existing.is_none() {
            let aggregate = AggregateError {
                id: aggregate_id,
                project: project.name.clone(),
                error_type,
                backtrace: instance.backtrace.clone(),
                fingerprint: fingerprint.digest().to_owned(),
                active: true,
                count: 1,
                first_occurrence: occurred_at,
                last_occurrence: occurred_at,
                last_message: truncate_chars(&instance.message, MAX_MESSAGE_CHARS).to_owned(),
                level: instance.level,
                environments: BTreeSet::from([instance.environment.clone()]),
                servers: BTreeSet::from([instance.server.clone()]),
            };

            self.store.create_aggregate(&aggregate, &instance).await?;

            info!(
                project = %project.name,
                aggregate_id = %aggregate_id,
                fingerprint = %fingerprint,
                "created aggregate"
            );
            return Ok(IngestOutcome::Created(aggregate_id));
        }

        self.store.insert_instance(&instance).await?;

        let task = AggregationTask::Pointer {
            aggregate_id,
            instance_id: instance.id,
            backtrace: instance.backtrace.clone(),
        };
        self.queue.publish(&self.task_queue, &task.encode()?).await?;

        if let Err(e) = self.throttle.schedule().await {
            warn!(
                aggregate_id = %aggregate_id,
                error = %e,
                "failed to schedule aggregation run"
            );
        }

        debug!(
            project = %project.name,
            aggregate_id = %aggregate_id,
            instance_id = %instance.id,
            "deferred merge into existing aggregate"
        );
        Ok(IngestOutcome::Deferred(aggregate_id))
    }
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("task_queue", &self.task_queue)
            .finish_non_exhaustive()
    }
}
