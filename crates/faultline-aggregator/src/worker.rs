//! Batched aggregation of deferred merge tasks.
//!
//! A run leases a batch of [`AggregationTask`]s, groups them by aggregate,
//! reduces each group to one [`PartialAggregate`] and commits it under a
//! per-aggregate lock. A group that cannot be committed is replaced by a
//! single merged task carrying its reduction, so nothing is lost and nothing
//! is counted twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use faultline_state::{LockBackend, Message, MessageId, QueueBackend};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{AggregatorError, Result};
use crate::merge::PartialAggregate;
use crate::store::ErrorStore;
use crate::task::AggregationTask;
use crate::throttle::AdmissionThrottle;
use crate::types::{AggregateId, ErrorInstance, InstanceId};

/// Summary of one aggregation run.
///
/// Task counters (`leased`, `malformed`, `stale`, `orphaned`) count queue
/// messages; group counters (`committed`, `retried`, `failed`) count
/// aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub leased: usize,
    pub malformed: usize,
    pub stale: usize,
    pub orphaned: usize,
    pub committed: usize,
    /// Failed groups whose reduction was re-enqueued as a merged task.
    pub retried: usize,
    /// Groups not committed in this run, retried or left to lease expiry.
    pub failed: usize,
}

impl BatchReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.leased == 0
    }
}

/// Tasks of one aggregate, in lease order.
#[derive(Debug, Default)]
struct TaskGroup {
    tasks: Vec<(MessageId, AggregationTask)>,
}

impl TaskGroup {
    fn has_pointers(&self) -> bool {
        self.tasks
            .iter()
            .any(|(_, task)| matches!(task, AggregationTask::Pointer { .. }))
    }

    fn instance_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.tasks.iter().filter_map(|(_, task)| match task {
            AggregationTask::Pointer { instance_id, .. } => Some(*instance_id),
            AggregationTask::Merged { .. } => None,
        })
    }

    fn reduce(self, instances: &HashMap<InstanceId, ErrorInstance>) -> Reduction {
        let mut live = Vec::with_capacity(self.tasks.len());
        let mut stale = Vec::new();
        let mut parts = Vec::with_capacity(self.tasks.len());

        for (id, task) in self.tasks {
            match task {
                AggregationTask::Pointer {
                    instance_id,
                    backtrace,
                    ..
                } => match instances.get(&instance_id) {
                    Some(instance) => {
                        parts.push(PartialAggregate::from_instance(instance, &backtrace));
                        live.push(id);
                    }
                    None => stale.push(id),
                },
                AggregationTask::Merged { partial, .. } => {
                    parts.push(partial);
                    live.push(id);
                }
            }
        }

        Reduction {
            partial: PartialAggregate::fold(parts),
            live,
            stale,
        }
    }
}

struct Reduction {
    partial: Option<PartialAggregate>,
    live: Vec<MessageId>,
    stale: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    Committed,
    Retried,
    Failed,
    Orphaned,
}

/// Folds queued aggregation tasks into their aggregates.
#[derive(Clone)]
pub struct AggregationWorker {
    store: Arc<dyn ErrorStore>,
    queue: Arc<dyn QueueBackend>,
    locks: Arc<dyn LockBackend>,
    throttle: AdmissionThrottle,
    task_queue: String,
    config: WorkerConfig,
}

impl AggregationWorker {
    pub fn new(
        store: Arc<dyn ErrorStore>,
        queue: Arc<dyn QueueBackend>,
        locks: Arc<dyn LockBackend>,
        throttle: AdmissionThrottle,
        task_queue: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            throttle,
            task_queue: task_queue.into(),
            config,
        }
    }

    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        self.config.lease_ttl()
    }

    /// Execute one aggregation run.
    ///
    /// Only a failure of the very first lease call is returned. Every later
    /// failure is absorbed into the report: the affected tasks are either
    /// replaced by a merged retry task or left to reappear after their lease
    /// expires.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let messages = self.lease_batch().await?;

        let mut report = BatchReport {
            leased: messages.len(),
            ..BatchReport::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }

        let (groups, malformed) = Self::classify(messages);
        report.malformed = malformed.len();
        self.delete_tasks(&malformed, "malformed").await;

        let instances = self.load_instances(&groups).await;

        for (aggregate_id, group) in groups {
            let reduction = match &instances {
                Some(instances) => group.reduce(instances),
                None if group.has_pointers() => {
                    debug!(
                        aggregate_id = %aggregate_id,
                        tasks = group.tasks.len(),
                        "instances unavailable, leaving group leased"
                    );
                    report.failed += 1;
                    continue;
                }
                None => group.reduce(&HashMap::new()),
            };

            if !reduction.stale.is_empty() {
                warn!(
                    aggregate_id = %aggregate_id,
                    count = reduction.stale.len(),
                    "discarding tasks for missing instances"
                );
                report.stale += reduction.stale.len();
                self.delete_tasks(&reduction.stale, "stale").await;
            }

            let Some(partial) = reduction.partial else {
                continue;
            };

            let tasks = reduction.live.len();
            match self.commit_group(aggregate_id, &reduction.live, partial).await {
                GroupOutcome::Committed => report.committed += 1,
                GroupOutcome::Retried => {
                    report.retried += 1;
                    report.failed += 1;
                }
                GroupOutcome::Failed => report.failed += 1,
                GroupOutcome::Orphaned => report.orphaned += tasks,
            }
        }

        for _ in 0..report.failed {
            if let Err(e) = self.throttle.schedule().await {
                warn!(error = %e, "failed to schedule follow-up aggregation run");
            }
        }

        info!(
            leased = report.leased,
            committed = report.committed,
            retried = report.retried,
            failed = report.failed,
            malformed = report.malformed,
            stale = report.stale,
            orphaned = report.orphaned,
            "aggregation batch finished"
        );

        Ok(report)
    }

    /// Lease up to `batch_cap` tasks in `lease_chunk` sized calls.
    async fn lease_batch(&self) -> Result<Vec<Message>> {
        let mut leased: Vec<Message> = Vec::new();

        while leased.len() < self.config.batch_cap {
            let want = self
                .config
                .lease_chunk
                .max(1)
                .min(self.config.batch_cap - leased.len());

            match self
                .queue
                .lease(&self.task_queue, want, self.config.lease_ttl())
                .await
            {
                Ok(chunk) => {
                    let got = chunk.len();
                    leased.extend(chunk);
                    if got < want {
                        break;
                    }
                }
                Err(e) if leased.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        leased = leased.len(),
                        error = %e,
                        "lease failed mid-batch, continuing with partial batch"
                    );
                    break;
                }
            }
        }

        Ok(leased)
    }

    fn classify(messages: Vec<Message>) -> (BTreeMap<AggregateId, TaskGroup>, Vec<MessageId>) {
        let mut groups: BTreeMap<AggregateId, TaskGroup> = BTreeMap::new();
        let mut malformed = Vec::new();

        for message in messages {
            match AggregationTask::decode(&message.payload) {
                Ok(task) => groups
                    .entry(task.aggregate_id())
                    .or_default()
                    .tasks
                    .push((message.id, task)),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "discarding malformed task");
                    malformed.push(message.id);
                }
            }
        }

        (groups, malformed)
    }

    /// One batch read for every pointer task. `None` if the read failed.
    async fn load_instances(
        &self,
        groups: &BTreeMap<AggregateId, TaskGroup>,
    ) -> Option<HashMap<InstanceId, ErrorInstance>> {
        let ids: Vec<InstanceId> = groups.values().flat_map(TaskGroup::instance_ids).collect();
        if ids.is_empty() {
            return Some(HashMap::new());
        }

        match self.store.get_instances(&ids).await {
            Ok(instances) => Some(instances),
            Err(e) => {
                warn!(count = ids.len(), error = %e, "failed to load instances for batch");
                None
            }
        }
    }

    async fn commit_group(
        &self,
        aggregate_id: AggregateId,
        message_ids: &[MessageId],
        partial: PartialAggregate,
    ) -> GroupOutcome {
        let resource = format!("aggregate:{aggregate_id}");

        let reason = match self.locks.try_acquire(&resource, self.config.lock_ttl()).await {
            Ok(Some(guard)) => {
                let applied = self.apply(aggregate_id, &partial).await;

                if let Err(e) = guard.release().await {
                    warn!(aggregate_id = %aggregate_id, error = %e, "failed to release aggregate lock");
                }

                match applied {
                    Ok(()) => {
                        if let Err(e) = self.queue.ack_batch(&self.task_queue, message_ids).await {
                            error!(
                                aggregate_id = %aggregate_id,
                                tasks = message_ids.len(),
                                error = %e,
                                "committed group but failed to delete its tasks, they will be counted again after lease expiry"
                            );
                        }
                        debug!(
                            aggregate_id = %aggregate_id,
                            count = partial.count,
                            "committed aggregation group"
                        );
                        return GroupOutcome::Committed;
                    }
                    Err(AggregatorError::AggregateNotFound(_)) => {
                        warn!(
                            aggregate_id = %aggregate_id,
                            tasks = message_ids.len(),
                            "aggregate no longer exists, discarding its tasks"
                        );
                        self.delete_tasks(message_ids, "orphaned").await;
                        return GroupOutcome::Orphaned;
                    }
                    Err(e) => e.to_string(),
                }
            }
            Ok(None) => "aggregate is locked".to_owned(),
            Err(e) => e.to_string(),
        };

        self.defer(aggregate_id, message_ids, partial, &reason).await
    }

    async fn apply(&self, aggregate_id: AggregateId, partial: &PartialAggregate) -> Result<()> {
        let mut aggregate = self
            .store
            .get_aggregate(&aggregate_id)
            .await?
            .ok_or_else(|| AggregatorError::AggregateNotFound(aggregate_id.to_string()))?;

        aggregate.absorb(partial);
        self.store.update_aggregate(&aggregate).await
    }

    /// Replace the group's tasks with one merged task.
    async fn defer(
        &self,
        aggregate_id: AggregateId,
        message_ids: &[MessageId],
        partial: PartialAggregate,
        reason: &str,
    ) -> GroupOutcome {
        // The originals must be gone before the merged task exists, or a
        // concurrent run could apply both.
        if let Err(e) = self.queue.ack_batch(&self.task_queue, message_ids).await {
            warn!(
                aggregate_id = %aggregate_id,
                reason = %reason,
                error = %e,
                "failed to delete group tasks, leaving them to lease expiry"
            );
            return GroupOutcome::Failed;
        }

        let count = partial.count;
        let task = AggregationTask::Merged {
            aggregate_id,
            partial,
        };

        let published = match task.encode() {
            Ok(payload) => self
                .queue
                .publish(&self.task_queue, &payload)
                .await
                .map_err(AggregatorError::from),
            Err(e) => Err(e),
        };

        match published {
            Ok(_) => {
                debug!(
                    aggregate_id = %aggregate_id,
                    reason = %reason,
                    count,
                    "deferred aggregation group as merged task"
                );
                GroupOutcome::Retried
            }
            Err(e) => {
                error!(
                    aggregate_id = %aggregate_id,
                    count,
                    error = %e,
                    "lost aggregation group: merged task could not be enqueued"
                );
                GroupOutcome::Failed
            }
        }
    }

    async fn delete_tasks(&self, message_ids: &[MessageId], kind: &str) {
        if message_ids.is_empty() {
            return;
        }
        if let Err(e) = self.queue.ack_batch(&self.task_queue, message_ids).await {
            warn!(kind, count = message_ids.len(), error = %e, "failed to delete tasks");
        }
    }
}

impl std::fmt::Debug for AggregationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationWorker")
            .field("task_queue", &self.task_queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
