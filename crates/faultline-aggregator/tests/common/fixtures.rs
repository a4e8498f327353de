//! Test fixtures for aggregation integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_aggregator::store::{AggregateFilter, ErrorStore, InstanceFilter};
use faultline_aggregator::{
    AggregateError, AggregateId, AggregatorError, ErrorInstance, ErrorReport, InstanceId,
    MemoryStore, Project, Result,
};
use faultline_state::{Message, MessageId, MemoryQueue, QueueBackend, QueueError};

/// A Java backtrace whose first line carries `message`.
pub fn java_backtrace(message: &str) -> String {
    format!(
        "java.lang.IllegalStateException: {message}\n\
         \tat com.shop.cart.Cart.checkout(Cart.java:42)\n\
         \tat sun.reflect.NativeMethodAccessorImpl.invoke0(Native Method)\n\
         \tat com.shop.web.CartController.post(CartController.java:17)"
    )
}

/// Builder for creating test error reports.
pub struct ReportBuilder {
    report: ErrorReport,
}

impl ReportBuilder {
    /// A valid report for `project` with a Java backtrace.
    pub fn new(project: &str) -> Self {
        Self {
            report: ErrorReport {
                project: project.to_string(),
                error_type: Some("java.lang.IllegalStateException".to_string()),
                backtrace: Some(java_backtrace("cart is empty")),
                message: Some("cart is empty".to_string()),
                environment: Some("production".to_string()),
                server_name: "web-1".to_string(),
                timestamp: 1_700_000_000.0,
                ..ErrorReport::default()
            },
        }
    }

    pub fn with_type(mut self, error_type: &str) -> Self {
        self.report.error_type = Some(error_type.to_string());
        self
    }

    /// Sets the message, rewriting the backtrace's first line to match.
    pub fn with_message(mut self, message: &str) -> Self {
        self.report.message = Some(message.to_string());
        self.report.backtrace = Some(java_backtrace(message));
        self
    }

    pub fn with_backtrace(mut self, backtrace: &str) -> Self {
        self.report.backtrace = Some(backtrace.to_string());
        self
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.report.environment = Some(environment.to_string());
        self
    }

    pub fn with_server(mut self, server: &str) -> Self {
        self.report.server_name = server.to_string();
        self
    }

    /// Seconds after the builder's base timestamp.
    pub fn at(mut self, offset_secs: f64) -> Self {
        self.report.timestamp = 1_700_000_000.0 + offset_secs;
        self
    }

    /// Sets the timestamp relative to the current time.
    pub fn minutes_ago(mut self, minutes: i64) -> Self {
        let at = Utc::now() - chrono::Duration::minutes(minutes);
        #[allow(clippy::cast_precision_loss)]
        let secs = at.timestamp() as f64;
        self.report.timestamp = secs;
        self
    }

    pub fn with_user(mut self, user: i64) -> Self {
        self.report.context = Some(serde_json::json!({ "userId": user }));
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.report.error_level = Some(level.to_string());
        self
    }

    pub fn build(self) -> ErrorReport {
        self.report
    }

    pub fn to_json(self) -> Vec<u8> {
        serde_json::to_vec(&self.report).unwrap()
    }
}

/// Memory store with switchable failures.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    pub fail_updates: AtomicBool,
    pub fail_instance_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Fails every write that stores an instance.
    pub fail_instance_writes: AtomicBool,
    /// Resolves the aggregate just before the next update is applied.
    pub deactivate_before_update: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(AggregatorError::internal(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ErrorStore for FailingStore {
    async fn get_or_create_project(&self, name: &str) -> Result<Project> {
        self.inner.get_or_create_project(name).await
    }

    async fn insert_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.insert_aggregate(aggregate).await
    }

    async fn create_aggregate(
        &self,
        aggregate: &AggregateError,
        instance: &ErrorInstance,
    ) -> Result<()> {
        Self::check(&self.fail_writes, "write")?;
        Self::check(&self.fail_instance_writes, "instance write")?;
        self.inner.create_aggregate(aggregate, instance).await
    }

    async fn get_aggregate(&self, id: &AggregateId) -> Result<Option<AggregateError>> {
        self.inner.get_aggregate(id).await
    }

    async fn update_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        Self::check(&self.fail_updates, "update")?;
        if self.deactivate_before_update.swap(false, Ordering::SeqCst) {
            self.inner.deactivate_aggregate(&aggregate.id).await?;
        }
        self.inner.update_aggregate(aggregate).await
    }

    async fn deactivate_aggregate(&self, id: &AggregateId) -> Result<bool> {
        self.inner.deactivate_aggregate(id).await
    }

    async fn find_active(&self, project: &str, fingerprint: &str) -> Result<Vec<AggregateError>> {
        self.inner.find_active(project, fingerprint).await
    }

    async fn list_aggregates(&self, filter: &AggregateFilter) -> Result<Vec<AggregateError>> {
        self.inner.list_aggregates(filter).await
    }

    async fn insert_instance(&self, instance: &ErrorInstance) -> Result<()> {
        Self::check(&self.fail_writes, "write")?;
        Self::check(&self.fail_instance_writes, "instance write")?;
        self.inner.insert_instance(instance).await
    }

    async fn get_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<HashMap<InstanceId, ErrorInstance>> {
        Self::check(&self.fail_instance_reads, "instance read")?;
        self.inner.get_instances(ids).await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ErrorInstance>> {
        self.inner.list_instances(filter).await
    }

    async fn count_instances(&self, project: Option<&str>, since: DateTime<Utc>) -> Result<u64> {
        self.inner.count_instances(project, since).await
    }
}

/// Memory queue with switchable failures.
#[derive(Debug)]
pub struct FlakyQueue {
    pub inner: MemoryQueue,
    /// Lease calls that succeed before every further lease fails.
    pub lease_budget: AtomicUsize,
    pub fail_ack_batch: AtomicBool,
    pub fail_publish: AtomicBool,
}

impl FlakyQueue {
    pub fn new(inner: MemoryQueue) -> Self {
        Self {
            inner,
            lease_budget: AtomicUsize::new(usize::MAX),
            fail_ack_batch: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
        }
    }

    fn injected(what: &str) -> QueueError {
        QueueError::Connection(format!("injected {what} failure"))
    }
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> std::result::Result<MessageId, QueueError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Self::injected("publish"));
        }
        self.inner.publish(queue, message).await
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> std::result::Result<Option<Message>, QueueError> {
        self.inner.receive(queue, visibility_timeout).await
    }

    async fn lease(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> std::result::Result<Vec<Message>, QueueError> {
        let allowed = self
            .lease_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(Self::injected("lease"));
        }
        self.inner.lease(queue, max, visibility_timeout).await
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> std::result::Result<(), QueueError> {
        self.inner.ack(queue, message_id).await
    }

    async fn ack_batch(
        &self,
        queue: &str,
        message_ids: &[MessageId],
    ) -> std::result::Result<usize, QueueError> {
        if self.fail_ack_batch.load(Ordering::SeqCst) {
            return Err(Self::injected("ack"));
        }
        self.inner.ack_batch(queue, message_ids).await
    }

    async fn nack(&self, queue: &str, message_id: &MessageId) -> std::result::Result<(), QueueError> {
        self.inner.nack(queue, message_id).await
    }
}
