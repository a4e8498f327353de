//! Durable storage for projects, aggregates and instances.
//!
//! The store offers single-row reads and writes plus filtered queries. The
//! only multi-row write is [`ErrorStore::create_aggregate`], which stores a
//! new aggregate together with its first instance. Concurrent aggregate
//! updates are serialised by the aggregation worker's advisory lock; the
//! `active` flag has its own write path so that resolving an aggregate
//! never contends with that lock.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::types::{AggregateError, AggregateId, ErrorInstance, InstanceId, Project};

/// Filter criteria for listing aggregates.
#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    /// Filter by project name.
    pub project: Option<String>,
    /// Filter by active flag.
    pub active: Option<bool>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl AggregateFilter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            project: None,
            active: None,
            limit: None,
            offset: None,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Filter criteria for listing instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub project: Option<String>,
    pub aggregate_id: Option<AggregateId>,
    pub environment: Option<String>,
    pub server: Option<String>,
    pub affected_user: Option<i64>,
    /// Only instances that occurred at or after this time.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl InstanceFilter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            project: None,
            aggregate_id: None,
            environment: None,
            server: None,
            affected_user: None,
            since: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    #[must_use]
    pub const fn with_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub const fn with_affected_user(mut self, user: i64) -> Self {
        self.affected_user = Some(user);
        self
    }

    #[must_use]
    pub const fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether any of the occurrence-level filters is set.
    #[must_use]
    pub const fn narrows_occurrences(&self) -> bool {
        self.environment.is_some() || self.server.is_some() || self.affected_user.is_some()
    }

    pub(crate) fn accepts(&self, instance: &ErrorInstance) -> bool {
        self.project.as_ref().map_or(true, |p| &instance.project == p)
            && self.aggregate_id.map_or(true, |id| instance.aggregate_id == id)
            && self
                .environment
                .as_ref()
                .map_or(true, |e| &instance.environment == e)
            && self.server.as_ref().map_or(true, |s| &instance.server == s)
            && self
                .affected_user
                .map_or(true, |u| instance.affected_user == Some(u))
            && self.since.map_or(true, |t| instance.occurred_at >= t)
    }
}

/// Backend for storing error records.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// Get the named project, creating it on first use.
    async fn get_or_create_project(&self, name: &str) -> Result<Project>;

    /// Insert a new aggregate.
    ///
    /// Returns an error if an aggregate with the same ID already exists.
    async fn insert_aggregate(&self, aggregate: &AggregateError) -> Result<()>;

    /// Insert a new aggregate and its first instance, both or neither.
    async fn create_aggregate(
        &self,
        aggregate: &AggregateError,
        instance: &ErrorInstance,
    ) -> Result<()>;

    async fn get_aggregate(&self, id: &AggregateId) -> Result<Option<AggregateError>>;

    /// Overwrite the merged state of an existing aggregate.
    ///
    /// The stored `active` flag is left as it is; see
    /// [`ErrorStore::deactivate_aggregate`].
    ///
    /// Returns [`crate::AggregatorError::AggregateNotFound`] if it does not exist.
    async fn update_aggregate(&self, aggregate: &AggregateError) -> Result<()>;

    /// Clear the `active` flag. Returns whether the aggregate was active.
    ///
    /// Returns [`crate::AggregatorError::AggregateNotFound`] if it does not exist.
    async fn deactivate_aggregate(&self, id: &AggregateId) -> Result<bool>;

    /// Active aggregates of `project` with the given fingerprint digest,
    /// oldest first occurrence first.
    async fn find_active(&self, project: &str, fingerprint: &str) -> Result<Vec<AggregateError>>;

    /// List aggregates matching the filter, most recent last occurrence first.
    async fn list_aggregates(&self, filter: &AggregateFilter) -> Result<Vec<AggregateError>>;

    /// Insert a new instance.
    async fn insert_instance(&self, instance: &ErrorInstance) -> Result<()>;

    /// Fetch many instances at once. Unknown IDs are absent from the result.
    async fn get_instances(&self, ids: &[InstanceId])
        -> Result<HashMap<InstanceId, ErrorInstance>>;

    /// List instances matching the filter, most recent first.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ErrorInstance>>;

    /// Number of instances since `since`, optionally for one project.
    async fn count_instances(&self, project: Option<&str>, since: DateTime<Utc>) -> Result<u64>;
}

/// Build the configured store.
pub async fn from_config(config: &StoreConfig) -> Result<Arc<dyn ErrorStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),

        #[cfg(feature = "postgres")]
        StoreConfig::Postgres {
            url,
            max_connections,
        } => Ok(Arc::new(PostgresStore::new(url, *max_connections).await?)),
    }
}
