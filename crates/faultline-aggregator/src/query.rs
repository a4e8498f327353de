//! Read-side operations over stored aggregates and instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{AggregatorError, Result};
use crate::merge::PartialAggregate;
use crate::store::{AggregateFilter, ErrorStore, InstanceFilter};
use crate::types::{AggregateError, AggregateId, ErrorInstance};

/// Default page size for [`ErrorQueries::list_errors`].
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// An aggregate together with a selection of its occurrences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub aggregate: AggregateError,
    pub instances: Vec<ErrorInstance>,
}

/// Parameters for [`ErrorQueries::list_errors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorListQuery {
    pub project: Option<String>,
    pub environment: Option<String>,
    pub server: Option<String>,
    pub affected_user: Option<i64>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ErrorListQuery {
    fn default() -> Self {
        Self {
            project: None,
            environment: None,
            server: None,
            affected_user: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl ErrorListQuery {
    fn instance_filter(&self) -> InstanceFilter {
        InstanceFilter {
            project: self.project.clone(),
            environment: self.environment.clone(),
            server: self.server.clone(),
            affected_user: self.affected_user,
            ..InstanceFilter::default()
        }
    }
}

/// Instance count over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceCount {
    pub minutes: u32,
    pub count: u64,
}

/// Queries and operator actions on stored errors.
#[derive(Clone)]
pub struct ErrorQueries {
    store: Arc<dyn ErrorStore>,
}

impl ErrorQueries {
    pub fn new(store: Arc<dyn ErrorStore>) -> Self {
        Self { store }
    }

    /// An aggregate and its instances matching `filter`, most recent first.
    ///
    /// The filter's aggregate is overridden with `id`.
    pub async fn error_detail(
        &self,
        id: &AggregateId,
        filter: &InstanceFilter,
    ) -> Result<Option<ErrorDetail>> {
        let Some(aggregate) = self.store.get_aggregate(id).await? else {
            return Ok(None);
        };

        let filter = filter.clone().with_aggregate(*id);
        let instances = self.store.list_instances(&filter).await?;

        Ok(Some(ErrorDetail {
            aggregate,
            instances,
        }))
    }

    /// Mark an aggregate resolved. New reports will start a fresh aggregate.
    ///
    /// Only the `active` flag is written, so a concurrent aggregation commit
    /// neither revives the aggregate nor loses its occurrences.
    pub async fn deactivate(&self, id: &AggregateId) -> Result<AggregateError> {
        if self.store.deactivate_aggregate(id).await? {
            info!(aggregate_id = %id, "aggregate deactivated");
        }

        self.store
            .get_aggregate(id)
            .await?
            .ok_or_else(|| AggregatorError::AggregateNotFound(id.to_string()))
    }

    /// Active aggregates, most recent last occurrence first.
    ///
    /// With an environment, server or affected-user filter, each aggregate's
    /// count, occurrence window and environment and server sets describe
    /// only the matching instances, and aggregates without any are omitted.
    pub async fn list_errors(&self, query: &ErrorListQuery) -> Result<Vec<AggregateError>> {
        let instance_filter = query.instance_filter();

        if !instance_filter.narrows_occurrences() {
            let mut filter = AggregateFilter::new()
                .with_active(true)
                .with_limit(query.limit)
                .with_offset(query.offset);
            if let Some(ref project) = query.project {
                filter = filter.with_project(project.clone());
            }
            return self.store.list_aggregates(&filter).await;
        }

        let instances = self.store.list_instances(&instance_filter).await?;

        let mut groups: BTreeMap<AggregateId, Vec<PartialAggregate>> = BTreeMap::new();
        for instance in &instances {
            groups
                .entry(instance.aggregate_id)
                .or_default()
                .push(PartialAggregate::from_instance(instance, &instance.backtrace));
        }

        let mut results = Vec::with_capacity(groups.len());
        for (id, parts) in groups {
            let Some(partial) = PartialAggregate::fold(parts) else {
                continue;
            };
            let Some(mut aggregate) = self.store.get_aggregate(&id).await? else {
                continue;
            };
            if !aggregate.active {
                continue;
            }

            aggregate.count = partial.count;
            aggregate.first_occurrence = partial.first_occurrence;
            aggregate.last_occurrence = partial.last_occurrence;
            aggregate.environments = partial.environments;
            aggregate.servers = partial.servers;
            results.push(aggregate);
        }

        results.sort_by(|a, b| {
            b.last_occurrence
                .cmp(&a.last_occurrence)
                .then_with(|| a.id.cmp(&b.id))
        });

        #[allow(clippy::as_conversions)]
        Ok(results
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    /// Instance counts over each trailing window of `minutes`.
    pub async fn instance_counts(
        &self,
        project: Option<&str>,
        windows: &[u32],
    ) -> Result<Vec<InstanceCount>> {
        let now = Utc::now();
        let mut counts = Vec::with_capacity(windows.len());

        for &minutes in windows {
            let since = now - Duration::minutes(i64::from(minutes));
            let count = self.store.count_instances(project, since).await?;
            counts.push(InstanceCount { minutes, count });
        }

        Ok(counts)
    }
}

impl std::fmt::Debug for ErrorQueries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorQueries").finish_non_exhaustive()
    }
}
