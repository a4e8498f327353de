//! In-memory error store for testing and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AggregatorError, Result};
use crate::types::{AggregateError, AggregateId, ErrorInstance, InstanceId, Project};

use super::{AggregateFilter, ErrorStore, InstanceFilter};

/// In-memory error store.
///
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, Project>>,
    aggregates: RwLock<HashMap<AggregateId, AggregateError>>,
    instances: RwLock<HashMap<InstanceId, ErrorInstance>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> AggregatorError {
    AggregatorError::internal("lock poisoned")
}

#[allow(clippy::as_conversions)]
fn page<T>(items: Vec<T>, limit: Option<u32>, offset: Option<u32>) -> Vec<T> {
    let offset = offset.unwrap_or(0) as usize;
    let items = items.into_iter().skip(offset);
    match limit {
        Some(limit) => items.take(limit as usize).collect(),
        None => items.collect(),
    }
}

#[async_trait]
impl ErrorStore for MemoryStore {
    async fn get_or_create_project(&self, name: &str) -> Result<Project> {
        let mut projects = self.projects.write().map_err(poisoned)?;
        Ok(projects
            .entry(name.to_owned())
            .or_insert_with(|| Project::new(name))
            .clone())
    }

    async fn insert_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        let mut aggregates = self.aggregates.write().map_err(poisoned)?;

        if aggregates.contains_key(&aggregate.id) {
            return Err(AggregatorError::internal(format!(
                "aggregate {} already exists",
                aggregate.id
            )));
        }

        aggregates.insert(aggregate.id, aggregate.clone());
        Ok(())
    }

    async fn create_aggregate(
        &self,
        aggregate: &AggregateError,
        instance: &ErrorInstance,
    ) -> Result<()> {
        let mut aggregates = self.aggregates.write().map_err(poisoned)?;
        let mut instances = self.instances.write().map_err(poisoned)?;

        if aggregates.contains_key(&aggregate.id) {
            return Err(AggregatorError::internal(format!(
                "aggregate {} already exists",
                aggregate.id
            )));
        }
        if instances.contains_key(&instance.id) {
            return Err(AggregatorError::internal(format!(
                "instance {} already exists",
                instance.id
            )));
        }

        aggregates.insert(aggregate.id, aggregate.clone());
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_aggregate(&self, id: &AggregateId) -> Result<Option<AggregateError>> {
        let aggregates = self.aggregates.read().map_err(poisoned)?;
        Ok(aggregates.get(id).cloned())
    }

    async fn update_aggregate(&self, aggregate: &AggregateError) -> Result<()> {
        let mut aggregates = self.aggregates.write().map_err(poisoned)?;

        let slot = aggregates
            .get_mut(&aggregate.id)
            .ok_or_else(|| AggregatorError::AggregateNotFound(aggregate.id.to_string()))?;
        let active = slot.active;
        *slot = AggregateError {
            active,
            ..aggregate.clone()
        };

        Ok(())
    }

    async fn deactivate_aggregate(&self, id: &AggregateId) -> Result<bool> {
        let mut aggregates = self.aggregates.write().map_err(poisoned)?;

        let slot = aggregates
            .get_mut(id)
            .ok_or_else(|| AggregatorError::AggregateNotFound(id.to_string()))?;

        Ok(std::mem::replace(&mut slot.active, false))
    }

    async fn find_active(&self, project: &str, fingerprint: &str) -> Result<Vec<AggregateError>> {
        let aggregates = self.aggregates.read().map_err(poisoned)?;

        let mut found: Vec<_> = aggregates
            .values()
            .filter(|a| a.active && a.project == project && a.fingerprint == fingerprint)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.first_occurrence
                .cmp(&b.first_occurrence)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(found)
    }

    async fn list_aggregates(&self, filter: &AggregateFilter) -> Result<Vec<AggregateError>> {
        let aggregates = self.aggregates.read().map_err(poisoned)?;

        let mut results: Vec<_> = aggregates
            .values()
            .filter(|a| {
                if let Some(ref project) = filter.project {
                    if &a.project != project {
                        return false;
                    }
                }
                if let Some(active) = filter.active {
                    if a.active != active {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.last_occurrence
                .cmp(&a.last_occurrence)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(page(results, filter.limit, filter.offset))
    }

    async fn insert_instance(&self, instance: &ErrorInstance) -> Result<()> {
        let mut instances = self.instances.write().map_err(poisoned)?;

        if instances.contains_key(&instance.id) {
            return Err(AggregatorError::internal(format!(
                "instance {} already exists",
                instance.id
            )));
        }

        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<HashMap<InstanceId, ErrorInstance>> {
        let instances = self.instances.read().map_err(poisoned)?;

        Ok(ids
            .iter()
            .filter_map(|id| instances.get(id).map(|i| (*id, i.clone())))
            .collect())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ErrorInstance>> {
        let instances = self.instances.read().map_err(poisoned)?;

        let mut results: Vec<_> = instances
            .values()
            .filter(|i| filter.accepts(i))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(page(results, filter.limit, None))
    }

    async fn count_instances(&self, project: Option<&str>, since: DateTime<Utc>) -> Result<u64> {
        let instances = self.instances.read().map_err(poisoned)?;

        let count = instances
            .values()
            .filter(|i| project.map_or(true, |p| i.project == p) && i.occurred_at >= since)
            .count();

        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}
