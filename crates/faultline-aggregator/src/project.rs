//! Read-through project lookup.

use std::sync::Arc;
use std::time::Duration;

use faultline_state::KvBackend;
use tracing::warn;

use crate::error::Result;
use crate::store::ErrorStore;
use crate::types::Project;

/// Resolves project names to records, caching them in the shared KV backend.
///
/// The cache is an optimisation only: any cache failure is logged and the
/// lookup falls through to the store.
#[derive(Clone)]
pub struct ProjectDirectory {
    store: Arc<dyn ErrorStore>,
    cache: Arc<dyn KvBackend>,
    ttl: Duration,
}

impl ProjectDirectory {
    pub fn new(store: Arc<dyn ErrorStore>, cache: Arc<dyn KvBackend>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    fn cache_key(name: &str) -> String {
        format!("project:{name}")
    }

    /// Get the named project, creating it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Project> {
        let key = Self::cache_key(name);

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Project>(&bytes) {
                Ok(project) => return Ok(project),
                Err(e) => {
                    warn!(project = %name, error = %e, "discarding unreadable cached project");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(project = %name, error = %e, "project cache read failed");
            }
        }

        let project = self.store.get_or_create_project(name).await?;

        match serde_json::to_vec(&project) {
            Ok(bytes) => {
                if let Err(e) = self.cache.put(&key, &bytes, Some(self.ttl)).await {
                    warn!(project = %name, error = %e, "project cache write failed");
                }
            }
            Err(e) => {
                warn!(project = %name, error = %e, "failed to encode project for cache");
            }
        }

        Ok(project)
    }
}

impl std::fmt::Debug for ProjectDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectDirectory")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
