//! Dedup resolution against the active aggregates of a project.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::store::ErrorStore;
use crate::types::AggregateError;

/// Finds the active aggregate a fingerprint belongs to.
#[derive(Clone)]
pub struct DedupResolver {
    store: Arc<dyn ErrorStore>,
}

impl DedupResolver {
    pub fn new(store: Arc<dyn ErrorStore>) -> Self {
        Self { store }
    }

    /// The active aggregate of `project` matching `fingerprint`, if any.
    ///
    /// Candidates sharing the digest are verified with
    /// [`Fingerprint::matches`]. When several match, the one with the
    /// earliest first occurrence wins; duplicates are logged, not merged.
    pub async fn resolve_active(
        &self,
        project: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AggregateError>> {
        let candidates = self.store.find_active(project, fingerprint.digest()).await?;
        let total = candidates.len();

        let mut matching = candidates.into_iter().filter(|c| fingerprint.matches(c));
        let Some(found) = matching.next() else {
            if total > 0 {
                debug!(
                    project = %project,
                    fingerprint = %fingerprint,
                    candidates = total,
                    "digest collision with no matching aggregate"
                );
            }
            return Ok(None);
        };

        let duplicates = matching.count();
        if duplicates > 0 {
            warn!(
                project = %project,
                fingerprint = %fingerprint,
                aggregate_id = %found.id,
                duplicates,
                "several active aggregates match one fingerprint"
            );
        }

        Ok(Some(found))
    }
}

impl std::fmt::Debug for DedupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupResolver").finish_non_exhaustive()
    }
}
