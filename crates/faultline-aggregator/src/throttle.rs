//! Admission control for aggregation runs.
//!
//! Every schedule request takes a fresh id from a shared counter and
//! publishes a [`RunSignal`]. When signals pile up faster than runners drain
//! them, only the most recent one and every `sample_every`-th one actually
//! run; the rest are skipped because a later run will lease the same tasks.

use std::sync::Arc;

use faultline_state::{KvBackend, QueueBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ThrottleConfig;
use crate::error::Result;

/// Request for one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSignal {
    pub run_id: u64,
}

impl RunSignal {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Schedules and admits aggregation runs.
#[derive(Clone)]
pub struct AdmissionThrottle {
    cache: Arc<dyn KvBackend>,
    queue: Arc<dyn QueueBackend>,
    run_queue: String,
    counter_key: String,
    sample_every: u64,
}

impl AdmissionThrottle {
    pub fn new(
        cache: Arc<dyn KvBackend>,
        queue: Arc<dyn QueueBackend>,
        run_queue: impl Into<String>,
        config: &ThrottleConfig,
    ) -> Self {
        Self {
            cache,
            queue,
            run_queue: run_queue.into(),
            counter_key: config.counter_key.clone(),
            sample_every: config.sample_every.max(1),
        }
    }

    /// Take the next run id and publish a signal for it.
    pub async fn schedule(&self) -> Result<u64> {
        let raw = self.cache.incr(&self.counter_key).await?;
        let run_id = u64::try_from(raw).unwrap_or_else(|_| {
            warn!(
                key = %self.counter_key,
                value = raw,
                "run counter is negative, issuing run 0"
            );
            0
        });

        let signal = RunSignal { run_id }.encode()?;
        self.queue.publish(&self.run_queue, &signal).await?;

        debug!(run_id, "scheduled aggregation run");
        Ok(run_id)
    }

    /// The most recently issued run id, or `None` before the first schedule.
    pub async fn latest_run_id(&self) -> Result<Option<u64>> {
        let Some(bytes) = self.cache.get(&self.counter_key).await? else {
            return Ok(None);
        };

        Ok(std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.trim().parse().ok()))
    }

    /// Whether the run with `run_id` should execute.
    ///
    /// Admits the latest run and every `sample_every`-th run. Admits
    /// everything when the counter cannot be read.
    pub async fn admit(&self, run_id: u64) -> bool {
        if run_id % self.sample_every == 0 {
            return true;
        }

        match self.latest_run_id().await {
            Ok(Some(latest)) => run_id >= latest,
            Ok(None) => true,
            Err(e) => {
                warn!(run_id, error = %e, "run counter unreadable; admitting run");
                true
            }
        }
    }
}

impl std::fmt::Debug for AdmissionThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionThrottle")
            .field("run_queue", &self.run_queue)
            .field("counter_key", &self.counter_key)
            .field("sample_every", &self.sample_every)
            .finish_non_exhaustive()
    }
}
