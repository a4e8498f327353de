//! Deferred aggregation work items.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::merge::PartialAggregate;
use crate::types::{AggregateId, InstanceId};

/// A unit of deferred merge work for one aggregate.
///
/// Serialised as JSON with a `kind` discriminant so that payloads of any
/// other shape are rejected at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationTask {
    /// One stored occurrence waiting to be folded in.
    Pointer {
        aggregate_id: AggregateId,
        instance_id: InstanceId,
        backtrace: String,
    },
    /// A self-contained reduction left behind by a failed commit.
    Merged {
        aggregate_id: AggregateId,
        partial: PartialAggregate,
    },
}

impl AggregationTask {
    #[must_use]
    pub fn aggregate_id(&self) -> AggregateId {
        match self {
            Self::Pointer { aggregate_id, .. } | Self::Merged { aggregate_id, .. } => *aggregate_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
