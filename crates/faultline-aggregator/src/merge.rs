//! Merge algebra for folding occurrences into aggregates.
//!
//! Counts add, the occurrence window widens and the environment and server
//! sets union. The snapshot (`last_message`, `backtrace`) comes from the
//! latest occurrence; equal timestamps fall back to comparing the snapshot
//! itself, which makes [`PartialAggregate::merge`] commutative and
//! associative.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::{truncate_chars, MAX_MESSAGE_CHARS};
use crate::types::{AggregateError, ErrorInstance};

/// A pre-reduced set of occurrences awaiting commit to one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAggregate {
    pub count: u64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub last_message: String,
    pub backtrace: String,
    pub environments: BTreeSet<String>,
    pub servers: BTreeSet<String>,
}

impl PartialAggregate {
    /// A single occurrence, with `backtrace` as its snapshot.
    #[must_use]
    pub fn from_instance(instance: &ErrorInstance, backtrace: &str) -> Self {
        Self {
            count: 1,
            first_occurrence: instance.occurred_at,
            last_occurrence: instance.occurred_at,
            last_message: truncate_chars(&instance.message, MAX_MESSAGE_CHARS).to_owned(),
            backtrace: backtrace.to_owned(),
            environments: BTreeSet::from([instance.environment.clone()]),
            servers: BTreeSet::from([instance.server.clone()]),
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.count = self.count.saturating_add(other.count);
        self.first_occurrence = self.first_occurrence.min(other.first_occurrence);

        if (other.last_occurrence, &other.last_message, &other.backtrace)
            > (self.last_occurrence, &self.last_message, &self.backtrace)
        {
            self.last_occurrence = other.last_occurrence;
            self.last_message = other.last_message;
            self.backtrace = other.backtrace;
        }

        self.environments.extend(other.environments);
        self.servers.extend(other.servers);
    }

    /// Fold a sequence of partials, or `None` if it is empty.
    pub fn fold(parts: impl IntoIterator<Item = Self>) -> Option<Self> {
        let mut parts = parts.into_iter();
        let mut acc = parts.next()?;
        for part in parts {
            acc.merge(part);
        }
        Some(acc)
    }
}

impl AggregateError {
    /// Apply a partial with the same rule as [`PartialAggregate::merge`].
    pub fn absorb(&mut self, partial: &PartialAggregate) {
        self.count = self.count.saturating_add(partial.count);
        self.first_occurrence = self.first_occurrence.min(partial.first_occurrence);

        if (partial.last_occurrence, &partial.last_message, &partial.backtrace)
            > (self.last_occurrence, &self.last_message, &self.backtrace)
        {
            self.last_occurrence = partial.last_occurrence;
            self.last_message.clone_from(&partial.last_message);
            self.backtrace.clone_from(&partial.backtrace);
        }

        self.environments.extend(partial.environments.iter().cloned());
        self.servers.extend(partial.servers.iter().cloned());
    }
}
