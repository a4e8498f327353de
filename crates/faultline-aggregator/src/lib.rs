//! Error report deduplication and aggregation.
//!
//! Reports arriving from client libraries are fingerprinted and matched
//! against the active aggregates of their project:
//!
//! ```text
//! report ──▶ Ingestor ──┬─ no match ──▶ new AggregateError + ErrorInstance
//!                       │
//!                       └─ match ─────▶ ErrorInstance + pointer task ──▶ run signal
//!                                                        │
//!                  AggregationRunner ◀───────────────────┘
//!                         │
//!                         ▼
//!               AggregationWorker::run_batch
//!      lease ─▶ group by aggregate ─▶ reduce ─▶ commit under lock
//!                                                  │
//!                                     lock busy ───┴──▶ one merged retry task
//! ```
//!
//! The hot path never touches an existing aggregate row. Merges are
//! batched, reduced in memory and committed under a per-aggregate advisory
//! lock, so contention costs a retry task instead of a lost or doubled
//! count.
//!
//! Infrastructure (cache, queue, locks) comes from [`faultline_state`];
//! durable records live behind [`store::ErrorStore`].

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod intake;
pub mod merge;
pub mod normalise;
pub mod project;
pub mod query;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod store;
pub mod task;
pub mod throttle;
pub mod types;
pub mod worker;

pub use config::AggregatorConfig;
pub use error::{AggregatorError, Result};
pub use fingerprint::Fingerprint;
pub use ingest::{IngestOutcome, Ingestor};
pub use intake::{IntakeDisposition, ReportIntake};
pub use merge::PartialAggregate;
pub use normalise::normalise_backtrace;
pub use project::ProjectDirectory;
pub use query::{ErrorDetail, ErrorListQuery, ErrorQueries, InstanceCount};
pub use report::ErrorReport;
pub use resolver::DedupResolver;
pub use runner::{AggregationRunner, RunDisposition};
pub use store::{AggregateFilter, ErrorStore, InstanceFilter, MemoryStore};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use task::AggregationTask;
pub use throttle::{AdmissionThrottle, RunSignal};
pub use types::{AggregateError, AggregateId, ErrorInstance, ErrorLevel, InstanceId, Project};
pub use worker::{AggregationWorker, BatchReport};
