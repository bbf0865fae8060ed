//! Analysis job orchestration.
//!
//! ## Design
//!
//! - The job record is the durable source of truth for a job's status
//! - The task queue triggers work; it never owns the record's lifecycle
//! - At-least-once delivery: leases expire and tasks are redelivered
//! - Retries happen inside the queue (backoff), never by reverting a record
//!
//! ## Components
//!
//! - `JobRecordStore`: job records (in-memory or Postgres)
//! - `TaskQueue`: lease/ack/retry protocol (in-memory or Postgres)
//! - `Producer`: entitlement check, record creation, enqueue
//! - `AnalysisWorker`: pipeline execution, classification, progress events

pub mod postgres;
pub mod producer;
pub mod queue;
pub mod record_store;
pub mod types;
pub mod worker;

pub use postgres::{PostgresJobRecordStore, PostgresTaskQueue};
pub use producer::{Producer, SubmitError};
pub use queue::{InMemoryTaskQueue, QueueError, TaskQueue};
pub use record_store::{InMemoryJobRecordStore, JobRecordStore, StoreError};
pub use types::{
    FailureReason, JobFailure, JobRecord, JobStats, JobStatus, LeaseToken, LeasedTask, NewTask,
    RetryPolicy, StatusSnapshot, TaskEntry, TaskOutcome, TaskState,
};
pub use worker::{AnalysisWorker, RunOutcome, WorkerConfig, WorkerError, WorkerHandle, WorkerPool, WorkerStats};
