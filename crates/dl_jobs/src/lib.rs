//! dl_jobs: background work for Darklock Secure Channel
//!
//! A [`JobExecutor`] runs queued [`Job`]s strictly one after another, in the
//! order they were submitted, on a worker thread it manages itself. Failing
//! or panicking jobs are logged and skipped; they never reach the submitter.

pub mod executor;
pub mod job;

pub use executor::{JobExecutor, ShutdownInterrupt};
pub use job::{job_fn, FnJob, Job};
