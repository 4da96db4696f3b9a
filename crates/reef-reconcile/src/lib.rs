//! Volume lifecycle and deletion reconciliation for Reef.
//!
//! This crate provides:
//!
//! - [`VolumeService`]: boundary operations: pools, create, publish,
//!   unpublish, delete, get, plus degraded tracking and crash resume.
//! - [`VolumeReconciler`]: the deletion protocol: tombstone, attempt every
//!   teardown step, defer what an unreachable node cannot do, drop the record.
//! - [`RecoveryWorker`]: drains the pending-cleanup ledger on node recovery
//!   and on a timer.
//! - [`Teardown`]: single idempotent teardown steps.
//! - [`Backoff`]: bounded exponential backoff with jitter.
//! - [`VolumeLocks`]: per-volume single-writer locks.

pub mod backoff;
pub mod error;
pub mod locks;
pub mod reconciler;
pub mod recovery;
pub mod service;
pub mod teardown;

pub use backoff::Backoff;
pub use error::VolumeError;
pub use locks::VolumeLocks;
pub use reconciler::{DeleteOutcome, DeleteReport, VolumeReconciler};
pub use recovery::{RecoveryWorker, ReplayOutcome, ReplayReport};
pub use service::VolumeService;
pub use teardown::Teardown;
