//! Upgrade-or-reinstall reconciliation for keel installations.
//!
//! Given the desired (manifest, params) pair, the previously installed pair,
//! and read-only queries of the live cluster, decide whether:
//!
//! - a **fresh install** is needed (nothing installed, or the cluster is gone)
//! - an **upgrade** in place reaches the target
//! - a **reinstall** (teardown then install) is required
//!
//! # Invariants
//!
//! - No previous state always means fresh install, never reinstall
//! - A target older than what is deployed is an error, not a reinstall
//! - Decisions are deterministic given the same inputs and cluster answers

mod decision;
mod error;
mod gate;
mod hash;
mod observe;

pub use decision::{Decision, FreshReason, Reconciler, Target};
pub use error::{ReconcileError, ReinstallReason};
pub use gate::{charts_stale, validate_installer_version};
pub use hash::SpecHash;
pub use observe::{ClusterObserver, ReleaseObserver};
