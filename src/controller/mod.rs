//! # Controller
//!
//! The generic reconcile engine shared by every managed kind.
//!
//! - `driver`: per-kind orchestration of the step pipeline and status
//! - `step`: Read, Diff, Apply for one child kind
//! - `diff`: normalization, structural subset and applied-hash comparison
//! - `checksum`: rollout trigger hashes for referenced ConfigMaps and Secrets
//! - `workload`: Deployment and StatefulSet steps and rollout probes
//! - `finalizer`: finalizers on referencing, non-owned objects
//! - `index` and `watch`: reverse lookups and watch invalidation
//! - `store`: object store access (live cluster or in memory)
//! - `backoff`: per-resource Fibonacci error backoff

pub mod backoff;
pub mod checksum;
pub mod context;
pub mod diff;
pub mod driver;
pub mod error;
pub mod finalizer;
pub mod index;
pub mod managed;
pub mod step;
pub mod store;
pub mod watch;
pub mod workload;

pub use context::Context;
pub use driver::{Driver, ReconcileOutcome};
pub use error::{ReconcilerError, StoreError};
pub use finalizer::{EdgeTable, FinalizerTracker, ForeignFinalizers, Tracked};
pub use index::FieldIndex;
pub use managed::Managed;
pub use step::{BuilderStep, ChildReconciler, Observed, Step, StepOutcome, Wait};
pub use store::{KubeStore, MemoryStore, Object, ObjectKey, ObjectStore};
pub use workload::{Readiness, Rollout, WorkloadProbe, WorkloadStep};
