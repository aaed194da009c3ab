//! Named-condition reconciliation primitives
//!
//! Multi-step convergence is made idempotent and resumable by attaching a
//! named [`crds::Condition`] to every step. A [`ConditionType`] runs a step
//! through one of three guards ([`ConditionType::once`],
//! [`ConditionType::do_`], [`ConditionType::do_until_true`]), records the
//! outcome on the resource and persists it through an [`EntityStore`].
//!
//! # Example
//!
//! ```no_run
//! use conditions::{ConditionType, EntityStore, StepOutcome, StoreError};
//! use crds::Cluster;
//!
//! const PROVISIONED: ConditionType = ConditionType::new("Provisioned");
//!
//! # async fn example(store: &dyn EntityStore<Cluster>, cluster: Cluster) -> Result<(), StoreError> {
//! let outcome = PROVISIONED
//!     .once(store, cluster, |cluster| async move { StepOutcome::<_, StoreError>::ok(cluster) })
//!     .await;
//! outcome.result?;
//! # Ok(())
//! # }
//! ```

pub mod condition;
pub mod error;
pub mod retry;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use condition::{ConditionType, StepOutcome};
pub use error::StepError;
pub use retry::{RetryPolicy, retry, retry_if};
pub use store::{EntityStore, KubeStore, StoreError};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;
