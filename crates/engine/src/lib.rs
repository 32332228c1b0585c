//! Client-side cache of segmented aggregation rule sets, kept in step with a
//! remote store through version tokens.

pub mod engine;
pub mod error;
pub mod partition;
pub mod registry;

pub use engine::{AggregationRules, UpsertOutcome};
pub use error::{ErrorKind, SyncError};
pub use partition::{PartitionSnapshot, PartitionState};
pub use registry::PartitionRegistry;
