//! Rule model, ordering alignment, and configuration shared by the
//! aggregation rule sync crates.

pub mod align;
pub mod config;
pub mod error;
pub mod rule;
pub mod ruleset;
pub mod segment;

pub use align::{align_upstream_with_state, semantically_equal_ordering, stable_sort_rules};
pub use config::Config;
pub use error::*;
pub use rule::{MatchType, Rule, MANAGED_BY};
pub use ruleset::{check_unique, RuleSet, VersionToken};
pub use segment::{AutoApplyConfig, Segment, SegmentId, SegmentedRuleSet};
