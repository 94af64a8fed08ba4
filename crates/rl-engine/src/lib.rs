//! Policy selection engine: multi-armed bandits (Thompson sampling, UCB1)
//! over per-context buckets, experiment holdout, and deterministic
//! experiment variant assignment.

#![warn(clippy::unwrap_used)]

pub mod bandits;
pub mod bucket;
pub mod experiments;
pub mod holdout;
pub mod manager;

pub use bandits::{selector_for, Arm, ArmSelector, Selection, ThompsonSelector, Ucb1Selector};
pub use bucket::bucket_key;
pub use experiments::{DeterministicAssigner, ExperimentAssigner};
pub use holdout::{ExperimentHoldout, HoldoutGroup};
pub use manager::{BanditManager, DecideInput, Decision, RewardInput};
