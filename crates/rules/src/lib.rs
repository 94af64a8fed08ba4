//! Merchandising rules: BLOCK, PIN and BOOST directives scoped to a
//! (namespace, surface) and optionally a segment and a validity window.

#![warn(clippy::unwrap_used)]

pub mod evaluate;
pub mod manager;
pub mod summary;

pub use evaluate::{
    BoostDetail, EvaluateRequest, EvaluateResult, ItemEffect, PinnedItem, RuleEvaluator, RuleMatch,
};
pub use manager::{RuleScope, RulesManager, RulesManagerOptions};
pub use summary::PolicySummary;
