//! Audience segmentation: a small JSON rule language evaluated against a
//! per-request context bundle, and the selector that maps a user onto a
//! segment and its tuning profile.

#![warn(clippy::unwrap_used)]

pub mod predicates;
pub mod selector;

pub use predicates::{Evaluator, ExprError};
pub use selector::{SegmentSelection, SegmentSelector};
