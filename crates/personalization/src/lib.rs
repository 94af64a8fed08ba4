//! Recommendation ranking: candidate retrieval, blending, profile
//! personalization, merchandising rules and MMR diversification, plus the
//! service layer that wires segments, bandit policies, traces and exposure
//! logging around it.

#![warn(clippy::unwrap_used)]

pub mod blend;
pub mod candidates;
pub mod coverage;
pub mod engine;
pub mod mmr;
pub mod personalize;
pub mod service;
pub mod similar;

pub use coverage::{CoverageLookup, CoverageTracker};
pub use engine::{EngineOutput, EngineRequest, ItemExplain, RankedItem, RecommendationEngine};
pub use service::{
    BanditRecommendRequest, RecommendResponse, RecommendationService, ResponseMeta, ServiceParts,
    SimilarResponse, ValidateResponse, ALGO_VERSION,
};
pub use similar::SimilarOutput;
