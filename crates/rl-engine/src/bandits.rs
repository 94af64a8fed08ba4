//! Multi-armed bandit arm selection: Thompson sampling and UCB1.
//!
//! Selectors are pure. Stats come in, a chosen arm index and a per-arm
//! explanation come out. Persistence is the caller's concern.

use rand::RngCore;
use rand_distr::{Beta, Distribution};
use recsys_core::types::{Algorithm, BanditStats};
use std::collections::HashMap;

/// One candidate policy with its observed stats.
#[derive(Debug, Clone, Copy)]
pub struct Arm<'a> {
    pub policy_id: &'a str,
    pub stats: BanditStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub explore: bool,
    pub explain: HashMap<String, String>,
}

pub trait ArmSelector: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// `None` only when `arms` is empty.
    fn select(&self, arms: &[Arm<'_>], rng: &mut dyn RngCore) -> Option<Selection>;
}

pub fn selector_for(algorithm: Algorithm) -> Box<dyn ArmSelector> {
    match algorithm {
        Algorithm::Thompson => Box::new(ThompsonSelector),
        Algorithm::Ucb1 => Box::new(Ucb1Selector),
    }
}

// ─── Thompson sampling ──────────────────────────────────────────────────────

/// Samples θ ~ Beta(1 + successes, 1 + failures) per arm and plays argmax θ.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThompsonSelector;

impl ArmSelector for ThompsonSelector {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Thompson
    }

    fn select(&self, arms: &[Arm<'_>], rng: &mut dyn RngCore) -> Option<Selection> {
        let mut explain = HashMap::with_capacity(arms.len());
        let mut best: Option<(usize, f64)> = None;

        for (i, arm) in arms.iter().enumerate() {
            let successes = arm.stats.successes.min(arm.stats.trials);
            let alpha = 1.0 + successes as f64;
            let beta = 1.0 + (arm.stats.trials - successes) as f64;
            let theta = beta_sample(rng, alpha, beta);
            explain.insert(format!("theta:{}", arm.policy_id), format!("{theta:.6}"));
            if best.map_or(true, |(_, b)| theta > b) {
                best = Some((i, theta));
            }
        }

        let (index, _) = best?;
        let min_trials = arms.iter().map(|a| a.stats.trials).min().unwrap_or(0);
        Some(Selection {
            index,
            explore: arms[index].stats.trials == min_trials,
            explain,
        })
    }
}

// ─── UCB1 ───────────────────────────────────────────────────────────────────

/// Plays untried arms first, then argmax of mean + sqrt(2 ln N / n_i).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ucb1Selector;

impl ArmSelector for Ucb1Selector {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Ucb1
    }

    fn select(&self, arms: &[Arm<'_>], _rng: &mut dyn RngCore) -> Option<Selection> {
        if arms.is_empty() {
            return None;
        }
        let mut explain = HashMap::with_capacity(arms.len());

        if let Some(index) = arms.iter().position(|a| a.stats.trials == 0) {
            explain.insert("untried".to_string(), arms[index].policy_id.to_string());
            return Some(Selection {
                index,
                explore: true,
                explain,
            });
        }

        let total: u64 = arms.iter().map(|a| a.stats.trials).sum();
        let log_total = (total as f64).ln();
        let mut best: Option<(usize, f64)> = None;

        for (i, arm) in arms.iter().enumerate() {
            let trials = arm.stats.trials as f64;
            let mean = arm.stats.successes as f64 / trials;
            let score = mean + (2.0 * log_total / trials).sqrt();
            explain.insert(format!("ucb:{}", arm.policy_id), format!("{score:.6}"));
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }

        let (index, _) = best?;
        let mean_trials = total as f64 / arms.len() as f64;
        Some(Selection {
            index,
            explore: (arms[index].stats.trials as f64) < mean_trials / 2.0,
            explain,
        })
    }
}

// ─── Sampling ───────────────────────────────────────────────────────────────

/// Draw from Beta(alpha, beta); degenerate parameters fall back to 0.5.
fn beta_sample(rng: &mut dyn RngCore, alpha: f64, beta: f64) -> f64 {
    if !(alpha.is_finite() && beta.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
        return 0.5;
    }
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.5,
    }
}
