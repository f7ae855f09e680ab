//! Cournot stage game.
//!
//! Every period each manager picks a quantity `q` in `[0, 1]`. Profit for a
//! manager facing one competitor is
//!
//! ```text
//! π = q · max(0, intercept − q − γ · q_other) · 100
//! ```
//!
//! where the intercept is the manager's own confidence for the *payoff* (what
//! the participant is paid) and `1` for the *fitness* (the true profitability
//! that drives selection).

use serde::{Deserialize, Serialize};

/// Display scaling applied to every stage result.
pub const SCALE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoffKind {
    /// Intercept is the manager's own confidence.
    Payoff,
    /// Intercept is fixed at 1.
    Fitness,
}

impl PayoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoffKind::Payoff => "payoff",
            PayoffKind::Fitness => "fitness",
        }
    }
}

/// Stage result against a single opponent.
///
/// Evaluated in a fixed operation order so recorded experiment data replays
/// bit-for-bit.
pub fn stage_payoff(
    kind: PayoffKind,
    own_trait: f64,
    own_action: f64,
    opponent_action: f64,
    substitutability: f64,
) -> f64 {
    let intercept = match kind {
        PayoffKind::Payoff => own_trait,
        PayoffKind::Fitness => 1.0,
    };
    let margin = intercept - own_action - opponent_action * substitutability;
    own_action * margin.max(0.0) * SCALE
}

/// Mean stage result against every opponent of an n-player market.
pub fn group_payoff(
    kind: PayoffKind,
    own_trait: f64,
    own_action: f64,
    opponent_actions: &[f64],
    substitutability: f64,
) -> f64 {
    if opponent_actions.is_empty() {
        return 0.0;
    }
    let sum: f64 = opponent_actions
        .iter()
        .map(|&q| stage_payoff(kind, own_trait, own_action, q, substitutability))
        .sum();
    sum / opponent_actions.len() as f64
}

/// Nash quantity of the two-firm game with perceived intercepts `a_i`, `a_j`.
///
/// Solving `q_i = (a_i − γ q_j) / 2` and `q_j = (a_j − γ q_i) / 2` together.
pub fn nash_action(own_trait: f64, opponent_trait: f64, substitutability: f64) -> f64 {
    let g = substitutability;
    (2.0 * own_trait - g * opponent_trait) / (4.0 - g * g)
}
