// Decision rules for simulated managers.
//
// Every rule sees the previous period only: its own confidence, action and
// payoff, plus the same for the other members of its group.

use serde::{Deserialize, Serialize};

use crate::game::{group_payoff, nash_action, PayoffKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub confidence: f64,
    pub action: f64,
    pub payoff: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ChoiceContext<'a> {
    pub gamma: f64,
    /// Pass-through scalar kept for parameter compatibility.
    pub c: f64,
    pub confidence: f64,
    pub action: f64,
    pub payoff: f64,
    pub neighbours: &'a [Neighbour],
}

impl<'a> ChoiceContext<'a> {
    pub fn neighbour_actions(&self) -> Vec<f64> {
        self.neighbours.iter().map(|n| n.action).collect()
    }

    fn mean_neighbour_action(&self) -> f64 {
        if self.neighbours.is_empty() {
            return 0.0;
        }
        self.neighbours.iter().map(|n| n.action).sum::<f64>() / self.neighbours.len() as f64
    }

    fn mean_neighbour_confidence(&self) -> f64 {
        if self.neighbours.is_empty() {
            return self.confidence;
        }
        self.neighbours.iter().map(|n| n.confidence).sum::<f64>() / self.neighbours.len() as f64
    }
}

pub trait ChoiceRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64;
}

/// Grid search over `q = i / steps` against last period's opponent actions.
#[derive(Debug, Clone, Copy)]
pub struct BestResponseGrid {
    pub steps: u32,
}

impl BestResponseGrid {
    fn search(&self, ctx: &ChoiceContext<'_>) -> f64 {
        let others = ctx.neighbour_actions();
        let steps = self.steps.max(1);
        let mut best_p = ctx.payoff;
        let mut best_q = ctx.action;
        for i in 0..=steps {
            let q = i as f64 / steps as f64;
            let p = group_payoff(PayoffKind::Payoff, ctx.confidence, q, &others, ctx.gamma);
            if p > best_p {
                best_p = p;
                best_q = q;
            }
        }
        best_q
    }
}

impl ChoiceRule for BestResponseGrid {
    fn id(&self) -> &'static str {
        "best_response_grid"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        self.search(ctx)
    }
}

/// Half a step from last period's action toward the grid best response.
#[derive(Debug, Clone, Copy)]
pub struct HalfwayBestResponseGrid {
    pub steps: u32,
}

impl ChoiceRule for HalfwayBestResponseGrid {
    fn id(&self) -> &'static str {
        "halfway_best_response_grid"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        let best_q = BestResponseGrid { steps: self.steps }.search(ctx);
        ctx.action + (best_q - ctx.action) / 2.0
    }
}

/// Closed-form shortcut `(a − γ · mean(q_others)) / 2`.
///
/// Kept exactly as the legacy simulation computed it; not a true best reply
/// for groups larger than two once the shutdown clamp binds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyticShortcut;

impl ChoiceRule for AnalyticShortcut {
    fn id(&self) -> &'static str {
        "analytic_shortcut"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        (1.0 / 2.0) * (ctx.confidence - ctx.gamma * ctx.mean_neighbour_action())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HalfwayAnalyticShortcut;

impl ChoiceRule for HalfwayAnalyticShortcut {
    fn id(&self) -> &'static str {
        "halfway_analytic_shortcut"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        let best_q = AnalyticShortcut.choose(ctx);
        ctx.action + (best_q - ctx.action) / 2.0
    }
}

/// Copy the action of a neighbour that out-earned us last period.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimicBest;

impl ChoiceRule for MimicBest {
    fn id(&self) -> &'static str {
        "mimic_best"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        // Compared against our own payoff only: the last neighbour that beat us wins.
        let best_p = ctx.payoff;
        let mut best_q = ctx.action;
        for n in ctx.neighbours {
            if n.payoff > best_p {
                best_q = n.action;
            }
        }
        best_q
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHalf;

impl ChoiceRule for AlwaysHalf {
    fn id(&self) -> &'static str {
        "always_half"
    }

    fn choose(&self, _ctx: &ChoiceContext<'_>) -> f64 {
        0.5
    }
}

/// Equilibrium play given both confidences (rational-play harness).
#[derive(Debug, Clone, Copy, Default)]
pub struct NashPlay;

impl ChoiceRule for NashPlay {
    fn id(&self) -> &'static str {
        "nash"
    }

    fn choose(&self, ctx: &ChoiceContext<'_>) -> f64 {
        nash_action(ctx.confidence, ctx.mean_neighbour_confidence(), ctx.gamma)
    }
}

/// Configuration-time selector for a [`ChoiceRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ChoiceKind {
    BestResponse { steps: u32 },
    HalfwayBestResponse { steps: u32 },
    AnalyticShortcut,
    HalfwayAnalyticShortcut,
    MimicBest,
    AlwaysHalf,
    Nash,
}

impl ChoiceKind {
    pub const DEFAULT_STEPS: u32 = 100;

    /// Accepts both the short names and the legacy function names.
    pub fn parse(s: &str) -> Option<Self> {
        let steps = Self::DEFAULT_STEPS;
        match s.trim().to_lowercase().as_str() {
            "best_response" | "best_choice_slow" => Some(ChoiceKind::BestResponse { steps }),
            "halfway_best_response" | "half_way_best_choice_slow" => {
                Some(ChoiceKind::HalfwayBestResponse { steps })
            }
            "analytic_shortcut" | "best_choice_wrong" => Some(ChoiceKind::AnalyticShortcut),
            "halfway_analytic_shortcut" | "half_way_best_choice_wrong" => {
                Some(ChoiceKind::HalfwayAnalyticShortcut)
            }
            "mimic_best" | "mimic_choice" => Some(ChoiceKind::MimicBest),
            "always_half" => Some(ChoiceKind::AlwaysHalf),
            "nash" => Some(ChoiceKind::Nash),
            _ => None,
        }
    }

    pub fn build(&self) -> Box<dyn ChoiceRule> {
        match *self {
            ChoiceKind::BestResponse { steps } => Box::new(BestResponseGrid { steps }),
            ChoiceKind::HalfwayBestResponse { steps } => Box::new(HalfwayBestResponseGrid { steps }),
            ChoiceKind::AnalyticShortcut => Box::new(AnalyticShortcut),
            ChoiceKind::HalfwayAnalyticShortcut => Box::new(HalfwayAnalyticShortcut),
            ChoiceKind::MimicBest => Box::new(MimicBest),
            ChoiceKind::AlwaysHalf => Box::new(AlwaysHalf),
            ChoiceKind::Nash => Box::new(NashPlay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(neighbours: &'a [Neighbour], action: f64, payoff: f64) -> ChoiceContext<'a> {
        ChoiceContext {
            gamma: 0.5,
            c: 1.0,
            confidence: 1.0,
            action,
            payoff,
            neighbours,
        }
    }

    #[test]
    fn grid_finds_best_reply() {
        // a=1, γ=0.5, q_other=0.4 → q* = (1 - 0.2)/2 = 0.4
        let n = [Neighbour { confidence: 1.0, action: 0.4, payoff: 0.0 }];
        let q = BestResponseGrid { steps: 100 }.choose(&ctx(&n, 0.0, 0.0));
        assert!((q - 0.4).abs() < 1e-9, "q = {}", q);
    }

    #[test]
    fn grid_keeps_action_when_nothing_beats_it() {
        let n = [Neighbour { confidence: 1.0, action: 0.4, payoff: 0.0 }];
        let q = BestResponseGrid { steps: 100 }.choose(&ctx(&n, 0.37, 1e9));
        assert_eq!(q, 0.37);
    }

    #[test]
    fn halfway_moves_half_the_distance() {
        let n = [Neighbour { confidence: 1.0, action: 0.4, payoff: 0.0 }];
        let q = HalfwayBestResponseGrid { steps: 100 }.choose(&ctx(&n, 0.0, 0.0));
        assert!((q - 0.2).abs() < 1e-9);
    }

    #[test]
    fn analytic_shortcut_uses_mean_neighbour_action() {
        let n = [
            Neighbour { confidence: 1.0, action: 0.2, payoff: 0.0 },
            Neighbour { confidence: 1.0, action: 0.6, payoff: 0.0 },
        ];
        let q = AnalyticShortcut.choose(&ctx(&n, 0.5, 0.0));
        assert!((q - 0.5 * (1.0 - 0.5 * 0.4)).abs() < 1e-12);
        let h = HalfwayAnalyticShortcut.choose(&ctx(&n, 0.5, 0.0));
        assert!((h - (0.5 + (q - 0.5) / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn mimic_takes_last_neighbour_that_beat_us() {
        let n = [
            Neighbour { confidence: 1.0, action: 0.9, payoff: 30.0 },
            Neighbour { confidence: 1.0, action: 0.1, payoff: 20.0 },
            Neighbour { confidence: 1.0, action: 0.7, payoff: 5.0 },
        ];
        assert_eq!(MimicBest.choose(&ctx(&n, 0.5, 10.0)), 0.1);
        assert_eq!(MimicBest.choose(&ctx(&n, 0.5, 50.0)), 0.5);
    }

    #[test]
    fn nash_against_partner_confidence() {
        let n = [Neighbour { confidence: 1.0, action: 0.0, payoff: 0.0 }];
        let q = NashPlay.choose(&ctx(&n, 0.0, 0.0));
        assert!((q - 1.0 / 2.5).abs() < 1e-12);
    }

    #[test]
    fn parse_accepts_legacy_names() {
        assert_eq!(ChoiceKind::parse("best_choice_slow"), Some(ChoiceKind::BestResponse { steps: 100 }));
        assert_eq!(ChoiceKind::parse("mimic_choice"), Some(ChoiceKind::MimicBest));
        assert_eq!(ChoiceKind::parse("ALWAYS_HALF"), Some(ChoiceKind::AlwaysHalf));
        assert_eq!(ChoiceKind::parse("random"), None);
        assert_eq!(ChoiceKind::parse("nash").map(|k| k.build().id()), Some("nash"));
    }
}
