use serde::Serialize;

use crate::agent::{Agent, RoundRecord};

/// Cross-market summary of one per-market average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub lowest: f64,
    pub highest: f64,
    /// Sample variance (n − 1); zero with fewer than two markets.
    pub variance: f64,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, lowest: 0.0, highest: 0.0, variance: 0.0 };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let lowest = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let highest = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let variance = if values.len() < 2 {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        };
        Self { mean, lowest, highest, variance }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Action,
    Payoff,
    Fitness,
    Confidence,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Action, Metric::Payoff, Metric::Fitness, Metric::Confidence];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Action => "action",
            Metric::Payoff => "payoff",
            Metric::Fitness => "fitness",
            Metric::Confidence => "confidence",
        }
    }

    fn read(&self, r: &RoundRecord) -> f64 {
        match self {
            Metric::Action => r.action,
            Metric::Payoff => r.payoff,
            Metric::Fitness => r.fitness,
            Metric::Confidence => r.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    pub epoch: usize,
    pub round: usize,
    pub action: Summary,
    pub payoff: Summary,
    pub fitness: Summary,
    pub confidence: Summary,
}

impl RoundStats {
    pub fn get(&self, metric: Metric) -> &Summary {
        match metric {
            Metric::Action => &self.action,
            Metric::Payoff => &self.payoff,
            Metric::Fitness => &self.fitness,
            Metric::Confidence => &self.confidence,
        }
    }
}

fn market_mean(agents: &[Agent], step: usize, metric: Metric) -> f64 {
    if agents.is_empty() {
        return 0.0;
    }
    agents.iter().map(|a| metric.read(&a.history[step])).sum::<f64>() / agents.len() as f64
}

/// Per recorded round: average each metric inside every market, then
/// summarize those averages across markets.
pub fn round_stats(markets: &[Vec<Agent>]) -> Vec<RoundStats> {
    let steps = markets
        .iter()
        .flat_map(|m| m.iter())
        .map(|a| a.history.len())
        .min()
        .unwrap_or(0);
    let Some(reference) = markets.iter().flat_map(|m| m.iter()).next() else {
        return Vec::new();
    };

    (0..steps)
        .map(|step| {
            let summarize = |metric: Metric| {
                let means: Vec<f64> = markets
                    .iter()
                    .filter(|m| !m.is_empty())
                    .map(|m| market_mean(m, step, metric))
                    .collect();
                Summary::of(&means)
            };
            let rec = &reference.history[step];
            RoundStats {
                epoch: rec.epoch,
                round: rec.round,
                action: summarize(Metric::Action),
                payoff: summarize(Metric::Payoff),
                fitness: summarize(Metric::Fitness),
                confidence: summarize(Metric::Confidence),
            }
        })
        .collect()
}

pub fn stats_csv(stats: &[RoundStats]) -> String {
    let mut out = String::from("epoch,round");
    for m in Metric::ALL {
        for field in ["mean", "lowest", "highest", "variance"] {
            out.push_str(&format!(",{}_{}", m.as_str(), field));
        }
    }
    out.push('\n');
    for s in stats {
        out.push_str(&format!("{},{}", s.epoch, s.round));
        for m in Metric::ALL {
            let v = s.get(m);
            out.push_str(&format!(",{},{},{},{}", v.mean, v.lowest, v.highest, v.variance));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_history(id: usize, actions: &[f64]) -> Agent {
        let mut a = Agent::new(id, 1, 1.0, 0.0);
        for (i, &q) in actions.iter().enumerate() {
            a.history.push(RoundRecord {
                epoch: i,
                round: 0,
                group: 0,
                gamma: 0.5,
                confidence: 1.0,
                action: q,
                opponent_actions: vec![],
                payoff: 10.0 * q,
                fitness: 0.0,
            });
        }
        a
    }

    #[test]
    fn summary_uses_sample_variance() {
        let s = Summary::of(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.lowest, 1.0);
        assert_eq!(s.highest, 4.0);
        assert!((s.variance - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(Summary::of(&[7.0]).variance, 0.0);
    }

    #[test]
    fn averages_inside_markets_first() {
        let markets = vec![
            vec![with_history(0, &[0.0, 0.2]), with_history(1, &[1.0, 0.4])],
            vec![with_history(0, &[0.2, 0.6]), with_history(1, &[0.2, 0.6])],
        ];
        let stats = round_stats(&markets);
        assert_eq!(stats.len(), 2);
        // market means at epoch 0: 0.5 and 0.2
        assert!((stats[0].action.mean - 0.35).abs() < 1e-12);
        assert_eq!(stats[0].action.lowest, 0.2);
        assert_eq!(stats[0].action.highest, 0.5);
        assert_eq!(stats[1].epoch, 1);
        assert!((stats[1].payoff.mean - 4.5).abs() < 1e-9);
        assert_eq!(stats[0].confidence.variance, 0.0);
    }

    #[test]
    fn csv_has_one_row_per_round() {
        let markets = vec![vec![with_history(0, &[0.1, 0.2, 0.3])]];
        let csv = stats_csv(&round_stats(&markets));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("epoch,round,action_mean"));
        assert_eq!(lines[0].split(',').count(), 18);
    }
}
