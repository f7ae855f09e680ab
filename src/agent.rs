use serde::{Deserialize, Serialize};

pub type AgentId = usize;

/// One stage-game period as seen by a single manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub epoch: usize,
    pub round: usize,
    pub group: usize,
    pub gamma: f64,
    pub confidence: f64,
    pub action: f64,
    pub opponent_actions: Vec<f64>,
    pub payoff: f64,
    pub fitness: f64,
}

/// Evolution bookkeeping for one manager at one update point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub agent_id: AgentId,
    pub population_id: u32,
    pub epoch: usize,
    pub fitness: f64,
    pub rank: usize,
    pub prob_selection: f64,
    pub weight: f64,
    pub prob_imitation_target: f64,
    pub selected: bool,
    pub imitation_target: Option<AgentId>,
    pub previous_confidence: f64,
    pub next_confidence: f64,
}

/// A manager: heritable confidence plus per-epoch accumulators and audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub population_id: u32,
    pub confidence: f64,
    pub action: f64,
    pub period_payoff: f64,
    pub period_fitness: f64,
    pub cumulative_payoff: f64,
    pub cumulative_fitness: f64,
    /// Sum of finished epoch payoffs (participant compensation).
    pub total_payoff: f64,
    pub history: Vec<RoundRecord>,
    pub updates: Vec<UpdateOutcome>,
}

impl Agent {
    pub fn new(id: AgentId, population_id: u32, confidence: f64, action: f64) -> Self {
        Self {
            id,
            population_id,
            confidence,
            action,
            period_payoff: 0.0,
            period_fitness: 0.0,
            cumulative_payoff: 0.0,
            cumulative_fitness: 0.0,
            total_payoff: 0.0,
            history: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn with_history_capacity(mut self, rounds: usize) -> Self {
        self.history.reserve_exact(rounds);
        self
    }

    pub fn reset_accumulators(&mut self) {
        self.cumulative_payoff = 0.0;
        self.cumulative_fitness = 0.0;
    }
}

/// Sorted, de-duplicated population ids present in `agents`.
pub fn population_ids(agents: &[Agent]) -> Vec<u32> {
    let mut ids: Vec<u32> = agents.iter().map(|a| a.population_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_only_accumulators() {
        let mut a = Agent::new(3, 1, 1.2, 0.4);
        a.cumulative_fitness = 10.0;
        a.cumulative_payoff = 12.0;
        a.total_payoff = 50.0;
        a.reset_accumulators();
        assert_eq!(a.cumulative_fitness, 0.0);
        assert_eq!(a.cumulative_payoff, 0.0);
        assert_eq!(a.total_payoff, 50.0);
        assert_eq!(a.confidence, 1.2);
    }

    #[test]
    fn population_ids_are_sorted_unique() {
        let agents = vec![
            Agent::new(0, 2, 1.0, 0.5),
            Agent::new(1, 1, 1.0, 0.5),
            Agent::new(2, 2, 1.0, 0.5),
        ];
        assert_eq!(population_ids(&agents), vec![1, 2]);
    }
}
