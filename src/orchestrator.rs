//! Epoch lifecycle.
//!
//! An epoch draws fresh groups, records an unincentivized round 0, plays
//! `num_periods` incentivized rounds and, on update epochs, hands the
//! accumulated fitness to the evolution engine.
//!
//! Agents are addressed by id and `agents[i].id == i` must hold.

use anyhow::Result;
use rand::Rng;
use serde::Serialize;

use crate::agent::{Agent, AgentId, RoundRecord, UpdateOutcome};
use crate::choice::{ChoiceContext, ChoiceRule, Neighbour};
use crate::config::SimConfig;
use crate::evolution::{update_populations, EvolutionParams};
use crate::game::{group_payoff, PayoffKind};
use crate::logging::{log_epoch, log_groups, log_round};
use crate::noise::NoiseKind;
use crate::pairing::draw_groups;

/// Keep a decision inside `[0, 1]`; NaN maps to 0.
pub fn clamp_action(q: f64) -> f64 {
    if q.is_nan() {
        0.0
    } else {
        q.clamp(0.0, 1.0)
    }
}

fn score_group(
    agents: &mut [Agent],
    group: usize,
    members: &[AgentId],
    epoch: usize,
    round: usize,
    gamma: f64,
    accumulate: bool,
) {
    let actions: Vec<f64> = members.iter().map(|&id| agents[id].action).collect();
    for (slot, &id) in members.iter().enumerate() {
        let opponents: Vec<f64> = actions
            .iter()
            .enumerate()
            .filter(|(s, _)| *s != slot)
            .map(|(_, &q)| q)
            .collect();
        let agent = &mut agents[id];
        let payoff = group_payoff(PayoffKind::Payoff, agent.confidence, agent.action, &opponents, gamma);
        let fitness = group_payoff(PayoffKind::Fitness, agent.confidence, agent.action, &opponents, gamma);
        agent.period_payoff = payoff;
        agent.period_fitness = fitness;
        if accumulate {
            agent.cumulative_payoff += payoff;
            agent.cumulative_fitness += fitness;
        }
        agent.history.push(RoundRecord {
            epoch,
            round,
            group,
            gamma,
            confidence: agent.confidence,
            action: agent.action,
            opponent_actions: opponents,
            payoff,
            fitness,
        });
        log_round(id, epoch, round, agent.action, payoff, fitness);
    }
}

fn play_period(
    agents: &mut [Agent],
    groups: &[Vec<AgentId>],
    epoch: usize,
    round: usize,
    gamma: f64,
    accumulate: bool,
) {
    for (g, members) in groups.iter().enumerate() {
        score_group(agents, g, members, epoch, round, gamma, accumulate);
    }
}

/// Round 0: record the baseline with the current actions, then zero the accumulators.
pub fn begin_epoch(agents: &mut [Agent], groups: &[Vec<AgentId>], epoch: usize, gamma: f64) {
    log_epoch("epoch_start", epoch, groups.len(), agents.len());
    play_period(agents, groups, epoch, 0, gamma, false);
    for agent in agents.iter_mut() {
        agent.reset_accumulators();
    }
}

/// Score an incentivized round whose actions are already set.
pub fn apply_round(agents: &mut [Agent], groups: &[Vec<AgentId>], epoch: usize, round: usize, gamma: f64) {
    play_period(agents, groups, epoch, round, gamma, true);
}

/// Score one group once every member has submitted (live rendezvous).
pub fn apply_group_round(
    agents: &mut [Agent],
    group: usize,
    members: &[AgentId],
    epoch: usize,
    round: usize,
    gamma: f64,
) {
    score_group(agents, group, members, epoch, round, gamma, true);
}

/// Next action for every grouped agent from a snapshot of the previous period.
pub fn choose_actions<R: Rng + ?Sized>(
    agents: &mut [Agent],
    groups: &[Vec<AgentId>],
    rule: &dyn ChoiceRule,
    noise: &NoiseKind,
    gamma: f64,
    c: f64,
    rng: &mut R,
) {
    let previous: Vec<Neighbour> = agents
        .iter()
        .map(|a| Neighbour {
            confidence: a.confidence,
            action: a.action,
            payoff: a.period_payoff,
        })
        .collect();

    for members in groups {
        for &id in members {
            let neighbours: Vec<Neighbour> = members
                .iter()
                .filter(|&&o| o != id)
                .map(|&o| previous[o])
                .collect();
            let own = previous[id];
            let ctx = ChoiceContext {
                gamma,
                c,
                confidence: own.confidence,
                action: own.action,
                payoff: own.payoff,
                neighbours: &neighbours,
            };
            let q = rule.choose(&ctx) + noise.sample(rng);
            agents[id].action = clamp_action(q);
        }
    }
}

/// Close the epoch: bank payoffs and, on update epochs, evolve confidences.
pub fn finish_epoch<R: Rng + ?Sized>(
    agents: &mut [Agent],
    epoch: usize,
    evolve: bool,
    params: &EvolutionParams,
    rng: &mut R,
) -> Vec<UpdateOutcome> {
    for agent in agents.iter_mut() {
        agent.total_payoff += agent.cumulative_payoff;
    }
    log_epoch(if evolve { "epoch_end_update" } else { "epoch_end" }, epoch, 0, agents.len());
    if evolve {
        update_populations(agents, params, epoch, rng)
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub groups: Vec<Vec<AgentId>>,
    pub evolved: bool,
    pub outcomes: Vec<UpdateOutcome>,
}

/// Drives simulated epochs with a fixed choice rule.
pub struct Orchestrator {
    rule: Box<dyn ChoiceRule>,
    decision_noise: NoiseKind,
    evolution: EvolutionParams,
    gamma: f64,
    c: f64,
    num_periods: usize,
    evolution_every: usize,
    group_size: usize,
}

impl Orchestrator {
    pub fn new(
        rule: Box<dyn ChoiceRule>,
        decision_noise: NoiseKind,
        evolution: EvolutionParams,
        gamma: f64,
        num_periods: usize,
        evolution_every: usize,
        group_size: usize,
    ) -> Self {
        Self {
            rule,
            decision_noise,
            evolution,
            gamma,
            c: 1.0,
            num_periods,
            evolution_every: evolution_every.max(1),
            group_size,
        }
    }

    pub fn from_sim_config(cfg: &SimConfig) -> Self {
        let mut orch = Self::new(
            cfg.choice.build(),
            cfg.decision_noise,
            cfg.evolution_params(),
            cfg.gamma,
            cfg.num_periods,
            cfg.evolution_every,
            cfg.group_size,
        );
        orch.c = cfg.c;
        orch
    }

    pub fn rule_id(&self) -> &'static str {
        self.rule.id()
    }

    pub fn is_update_epoch(&self, epoch: usize) -> bool {
        epoch % self.evolution_every == 0
    }

    pub fn run_epoch<R: Rng + ?Sized>(
        &self,
        agents: &mut [Agent],
        epoch: usize,
        rng: &mut R,
    ) -> Result<EpochSummary> {
        let groups = draw_groups(agents, self.group_size, rng)?;
        log_groups(epoch, &groups);
        begin_epoch(agents, &groups, epoch, self.gamma);
        for round in 1..=self.num_periods {
            choose_actions(
                agents,
                &groups,
                self.rule.as_ref(),
                &self.decision_noise,
                self.gamma,
                self.c,
                rng,
            );
            apply_round(agents, &groups, epoch, round, self.gamma);
        }
        let evolved = self.is_update_epoch(epoch);
        let outcomes = finish_epoch(agents, epoch, evolved, &self.evolution, rng);
        Ok(EpochSummary {
            epoch,
            groups,
            evolved,
            outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choice::AlwaysHalf;
    use rand::{rngs::StdRng, SeedableRng};

    fn pair() -> Vec<Agent> {
        vec![Agent::new(0, 1, 1.5, 0.4), Agent::new(1, 1, 1.0, 0.3)]
    }

    #[test]
    fn round_zero_is_recorded_but_not_counted() {
        let mut agents = pair();
        let groups = vec![vec![0, 1]];
        begin_epoch(&mut agents, &groups, 0, 0.5);
        assert_eq!(agents[0].history.len(), 1);
        assert_eq!(agents[0].history[0].round, 0);
        assert!((agents[0].history[0].payoff - 38.0).abs() < 1e-9);
        assert_eq!(agents[0].cumulative_payoff, 0.0);
        assert_eq!(agents[0].cumulative_fitness, 0.0);
    }

    #[test]
    fn rounds_accumulate() {
        let mut agents = pair();
        let groups = vec![vec![0, 1]];
        begin_epoch(&mut agents, &groups, 0, 0.5);
        apply_round(&mut agents, &groups, 0, 1, 0.5);
        apply_round(&mut agents, &groups, 0, 2, 0.5);
        let per_round = agents[0].history[1].fitness;
        assert!((agents[0].cumulative_fitness - 2.0 * per_round).abs() < 1e-12);
        assert_eq!(agents[0].history.len(), 3);
        assert_eq!(agents[1].history[2].opponent_actions, vec![0.4]);
    }

    #[test]
    fn actions_are_clamped() {
        assert_eq!(clamp_action(1.3), 1.0);
        assert_eq!(clamp_action(-0.2), 0.0);
        assert_eq!(clamp_action(f64::NAN), 0.0);

        let mut agents = pair();
        let groups = vec![vec![0, 1]];
        let mut rng = StdRng::seed_from_u64(2);
        let noise = NoiseKind::symmetric(5.0);
        for _ in 0..100 {
            choose_actions(&mut agents, &groups, &AlwaysHalf, &noise, 0.5, 1.0, &mut rng);
            assert!(agents.iter().all(|a| (0.0..=1.0).contains(&a.action)));
        }
    }

    #[test]
    fn update_cadence_counts_from_epoch_zero() {
        let orch = Orchestrator::new(
            Box::new(AlwaysHalf),
            NoiseKind::None,
            EvolutionParams::default(),
            0.5,
            1,
            3,
            2,
        );
        assert!(orch.is_update_epoch(0));
        assert!(!orch.is_update_epoch(1));
        assert!(!orch.is_update_epoch(2));
        assert!(orch.is_update_epoch(3));
    }

    #[test]
    fn non_update_epochs_keep_confidence() {
        let orch = Orchestrator::new(
            Box::new(AlwaysHalf),
            NoiseKind::None,
            EvolutionParams::default(),
            0.5,
            2,
            2,
            2,
        );
        let mut agents = vec![
            Agent::new(0, 1, 0.7, 0.5),
            Agent::new(1, 1, 1.3, 0.5),
            Agent::new(2, 1, 0.9, 0.5),
            Agent::new(3, 1, 1.1, 0.5),
        ];
        let mut rng = StdRng::seed_from_u64(9);
        orch.run_epoch(&mut agents, 0, &mut rng).unwrap();
        let before: Vec<f64> = agents.iter().map(|a| a.confidence).collect();
        let summary = orch.run_epoch(&mut agents, 1, &mut rng).unwrap();
        assert!(!summary.evolved);
        assert!(summary.outcomes.is_empty());
        let after: Vec<f64> = agents.iter().map(|a| a.confidence).collect();
        assert_eq!(before, after);
        assert_eq!(agents[0].history.len(), 6);
    }
}
