//! Live experiment driver.
//!
//! Participants are split into fixed populations in arrival order. Every
//! supergame re-draws pairs inside each population, plays `num_periods`
//! periods through [`GroupSession`] rendezvous and finishes with an
//! imitation update of every population.

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::agent::{population_ids, Agent, AgentId, UpdateOutcome};
use crate::choice::{ChoiceContext, ChoiceRule, NashPlay, Neighbour};
use crate::config::LiveConfig;
use crate::logging::{log_epoch, log_groups};
use crate::orchestrator::{begin_epoch, clamp_action, finish_epoch};
use crate::pairing::{draw_groups, index_groups, population_for};
use crate::session::{GroupSession, Inbound, Outbound, Recipient};

/// Round `x` to `places` decimals.
pub fn round_to(x: f64, places: u32) -> f64 {
    let f = 10f64.powi(places as i32);
    (x * f).round() / f
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub population_id: u32,
    pub size: usize,
    pub mean_confidence: f64,
    pub mean_fitness: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupergameReport {
    pub supergame: usize,
    pub groups: Vec<Vec<AgentId>>,
    /// Points earned this supergame divided by the conversion rate.
    pub payments: Vec<f64>,
    pub populations: Vec<PopulationSummary>,
    pub outcomes: Vec<UpdateOutcome>,
}

pub struct LiveExperiment {
    cfg: LiveConfig,
    agents: Vec<Agent>,
    rng: StdRng,
    supergame: usize,
    groups: Vec<Vec<AgentId>>,
    slot_of: Vec<(usize, usize)>,
    sessions: Vec<GroupSession>,
}

impl LiveExperiment {
    pub fn new(cfg: LiveConfig) -> Result<Self> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let rounds = cfg.num_supergames * (cfg.num_periods + 1);
        let mut agents: Vec<Agent> = (0..cfg.num_participants)
            .map(|i| {
                Agent::new(i, population_for(i, cfg.population_size), 0.0, 0.0)
                    .with_history_capacity(rounds)
            })
            .collect();
        // Initial groups share one confidence draw.
        for chunk in agents.chunks_mut(cfg.group_size) {
            let confidence = draw_confidence(&cfg, &mut rng);
            for a in chunk {
                a.confidence = confidence;
            }
        }
        Ok(Self {
            cfg,
            agents,
            rng,
            supergame: 0,
            groups: Vec::new(),
            slot_of: Vec::new(),
            sessions: Vec::new(),
        })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn into_agents(self) -> Vec<Agent> {
        self.agents
    }

    /// Supergames finished so far.
    pub fn supergame(&self) -> usize {
        self.supergame
    }

    pub fn sessions(&self) -> &[GroupSession] {
        &self.sessions
    }

    pub fn is_complete(&self) -> bool {
        self.supergame >= self.cfg.num_supergames
    }

    /// Draw fresh actions and pairs, record the period-0 baseline and open sessions.
    pub fn start_supergame(&mut self) -> Result<()> {
        if self.is_complete() {
            bail!("all {} supergames already played", self.cfg.num_supergames);
        }
        if !self.sessions.is_empty() && !self.all_finished() {
            bail!("supergame {} still in progress", self.supergame);
        }
        let epoch = self.supergame;
        for a in self.agents.iter_mut() {
            a.action = round_to(self.rng.gen::<f64>(), self.cfg.action_decimal_places);
        }
        let groups = draw_groups(&self.agents, self.cfg.group_size, &mut self.rng)?;
        self.slot_of = index_groups(self.agents.len(), &groups)?;
        log_groups(epoch, &groups);

        if self.cfg.simulation {
            self.set_nash_actions(&groups);
        }
        begin_epoch(&mut self.agents, &groups, epoch, self.cfg.gamma);

        self.sessions = groups
            .iter()
            .enumerate()
            .map(|(g, members)| GroupSession::new(g, epoch, members.clone(), self.cfg.num_periods, self.cfg.gamma))
            .collect();
        self.groups = groups;
        Ok(())
    }

    fn set_nash_actions(&mut self, groups: &[Vec<AgentId>]) {
        for members in groups {
            let actions: Vec<f64> = members
                .iter()
                .map(|&id| nash_for(&self.agents, members, id, self.cfg.gamma))
                .collect();
            for (&id, q) in members.iter().zip(actions) {
                self.agents[id].action = clamp_action(q);
            }
        }
    }

    /// Route a client message to the session of `agent_id`.
    pub fn handle(&mut self, agent_id: AgentId, msg: Inbound) -> Result<Vec<(Recipient, Outbound)>> {
        let &(g, slot) = self
            .slot_of
            .get(agent_id)
            .ok_or_else(|| anyhow!("participant {} is not seated", agent_id))?;
        let session = self
            .sessions
            .get_mut(g)
            .ok_or_else(|| anyhow!("no session for group {}", g))?;
        Ok(session.handle(&mut self.agents, slot, msg)?)
    }

    pub fn all_finished(&self) -> bool {
        self.sessions.iter().all(|s| s.finished())
    }

    /// Update every population, bank supergame payoffs and report.
    pub fn finish_supergame(&mut self) -> Result<SupergameReport> {
        if self.sessions.is_empty() || !self.all_finished() {
            bail!("supergame {} has unfinished groups", self.supergame);
        }
        let epoch = self.supergame;
        let payments: Vec<f64> = self
            .agents
            .iter()
            .map(|a| a.cumulative_payoff / self.cfg.conversion_rate)
            .collect();
        let populations = summarize(&self.agents);
        let params = self.cfg.evolution_params();
        let outcomes = finish_epoch(&mut self.agents, epoch, true, &params, &mut self.rng);
        log_epoch("supergame_end", epoch, self.sessions.len(), self.agents.len());

        self.sessions.clear();
        self.supergame += 1;
        Ok(SupergameReport {
            supergame: epoch,
            groups: std::mem::take(&mut self.groups),
            payments,
            populations,
            outcomes,
        })
    }

    /// Headless supergame where every member plays the equilibrium action.
    pub fn play_simulated_supergame(&mut self) -> Result<SupergameReport> {
        self.start_supergame()?;
        let ids: Vec<AgentId> = (0..self.agents.len()).collect();
        for &id in &ids {
            self.handle(id, Inbound::Ready)?;
        }
        for _ in 0..self.cfg.num_periods {
            for members in self.groups.clone() {
                for &id in &members {
                    let q = nash_for(&self.agents, &members, id, self.cfg.gamma);
                    let action = round_to(clamp_action(q), self.cfg.action_decimal_places);
                    self.handle(id, Inbound::Update { action })?;
                }
            }
        }
        self.finish_supergame()
    }

    pub fn run_simulated(&mut self) -> Result<Vec<SupergameReport>> {
        let mut reports = Vec::with_capacity(self.cfg.num_supergames);
        while !self.is_complete() {
            reports.push(self.play_simulated_supergame()?);
        }
        Ok(reports)
    }

    /// Total points over all supergames converted to currency, plus the fee.
    pub fn final_payments(&self) -> Vec<f64> {
        self.agents
            .iter()
            .map(|a| a.total_payoff / self.cfg.conversion_rate + self.cfg.participation_fee)
            .collect()
    }
}

fn draw_confidence<R: Rng + ?Sized>(cfg: &LiveConfig, rng: &mut R) -> f64 {
    if cfg.initial_confidence_upper > cfg.initial_confidence_lower {
        rng.gen_range(cfg.initial_confidence_lower..=cfg.initial_confidence_upper)
    } else {
        cfg.initial_confidence_lower
    }
}

fn nash_for(agents: &[Agent], members: &[AgentId], id: AgentId, gamma: f64) -> f64 {
    let neighbours: Vec<Neighbour> = members
        .iter()
        .filter(|&&o| o != id)
        .map(|&o| Neighbour {
            confidence: agents[o].confidence,
            action: agents[o].action,
            payoff: agents[o].period_payoff,
        })
        .collect();
    let me = &agents[id];
    NashPlay.choose(&ChoiceContext {
        gamma,
        c: 1.0,
        confidence: me.confidence,
        action: me.action,
        payoff: me.period_payoff,
        neighbours: &neighbours,
    })
}

fn summarize(agents: &[Agent]) -> Vec<PopulationSummary> {
    population_ids(agents)
        .into_iter()
        .map(|pid| {
            let members: Vec<&Agent> = agents.iter().filter(|a| a.population_id == pid).collect();
            let n = members.len().max(1) as f64;
            PopulationSummary {
                population_id: pid,
                size: members.len(),
                mean_confidence: members.iter().map(|a| a.confidence).sum::<f64>() / n,
                mean_fitness: members.iter().map(|a| a.cumulative_fitness).sum::<f64>() / n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(simulation: bool) -> LiveConfig {
        LiveConfig {
            num_participants: 8,
            population_size: 4,
            num_supergames: 3,
            num_periods: 2,
            simulation,
            ..LiveConfig::default()
        }
    }

    #[test]
    fn initial_groups_share_confidence() {
        let exp = LiveExperiment::new(small(false)).unwrap();
        let a = exp.agents();
        assert_eq!(a[0].confidence, a[1].confidence);
        assert_eq!(a[6].confidence, a[7].confidence);
        assert!(a.iter().all(|x| (0.5..=1.5).contains(&x.confidence)));
        assert_eq!(a[3].population_id, 1);
        assert_eq!(a[4].population_id, 2);
    }

    #[test]
    fn initial_actions_are_rounded() {
        let mut exp = LiveExperiment::new(small(false)).unwrap();
        exp.start_supergame().unwrap();
        for a in exp.agents() {
            assert_eq!(a.action, round_to(a.action, 3));
            assert_eq!(a.history.len(), 1);
        }
    }

    #[test]
    fn cannot_finish_early() {
        let mut exp = LiveExperiment::new(small(false)).unwrap();
        exp.start_supergame().unwrap();
        assert!(exp.finish_supergame().is_err());
        assert!(exp.start_supergame().is_err());
    }

    #[test]
    fn simulated_run_completes() {
        let mut exp = LiveExperiment::new(small(true)).unwrap();
        let reports = exp.run_simulated().unwrap();
        assert_eq!(reports.len(), 3);
        assert!(exp.is_complete());
        for r in &reports {
            assert_eq!(r.outcomes.len(), 8);
            assert_eq!(r.populations.len(), 2);
            for g in &r.groups {
                assert_eq!(exp.agents()[g[0]].population_id, exp.agents()[g[1]].population_id);
            }
        }
        // baseline plus two periods per supergame
        assert!(exp.agents().iter().all(|a| a.history.len() == 9));
        let total: f64 = reports.iter().map(|r| r.payments[0]).sum();
        let paid = exp.final_payments()[0];
        assert!((paid - (total + 6.0)).abs() < 1e-9);
        assert!(exp.play_simulated_supergame().is_err());
    }

    #[test]
    fn routing_rejects_unknown_participants() {
        let mut exp = LiveExperiment::new(small(false)).unwrap();
        exp.start_supergame().unwrap();
        assert!(exp.handle(99, Inbound::Ready).is_err());
    }
}
