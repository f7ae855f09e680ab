//! Batch simulation over independent markets.
//!
//! Each market is one population of `num_players` managers with its own RNG
//! stream, so results depend only on the seed and the market index, never on
//! how markets are spread over worker threads.

use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::agent::Agent;
use crate::config::SimConfig;
use crate::logging::{log_run_summary, ProfileScope};
use crate::orchestrator::Orchestrator;
use crate::stats::{round_stats, RoundStats};

pub fn market_seed(seed: u64, market: usize) -> u64 {
    seed.wrapping_add((market as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn draw<R: Rng + ?Sized>(rng: &mut R, lower: f64, upper: f64) -> f64 {
    if upper > lower {
        rng.gen_range(lower..=upper)
    } else {
        lower
    }
}

/// Fresh managers for one market; market `i` is population `i + 1`.
pub fn seed_market<R: Rng + ?Sized>(cfg: &SimConfig, market: usize, rng: &mut R) -> Vec<Agent> {
    let rounds = (cfg.num_periods + 1) * cfg.num_epochs;
    (0..cfg.num_players)
        .map(|i| {
            let confidence = draw(rng, cfg.initial_confidence_lower, cfg.initial_confidence_upper);
            let action = draw(rng, cfg.initial_action_lower, cfg.initial_action_upper);
            Agent::new(i, market as u32 + 1, confidence, action).with_history_capacity(rounds)
        })
        .collect()
}

pub fn run_market(cfg: &SimConfig, orch: &Orchestrator, market: usize) -> Result<Vec<Agent>> {
    let mut rng = StdRng::seed_from_u64(market_seed(cfg.seed, market));
    let mut agents = seed_market(cfg, market, &mut rng);
    for epoch in 0..cfg.num_epochs {
        orch.run_epoch(&mut agents, epoch, &mut rng)?;
    }
    Ok(agents)
}

pub fn worker_count(cfg: &SimConfig) -> usize {
    let cpus = num_cpus::get().max(1);
    let wanted = if cfg.threads == 0 { cpus } else { cfg.threads.min(cpus) };
    wanted.clamp(1, cfg.num_markets.max(1))
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub params_hash: String,
    pub choice_rule: String,
    pub num_markets: usize,
    pub num_players: usize,
    pub num_epochs: usize,
    pub workers: usize,
    pub final_mean_confidence: f64,
    pub final_mean_action: f64,
    pub market_final_confidence: Vec<f64>,
    pub selections: usize,
    pub elapsed_ms: u128,
}

impl SimulationReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

pub struct SimulationOutcome {
    pub markets: Vec<Vec<Agent>>,
    pub report: SimulationReport,
}

impl SimulationOutcome {
    pub fn round_stats(&self) -> Vec<RoundStats> {
        round_stats(&self.markets)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn run(cfg: &SimConfig) -> Result<SimulationOutcome> {
    cfg.validate()?;
    let _scope = ProfileScope::new("simulation_run");
    let started = Instant::now();
    let orch = Orchestrator::from_sim_config(cfg);
    let workers = worker_count(cfg);

    let mut slots: Vec<Option<Vec<Agent>>> = (0..cfg.num_markets).map(|_| None).collect();
    thread::scope(|s| -> Result<()> {
        let orch = &orch;
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                s.spawn(move || -> Result<Vec<(usize, Vec<Agent>)>> {
                    (w..cfg.num_markets)
                        .step_by(workers)
                        .map(|m| run_market(cfg, orch, m).map(|agents| (m, agents)))
                        .collect()
                })
            })
            .collect();
        for h in handles {
            let done = h.join().map_err(|_| anyhow!("market worker panicked"))??;
            for (m, agents) in done {
                slots[m] = Some(agents);
            }
        }
        Ok(())
    })?;

    let markets: Vec<Vec<Agent>> = slots
        .into_iter()
        .enumerate()
        .map(|(m, a)| a.ok_or_else(|| anyhow!("market {} produced no result", m)))
        .collect::<Result<_>>()?;

    let market_final_confidence: Vec<f64> = markets
        .iter()
        .map(|agents| mean(agents.iter().map(|a| a.confidence)))
        .collect();
    let final_mean_confidence = mean(market_final_confidence.iter().copied());
    let final_mean_action = mean(markets.iter().flat_map(|m| m.iter()).map(|a| a.action));
    let selections = markets
        .iter()
        .flat_map(|m| m.iter())
        .map(|a| a.updates.iter().filter(|u| u.selected).count())
        .sum();

    let params_hash = cfg.fingerprint();
    log_run_summary(
        "simulation",
        &params_hash,
        cfg.num_epochs,
        cfg.num_markets * cfg.num_players,
        final_mean_confidence,
    );

    let report = SimulationReport {
        params_hash,
        choice_rule: orch.rule_id().to_string(),
        num_markets: cfg.num_markets,
        num_players: cfg.num_players,
        num_epochs: cfg.num_epochs,
        workers,
        final_mean_confidence,
        final_mean_action,
        market_final_confidence,
        selections,
        elapsed_ms: started.elapsed().as_millis(),
    };
    Ok(SimulationOutcome { markets, report })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> SimConfig {
        SimConfig {
            num_players: 4,
            num_markets: 3,
            num_epochs: 6,
            evolution_every: 2,
            group_size: 4,
            ..SimConfig::default()
        }
    }

    #[test]
    fn market_seeds_differ() {
        assert_ne!(market_seed(42, 0), market_seed(42, 1));
        assert_eq!(market_seed(42, 0), 42);
    }

    #[test]
    fn history_is_presized() {
        let cfg = tiny();
        let mut rng = StdRng::seed_from_u64(0);
        let agents = seed_market(&cfg, 2, &mut rng);
        assert_eq!(agents.len(), 4);
        assert!(agents.iter().all(|a| a.population_id == 3));
        assert!(agents.iter().all(|a| a.history.capacity() >= 12));
        assert!(agents.iter().all(|a| (0.5..=1.5).contains(&a.confidence)));
    }

    #[test]
    fn run_produces_full_histories() {
        let out = run(&tiny()).unwrap();
        assert_eq!(out.markets.len(), 3);
        for m in &out.markets {
            for a in m {
                assert_eq!(a.history.len(), 12);
                // updates on epochs 0, 2 and 4
                assert_eq!(a.updates.len(), 3);
            }
        }
        assert_eq!(out.round_stats().len(), 12);
        assert!(out.report.to_json().contains("final_mean_confidence"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = SimConfig { group_size: 3, ..tiny() };
        assert!(run(&cfg).is_err());
    }
}
