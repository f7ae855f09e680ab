//! Imitation dynamics.
//!
//! At an update point every population is processed on its own:
//!
//! 1. rank managers by epoch fitness (ties broken by a random permutation),
//! 2. map rank to a selection probability,
//! 3. weight imitation targets by how far their fitness exceeds the mean,
//! 4. each selected manager copies a target's pre-update confidence plus noise.
//!
//! Reads of other managers' confidence always go through a snapshot taken
//! before the first write, so iteration order never leaks into the result.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::agent::{population_ids, Agent, UpdateOutcome};
use crate::logging::{log_population_update, log_selection};
use crate::noise::NoiseKind;

/// How an imitation target is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Fitness-weighted random peer.
    WeightedAverage,
    /// The single top-ranked peer.
    Best,
}

impl Mechanism {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "weighted_average" | "weighted" => Some(Mechanism::WeightedAverage),
            "best" => Some(Mechanism::Best),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::WeightedAverage => "weighted_average",
            Mechanism::Best => "best",
        }
    }
}

/// Orientation of the rank before it is mapped to a selection probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    /// rank = number of peers with strictly lower fitness (best manager ranks highest).
    Ascending,
    /// rank = number of peers with strictly higher fitness (best manager ranks 0).
    Descending,
}

/// Linear rank-to-probability map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionSchedule {
    pub min: f64,
    pub max: f64,
}

impl Default for SelectionSchedule {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl SelectionSchedule {
    /// Probability for `rank` in a population of `size`. A lone manager is never selected.
    pub fn probability(&self, rank: usize, size: usize) -> f64 {
        if size < 2 {
            return 0.0;
        }
        self.min + (self.max - self.min) * (rank as f64 / (size - 1) as f64)
    }
}

/// What to do with a too-low imitated confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowClamp {
    Floor,
    /// Legacy branch: a too-low value is set to the maximum.
    Ceiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitBounds {
    pub clamp: bool,
    pub min: f64,
    pub max: f64,
    pub low_clamp: LowClamp,
}

impl Default for TraitBounds {
    fn default() -> Self {
        Self {
            clamp: false,
            min: 0.0,
            max: 2.0,
            low_clamp: LowClamp::Floor,
        }
    }
}

impl TraitBounds {
    pub fn apply(&self, value: f64) -> f64 {
        if !self.clamp {
            return value;
        }
        if value > self.max {
            self.max
        } else if value < self.min {
            match self.low_clamp {
                LowClamp::Floor => self.min,
                LowClamp::Ceiling => self.max,
            }
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvolutionParams {
    pub mechanism: Mechanism,
    pub rank_order: RankOrder,
    pub selection: SelectionSchedule,
    pub trait_noise: NoiseKind,
    pub bounds: TraitBounds,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self {
            mechanism: Mechanism::WeightedAverage,
            rank_order: RankOrder::Ascending,
            selection: SelectionSchedule::default(),
            trait_noise: NoiseKind::symmetric(0.1),
            bounds: TraitBounds::default(),
        }
    }
}

/// Ranks with random tie-breaking; the result is a permutation of `0..n`.
pub fn rank_with_ties<R: Rng + ?Sized>(fitness: &[f64], order: RankOrder, rng: &mut R) -> Vec<usize> {
    let n = fitness.len();
    let base: Vec<usize> = fitness
        .iter()
        .map(|&f| match order {
            RankOrder::Ascending => fitness.iter().filter(|&&g| g < f).count(),
            RankOrder::Descending => fitness.iter().filter(|&&g| f < g).count(),
        })
        .collect();

    let mut ranks = base.clone();
    for r in 0..n {
        let tied: Vec<usize> = (0..n).filter(|&i| base[i] == r).collect();
        if tied.len() > 1 {
            let mut offsets: Vec<usize> = (0..tied.len()).collect();
            offsets.shuffle(rng);
            for (&i, off) in tied.iter().zip(offsets) {
                ranks[i] += off;
            }
        }
    }
    ranks
}

/// `max(0, f - mean)` per manager; all-zero weights fall back to uniform.
///
/// Returns the weights and whether the fallback fired.
pub fn imitation_weights(fitness: &[f64], mean: f64) -> (Vec<f64>, bool) {
    let weights: Vec<f64> = fitness.iter().map(|&f| (f - mean).max(0.0)).collect();
    if weights.iter().all(|&w| w == 0.0) {
        (vec![1.0; fitness.len()], true)
    } else {
        (weights, false)
    }
}

/// Update every manager of one population. `population` must share a population id.
pub fn update_population<R: Rng + ?Sized>(
    population: &mut [Agent],
    params: &EvolutionParams,
    epoch: usize,
    rng: &mut R,
) -> Vec<UpdateOutcome> {
    let members: Vec<usize> = (0..population.len()).collect();
    update_members(population, &members, params, epoch, rng)
}

/// Update each population in `agents` independently, in ascending population id.
pub fn update_populations<R: Rng + ?Sized>(
    agents: &mut [Agent],
    params: &EvolutionParams,
    epoch: usize,
    rng: &mut R,
) -> Vec<UpdateOutcome> {
    let mut outcomes = Vec::with_capacity(agents.len());
    for pid in population_ids(agents) {
        let members: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.population_id == pid)
            .map(|(i, _)| i)
            .collect();
        outcomes.extend(update_members(agents, &members, params, epoch, rng));
    }
    outcomes
}

fn update_members<R: Rng + ?Sized>(
    agents: &mut [Agent],
    members: &[usize],
    params: &EvolutionParams,
    epoch: usize,
    rng: &mut R,
) -> Vec<UpdateOutcome> {
    let n = members.len();
    if n == 0 {
        return Vec::new();
    }

    let fitness: Vec<f64> = members.iter().map(|&i| agents[i].cumulative_fitness).collect();
    let avg_fitness = fitness.iter().sum::<f64>() / n as f64;
    let ranks = rank_with_ties(&fitness, params.rank_order, rng);
    let probs: Vec<f64> = ranks
        .iter()
        .map(|&r| params.selection.probability(r, n))
        .collect();
    let (weights, uniform_fallback) = imitation_weights(&fitness, avg_fitness);
    let weight_sum: f64 = weights.iter().sum();

    let snapshot: Vec<f64> = members.iter().map(|&i| agents[i].confidence).collect();
    let sampler = WeightedIndex::new(&weights).ok();
    let best = (0..n)
        .find(|&k| match params.rank_order {
            RankOrder::Ascending => ranks[k] == n - 1,
            RankOrder::Descending => ranks[k] == 0,
        })
        .unwrap_or(0);

    let mut outcomes = Vec::with_capacity(n);
    for (k, &idx) in members.iter().enumerate() {
        let selected = n > 1 && {
            let u: f64 = rng.gen();
            !(u > probs[k])
        };

        let (target, next_confidence) = if selected {
            let t = match params.mechanism {
                Mechanism::WeightedAverage => match &sampler {
                    Some(dist) => dist.sample(rng),
                    None => rng.gen_range(0..n),
                },
                Mechanism::Best => best,
            };
            let drawn = snapshot[t] + params.trait_noise.sample(rng);
            (Some(t), params.bounds.apply(drawn))
        } else {
            (None, snapshot[k])
        };

        let agent = &agents[idx];
        let outcome = UpdateOutcome {
            agent_id: agent.id,
            population_id: agent.population_id,
            epoch,
            fitness: fitness[k],
            rank: ranks[k],
            prob_selection: probs[k],
            weight: weights[k],
            prob_imitation_target: weights[k] / weight_sum,
            selected,
            imitation_target: target.map(|t| agents[members[t]].id),
            previous_confidence: snapshot[k],
            next_confidence,
        };
        log_selection(&outcome);
        outcomes.push(outcome);
    }

    for (outcome, &idx) in outcomes.iter().zip(members) {
        let agent = &mut agents[idx];
        agent.confidence = outcome.next_confidence;
        agent.updates.push(outcome.clone());
    }

    let selected = outcomes.iter().filter(|o| o.selected).count();
    let population_id = agents[members[0]].population_id;
    log_population_update(population_id, epoch, n, avg_fitness, selected, uniform_fallback);
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn population(fitness: &[f64]) -> Vec<Agent> {
        fitness
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let mut a = Agent::new(i, 1, 0.5 + i as f64 * 0.25, 0.5);
                a.cumulative_fitness = f;
                a
            })
            .collect()
    }

    #[test]
    fn distinct_fitness_ranks_ascending() {
        let mut rng = StdRng::seed_from_u64(1);
        let ranks = rank_with_ties(&[10.0, 20.0, 5.0, 25.0], RankOrder::Ascending, &mut rng);
        assert_eq!(ranks, vec![1, 2, 0, 3]);
    }

    #[test]
    fn descending_order_puts_best_at_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let ranks = rank_with_ties(&[10.0, 20.0, 5.0, 25.0], RankOrder::Descending, &mut rng);
        assert_eq!(ranks, vec![2, 1, 3, 0]);
    }

    #[test]
    fn ties_become_a_permutation() {
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ranks = rank_with_ties(&[3.0, 1.0, 3.0, 3.0, 0.0], RankOrder::Ascending, &mut rng);
            assert_eq!(ranks[1], 1);
            assert_eq!(ranks[4], 0);
            let mut tied = vec![ranks[0], ranks[2], ranks[3]];
            tied.sort_unstable();
            assert_eq!(tied, vec![2, 3, 4]);
            ranks.sort_unstable();
            assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn selection_probability_is_linear_in_rank() {
        let s = SelectionSchedule::default();
        assert_eq!(s.probability(0, 4), 0.0);
        assert!((s.probability(1, 4) - 1.0 / 3.0).abs() < 1e-12);
        assert!((s.probability(2, 4) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(s.probability(3, 4), 1.0);
        assert_eq!(s.probability(0, 1), 0.0);

        let narrow = SelectionSchedule { min: 0.2, max: 0.8 };
        assert!((narrow.probability(0, 3) - 0.2).abs() < 1e-12);
        assert!((narrow.probability(1, 3) - 0.5).abs() < 1e-12);
        assert!((narrow.probability(2, 3) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn weights_fall_back_to_uniform() {
        let (w, fallback) = imitation_weights(&[4.0, 4.0, 4.0], 4.0);
        assert!(fallback);
        assert_eq!(w, vec![1.0, 1.0, 1.0]);

        let (w, fallback) = imitation_weights(&[10.0, 20.0, 5.0, 25.0], 15.0);
        assert!(!fallback);
        assert_eq!(w, vec![0.0, 5.0, 0.0, 10.0]);
    }

    #[test]
    fn bounds_clamp_and_legacy_low_branch() {
        let mut b = TraitBounds { clamp: true, min: 0.5, max: 1.5, low_clamp: LowClamp::Floor };
        assert_eq!(b.apply(2.0), 1.5);
        assert_eq!(b.apply(0.1), 0.5);
        assert_eq!(b.apply(1.0), 1.0);
        b.low_clamp = LowClamp::Ceiling;
        assert_eq!(b.apply(0.1), 1.5);
        b.clamp = false;
        assert_eq!(b.apply(0.1), 0.1);
    }

    #[test]
    fn best_agent_is_always_selected() {
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut pop = population(&[10.0, 20.0, 5.0, 25.0]);
            let outcomes = update_population(&mut pop, &EvolutionParams::default(), 0, &mut rng);
            assert!(outcomes[3].selected);
            assert_eq!(outcomes[3].prob_selection, 1.0);
            // only managers above the mean can be targets
            let target = outcomes[3].imitation_target.unwrap();
            assert!(target == 1 || target == 3);
        }
    }

    #[test]
    fn worst_agent_keeps_its_confidence() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut pop = population(&[10.0, 20.0, 5.0, 25.0]);
        let before = pop[2].confidence;
        let outcomes = update_population(&mut pop, &EvolutionParams::default(), 0, &mut rng);
        assert!(!outcomes[2].selected);
        assert_eq!(pop[2].confidence.to_bits(), before.to_bits());
    }

    #[test]
    fn lone_manager_is_never_selected() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut pop = population(&[7.0]);
        let outcomes = update_population(&mut pop, &EvolutionParams::default(), 0, &mut rng);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].selected);
        assert_eq!(outcomes[0].prob_selection, 0.0);
        assert_eq!(pop[0].confidence, 0.5);
    }

    #[test]
    fn best_mechanism_targets_top_rank() {
        let params = EvolutionParams {
            mechanism: Mechanism::Best,
            trait_noise: NoiseKind::None,
            ..EvolutionParams::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut pop = population(&[10.0, 20.0, 5.0, 25.0]);
        let top = pop[3].confidence;
        let outcomes = update_population(&mut pop, &params, 0, &mut rng);
        for o in outcomes.iter().filter(|o| o.selected) {
            assert_eq!(o.imitation_target, Some(3));
            assert_eq!(o.next_confidence, top);
        }
    }

    #[test]
    fn populations_do_not_mix() {
        let mut agents = population(&[1.0, 2.0, 3.0, 4.0]);
        agents[2].population_id = 2;
        agents[3].population_id = 2;
        let mut rng = StdRng::seed_from_u64(8);
        let outcomes = update_populations(&mut agents, &EvolutionParams::default(), 0, &mut rng);
        for o in outcomes.iter() {
            if let Some(t) = o.imitation_target {
                assert_eq!(agents[t].population_id, o.population_id);
            }
        }
        assert_eq!(outcomes.iter().filter(|o| o.population_id == 1).count(), 2);
    }
}
