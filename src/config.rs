use std::str::FromStr;

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::choice::ChoiceKind;
use crate::evolution::{EvolutionParams, LowClamp, Mechanism, RankOrder, SelectionSchedule, TraitBounds};
use crate::logging::{log_config_default, log_config_invalid, params_hash};
use crate::noise::NoiseKind;

/// Where parameters are read from. Every key has a default; absence is logged, never fatal.
pub enum ParamSource<'a> {
    Env,
    Map(&'a Map<String, Value>),
}

impl<'a> ParamSource<'a> {
    fn get<T>(&self, key: &str, env_key: &str, default: T) -> T
    where
        T: FromStr + DeserializeOwned + Serialize,
    {
        let shown = || serde_json::to_value(&default).unwrap_or(Value::Null);
        match self {
            ParamSource::Env => match std::env::var(env_key) {
                Err(_) => {
                    log_config_default(env_key, &shown());
                    default
                }
                Ok(raw) => match raw.trim().parse::<T>() {
                    Ok(v) => v,
                    Err(_) => {
                        log_config_invalid(env_key, &raw, &shown());
                        default
                    }
                },
            },
            ParamSource::Map(map) => match map.get(key) {
                None => {
                    log_config_default(key, &shown());
                    default
                }
                Some(v) => match serde_json::from_value::<T>(v.clone()) {
                    Ok(v) => v,
                    Err(_) => {
                        log_config_invalid(key, &v.to_string(), &shown());
                        default
                    }
                },
            },
        }
    }

    fn get_bool(&self, key: &str, env_key: &str, default: bool) -> bool {
        match self {
            ParamSource::Env => resolve(std::env::var(env_key).ok(), default, parse_flag).finish(env_key),
            ParamSource::Map(_) => self.get(key, env_key, default),
        }
    }

    fn get_named<T: Serialize>(
        &self,
        key: &str,
        env_key: &str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        match self {
            ParamSource::Env => resolve(std::env::var(env_key).ok(), default, parse).finish(env_key),
            ParamSource::Map(map) => {
                let raw = map.get(key).map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                resolve(raw, default, parse).finish(key)
            }
        }
    }
}

/// Outcome of reading one textual parameter, logged by `finish`.
#[derive(Debug, PartialEq)]
enum Resolved<T> {
    Given(T),
    Missing { value: T, shown: Value },
    Invalid { value: T, raw: String, shown: Value },
}

impl<T> Resolved<T> {
    fn finish(self, name: &str) -> T {
        match self {
            Resolved::Given(v) => v,
            Resolved::Missing { value, shown } => {
                log_config_default(name, &shown);
                value
            }
            Resolved::Invalid { value, raw, shown } => {
                log_config_invalid(name, &raw, &shown);
                value
            }
        }
    }
}

fn resolve<T: Serialize>(raw: Option<String>, default: T, parse: impl Fn(&str) -> Option<T>) -> Resolved<T> {
    let shown = serde_json::to_value(&default).unwrap_or(Value::Null);
    match raw {
        Some(raw) if !raw.trim().is_empty() => match parse(&raw) {
            Some(v) => Resolved::Given(v),
            None => Resolved::Invalid { value: default, raw, shown },
        },
        _ => Resolved::Missing { value: default, shown },
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_noise_name(s: &str) -> Option<&'static str> {
    match s.trim().to_lowercase().as_str() {
        "uniform" | "uniform_noise" => Some("uniform"),
        "normal" | "normal_noise" => Some("normal"),
        "none" => Some("none"),
        _ => None,
    }
}

fn build_noise(kind: &str, lower: f64, upper: f64, mean: f64, std_dev: f64) -> NoiseKind {
    match kind {
        "normal" => NoiseKind::Normal { mean, std_dev },
        "none" => NoiseKind::None,
        _ => NoiseKind::Uniform { lower, upper },
    }
}

fn read_bounds(src: &ParamSource<'_>) -> TraitBounds {
    let legacy_low = src.get_bool("legacy_low_clamp", "LEGACY_LOW_CLAMP", false);
    TraitBounds {
        clamp: src.get_bool("clamp_confidence", "CLAMP_CONFIDENCE", false),
        min: src.get("min_confidence", "MIN_CONFIDENCE", 0.0),
        max: src.get("max_confidence", "MAX_CONFIDENCE", 2.0),
        low_clamp: if legacy_low { LowClamp::Ceiling } else { LowClamp::Floor },
    }
}

fn read_rank_order(src: &ParamSource<'_>) -> RankOrder {
    src.get_named("rank_order", "RANK_ORDER", RankOrder::Ascending, |s| {
        match s.trim().to_lowercase().as_str() {
            "ascending" => Some(RankOrder::Ascending),
            "descending" => Some(RankOrder::Descending),
            _ => None,
        }
    })
}

// =============================================================================
// Batch simulation
// =============================================================================

/// Immutable parameters of one batch simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Managers per market (`n`).
    pub num_players: usize,
    /// Independent markets (`m`); each market is one population.
    pub num_markets: usize,
    /// Epochs to run (`t`).
    pub num_epochs: usize,
    /// Incentivized periods per epoch after the round-0 baseline.
    pub num_periods: usize,
    /// Evolution fires on epochs where `epoch % evolution_every == 0`.
    pub evolution_every: usize,
    /// Members per stage-game group; equal to `num_players` for market-wide play.
    pub group_size: usize,
    pub gamma: f64,
    pub c: f64,
    pub initial_confidence_lower: f64,
    pub initial_confidence_upper: f64,
    pub initial_action_lower: f64,
    pub initial_action_upper: f64,
    pub decision_noise: NoiseKind,
    pub trait_noise: NoiseKind,
    pub choice: ChoiceKind,
    pub mechanism: Mechanism,
    pub rank_order: RankOrder,
    pub selection: SelectionSchedule,
    pub bounds: TraitBounds,
    pub seed: u64,
    /// Worker threads for markets; 0 means one per CPU.
    pub threads: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_players: 4,
            num_markets: 50,
            num_epochs: 150,
            num_periods: 1,
            evolution_every: 5,
            group_size: 4,
            gamma: 0.5,
            c: 1.0,
            initial_confidence_lower: 0.5,
            initial_confidence_upper: 1.5,
            initial_action_lower: 0.0,
            initial_action_upper: 1.0,
            decision_noise: NoiseKind::symmetric(0.1),
            trait_noise: NoiseKind::symmetric(0.1),
            choice: ChoiceKind::AlwaysHalf,
            mechanism: Mechanism::Best,
            rank_order: RankOrder::Ascending,
            selection: SelectionSchedule { min: 0.0, max: 0.8 },
            bounds: TraitBounds::default(),
            seed: 42,
            threads: 0,
        }
    }
}

impl SimConfig {
    pub fn from_env() -> Self {
        Self::read(&ParamSource::Env)
    }

    /// Reads the legacy simulation parameter object (`n`, `m`, `t`, `gamma`, ...).
    pub fn from_params(params: &Map<String, Value>) -> Self {
        Self::read(&ParamSource::Map(params))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        match value {
            Value::Object(map) => Ok(Self::from_params(&map)),
            _ => bail!("simulation parameters must be a JSON object"),
        }
    }

    fn read(src: &ParamSource<'_>) -> Self {
        let d = Self::default();
        let num_players = src.get("n", "SIM_PLAYERS", d.num_players);
        let noise_name = src.get_named("noise_func", "NOISE_FUNC", "uniform", parse_noise_name);
        let lower = src.get("noise_uniform_lower", "NOISE_UNIFORM_LOWER", -0.1);
        let upper = src.get("noise_uniform_upper", "NOISE_UNIFORM_UPPER", 0.1);
        let mean = src.get("noise_normal_mean", "NOISE_NORMAL_MEAN", 0.0);
        // legacy key name; the value is used as a standard deviation
        let std_dev = src.get("noise_normal_variance", "NOISE_NORMAL_VARIANCE", 0.1);
        let noise = build_noise(noise_name, lower, upper, mean, std_dev);

        Self {
            num_players,
            num_markets: src.get("m", "SIM_MARKETS", d.num_markets),
            num_epochs: src.get("t", "SIM_EPOCHS", d.num_epochs),
            num_periods: src.get("num_periods", "SIM_PERIODS", d.num_periods),
            evolution_every: src.get("evolution_every_x_rounds", "EVOLUTION_EVERY", d.evolution_every),
            group_size: src.get("group_size", "GROUP_SIZE", num_players),
            gamma: src.get("gamma", "GAMMA", d.gamma),
            c: src.get("c", "SCALAR_C", d.c),
            initial_confidence_lower: src.get("a_min", "A_MIN", d.initial_confidence_lower),
            initial_confidence_upper: src.get("a_max", "A_MAX", d.initial_confidence_upper),
            initial_action_lower: src.get("q_min", "Q_MIN", d.initial_action_lower),
            initial_action_upper: src.get("q_max", "Q_MAX", d.initial_action_upper),
            decision_noise: noise,
            trait_noise: noise,
            choice: src.get_named("choice_func", "CHOICE_FUNC", d.choice, ChoiceKind::parse),
            mechanism: src.get_named("evo_mech", "EVO_MECH", d.mechanism, Mechanism::parse),
            rank_order: read_rank_order(src),
            selection: SelectionSchedule {
                min: src.get("prob_evolv_min", "PROB_EVOLV_MIN", d.selection.min),
                max: src.get("prob_evolv_max", "PROB_EVOLV_MAX", d.selection.max),
            },
            bounds: read_bounds(src),
            seed: src.get("seed", "SEED", d.seed),
            threads: src.get("threads", "SIM_THREADS", d.threads),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_players == 0 || self.num_markets == 0 {
            bail!("need at least one market with one player");
        }
        if self.group_size == 0 || self.num_players % self.group_size != 0 {
            bail!(
                "group_size {} must divide players per market {}",
                self.group_size,
                self.num_players
            );
        }
        if self.evolution_every == 0 {
            bail!("evolution_every must be at least 1");
        }
        if self.initial_confidence_upper < self.initial_confidence_lower
            || self.initial_action_upper < self.initial_action_lower
        {
            bail!("initial draw ranges are inverted");
        }
        Ok(())
    }

    pub fn evolution_params(&self) -> EvolutionParams {
        EvolutionParams {
            mechanism: self.mechanism,
            rank_order: self.rank_order,
            selection: self.selection,
            trait_noise: self.trait_noise,
            bounds: self.bounds,
        }
    }

    pub fn fingerprint(&self) -> String {
        params_hash(&serde_json::to_string(self).unwrap_or_default())
    }
}

// =============================================================================
// Live experiment
// =============================================================================

/// Session parameters of the live experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub num_participants: usize,
    pub population_size: usize,
    pub group_size: usize,
    /// Supergames per app.
    pub num_supergames: usize,
    pub num_periods: usize,
    pub gamma: f64,
    pub initial_confidence_lower: f64,
    pub initial_confidence_upper: f64,
    /// Managers play the Nash action instead of waiting for decisions.
    pub simulation: bool,
    /// Points per unit of currency.
    pub conversion_rate: f64,
    pub participation_fee: f64,
    pub action_decimal_places: u32,
    pub imitation_noise: f64,
    pub rank_order: RankOrder,
    pub bounds: TraitBounds,
    pub seed: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            num_participants: 12,
            population_size: 6,
            group_size: 2,
            num_supergames: 60,
            num_periods: 8,
            gamma: 0.5,
            initial_confidence_lower: 0.5,
            initial_confidence_upper: 1.5,
            simulation: false,
            conversion_rate: 1300.0,
            participation_fee: 6.0,
            action_decimal_places: 3,
            imitation_noise: 0.1,
            rank_order: RankOrder::Ascending,
            bounds: TraitBounds::default(),
            seed: 42,
        }
    }
}

impl LiveConfig {
    pub fn from_env() -> Self {
        Self::read(&ParamSource::Env)
    }

    pub fn from_params(params: &Map<String, Value>) -> Self {
        Self::read(&ParamSource::Map(params))
    }

    fn read(src: &ParamSource<'_>) -> Self {
        let d = Self::default();
        Self {
            num_participants: src.get("num_participants", "NUM_PARTICIPANTS", d.num_participants),
            population_size: src.get("population_size", "POPULATION_SIZE", d.population_size),
            group_size: src.get("players_per_group", "PLAYERS_PER_GROUP", d.group_size),
            num_supergames: src.get("num_rounds", "NUM_SUPERGAMES", d.num_supergames),
            num_periods: src.get("num_periods", "NUM_PERIODS", d.num_periods),
            gamma: src.get("gamma", "GAMMA", d.gamma),
            initial_confidence_lower: src.get(
                "initial_confidence_lower",
                "INITIAL_CONFIDENCE_LOWER",
                d.initial_confidence_lower,
            ),
            initial_confidence_upper: src.get(
                "initial_confidence_upper",
                "INITIAL_CONFIDENCE_UPPER",
                d.initial_confidence_upper,
            ),
            simulation: src.get_bool("simulation", "SIMULATION", d.simulation),
            conversion_rate: src.get("conversion_rate", "CONVERSION_RATE", d.conversion_rate),
            participation_fee: src.get("participation_fee", "PARTICIPATION_FEE", d.participation_fee),
            action_decimal_places: src.get(
                "action_decimal_places",
                "ACTION_DECIMAL_PLACES",
                d.action_decimal_places,
            ),
            imitation_noise: src.get("imitation_noise", "IMITATION_NOISE", d.imitation_noise),
            rank_order: read_rank_order(src),
            bounds: read_bounds(src),
            seed: src.get("seed", "SEED", d.seed),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_size < 2 {
            bail!("live groups need at least two members");
        }
        if self.population_size == 0 || self.population_size % self.group_size != 0 {
            bail!(
                "population_size {} must be a positive multiple of group size {}",
                self.population_size,
                self.group_size
            );
        }
        if self.num_participants == 0 || self.num_participants % self.group_size != 0 {
            bail!(
                "{} participants cannot be split into groups of {}",
                self.num_participants,
                self.group_size
            );
        }
        if self.conversion_rate <= 0.0 {
            bail!("conversion_rate must be positive");
        }
        Ok(())
    }

    /// Live updates always imitate a fitness-weighted peer, every supergame.
    pub fn evolution_params(&self) -> EvolutionParams {
        EvolutionParams {
            mechanism: Mechanism::WeightedAverage,
            rank_order: self.rank_order,
            selection: SelectionSchedule::default(),
            trait_noise: NoiseKind::symmetric(self.imitation_noise),
            bounds: self.bounds,
        }
    }

    pub fn fingerprint(&self) -> String {
        params_hash(&serde_json::to_string(self).unwrap_or_default())
    }
}
