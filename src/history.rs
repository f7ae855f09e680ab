use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent::Agent;
use crate::game::{group_payoff, PayoffKind};

pub const EXPORT_COLUMNS: [&str; 10] = [
    "participant.id",
    "population",
    "group.id",
    "player.supergame",
    "player.period",
    "group.gamma",
    "player.confidence",
    "player.action",
    "player.payoff",
    "player.fitness",
];

/// One recorded period of one manager, flattened for export and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub market: usize,
    /// 1-based, unique across markets.
    pub participant_id: usize,
    pub agent_id: usize,
    pub population: u32,
    pub group: usize,
    pub epoch: usize,
    pub round: usize,
    pub gamma: f64,
    pub confidence: f64,
    pub action: f64,
    pub opponent_actions: Vec<f64>,
    pub payoff: f64,
    pub fitness: f64,
}

/// Flatten agent histories. `id_offset` shifts participant ids so markets don't collide.
pub fn observations(market: usize, id_offset: usize, agents: &[Agent]) -> Vec<Observation> {
    let mut out: Vec<Observation> = agents
        .iter()
        .flat_map(|a| {
            a.history.iter().map(move |r| Observation {
                market,
                participant_id: id_offset + a.id + 1,
                agent_id: a.id,
                population: a.population_id,
                group: r.group,
                epoch: r.epoch,
                round: r.round,
                gamma: r.gamma,
                confidence: r.confidence,
                action: r.action,
                opponent_actions: r.opponent_actions.clone(),
                payoff: r.payoff,
                fitness: r.fitness,
            })
        })
        .collect();
    out.sort_by_key(|o| (o.epoch, o.round, o.participant_id));
    out
}

/// Compact textual form of opponent actions; parses back to identical bits.
pub fn encode_actions(actions: &[f64]) -> String {
    actions.iter().map(|q| q.to_string()).collect::<Vec<_>>().join(";")
}

pub fn decode_actions(raw: &str) -> Result<Vec<f64>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(';')
        .map(|s| s.parse::<f64>().with_context(|| format!("bad action '{}'", s)))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub participant_id: usize,
    pub epoch: usize,
    pub round: usize,
    pub recorded_payoff: f64,
    pub replayed_payoff: f64,
    pub recorded_fitness: f64,
    pub replayed_fitness: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl ReplayReport {
    pub fn is_exact(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recompute payoff and fitness of every observation; any bit difference is a mismatch.
pub fn replay(observations: &[Observation]) -> ReplayReport {
    let mut mismatches = Vec::new();
    for o in observations {
        let payoff = group_payoff(PayoffKind::Payoff, o.confidence, o.action, &o.opponent_actions, o.gamma);
        let fitness = group_payoff(PayoffKind::Fitness, o.confidence, o.action, &o.opponent_actions, o.gamma);
        if payoff.to_bits() != o.payoff.to_bits() || fitness.to_bits() != o.fitness.to_bits() {
            mismatches.push(Mismatch {
                participant_id: o.participant_id,
                epoch: o.epoch,
                round: o.round,
                recorded_payoff: o.payoff,
                replayed_payoff: payoff,
                recorded_fitness: o.fitness,
                replayed_fitness: fitness,
            });
        }
    }
    ReplayReport {
        checked: observations.len(),
        mismatches,
    }
}

pub fn verify_replay(observations: &[Observation]) -> Result<ReplayReport> {
    let report = replay(observations);
    if let Some(m) = report.mismatches.first() {
        bail!(
            "{} of {} periods do not replay; first: participant {} epoch {} round {}",
            report.mismatches.len(),
            report.checked,
            m.participant_id,
            m.epoch,
            m.round
        );
    }
    Ok(report)
}

pub fn write_csv<W: Write>(out: &mut W, observations: &[Observation]) -> Result<()> {
    writeln!(out, "{}", EXPORT_COLUMNS.join(","))?;
    for o in observations {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            o.participant_id,
            o.population,
            o.group,
            o.epoch,
            o.round,
            o.gamma,
            o.confidence,
            o.action,
            o.payoff,
            o.fitness
        )?;
    }
    Ok(())
}

pub fn export_csv(path: &Path, observations: &[Observation]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    write_csv(&mut w, observations)?;
    w.flush()?;
    Ok(())
}

pub fn digest(observations: &[Observation]) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(&mut buf, observations)?;
    Ok(hex::encode(Sha256::digest(&buf)))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
