//! Batch simulation.
//!
//! Usage: evolving-managers [params.json]
//!
//! Parameters come from the JSON object when a path is given, otherwise from
//! the environment. `SQLITE_PATH` persists every market's history,
//! `STATS_CSV` writes per-round cross-market statistics and `HISTORY_CSV`
//! writes the flattened observation table.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;

use evolving_managers::config::SimConfig;
use evolving_managers::history::{digest, export_csv, observations, Observation};
use evolving_managers::logging::{self, log_audit, v_str};
use evolving_managers::simulation;
use evolving_managers::stats::stats_csv;
use evolving_managers::storage::HistoryStore;

fn load_config() -> Result<SimConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path))?;
            SimConfig::from_json_str(&raw)
        }
        None => Ok(SimConfig::from_env()),
    }
}

fn main() -> Result<()> {
    let cfg = load_config()?;
    let outcome = simulation::run(&cfg)?;
    let run_id = format!("sim-{}-{}", &outcome.report.params_hash, logging::ts_epoch_ms());

    let all: Vec<Observation> = outcome
        .markets
        .iter()
        .enumerate()
        .flat_map(|(m, agents)| observations(m, m * cfg.num_players, agents))
        .collect();

    if let Ok(path) = std::env::var("SQLITE_PATH") {
        let mut store = HistoryStore::new(&path)?;
        store.init()?;
        let config_json = serde_json::to_string(&cfg)?;
        store.register_run(&run_id, "simulation", &outcome.report.params_hash, &config_json)?;
        for (m, agents) in outcome.markets.iter().enumerate() {
            store.persist_market(&run_id, m, m * cfg.num_players, agents)?;
        }
        log_audit("persisted", &[("run_id", v_str(&run_id)), ("path", v_str(&path))]);
    }

    if let Ok(path) = std::env::var("STATS_CSV") {
        fs::write(&path, stats_csv(&outcome.round_stats())).with_context(|| format!("write {}", path))?;
    }

    if let Ok(path) = std::env::var("HISTORY_CSV") {
        export_csv(Path::new(&path), &all)?;
    }

    let out = json!({
        "run_id": run_id,
        "history_sha256": digest(&all)?,
        "report": outcome.report,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    logging::flush();
    Ok(())
}
