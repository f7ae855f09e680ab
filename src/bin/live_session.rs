//! Headless live experiment: every manager plays the equilibrium action.
//!
//! Usage: live_session [params.json]
//!
//! Prints one JSON line per supergame and the final payments.

use std::fs;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use evolving_managers::config::LiveConfig;
use evolving_managers::experiment::LiveExperiment;
use evolving_managers::history::{digest, observations};
use evolving_managers::logging::{self, log_run_summary};
use evolving_managers::storage::HistoryStore;

fn load_config() -> Result<LiveConfig> {
    let mut cfg = match std::env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path))?;
            match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => LiveConfig::from_params(&map),
                _ => bail!("session parameters must be a JSON object"),
            }
        }
        None => LiveConfig::from_env(),
    };
    cfg.simulation = true;
    Ok(cfg)
}

fn main() -> Result<()> {
    let cfg = load_config()?;
    let fingerprint = cfg.fingerprint();
    let mut exp = LiveExperiment::new(cfg.clone())?;

    while !exp.is_complete() {
        let report = exp.play_simulated_supergame()?;
        let selected = report.outcomes.iter().filter(|o| o.selected).count();
        println!(
            "{}",
            json!({
                "supergame": report.supergame + 1,
                "groups": report.groups.len(),
                "selected": selected,
                "populations": report.populations,
            })
        );
    }

    let payments = exp.final_payments();
    let run_id = format!("live-{}-{}", fingerprint, logging::ts_epoch_ms());
    let agents = exp.into_agents();
    let obs = observations(0, 0, &agents);
    let mean_confidence = agents.iter().map(|a| a.confidence).sum::<f64>() / agents.len().max(1) as f64;
    log_run_summary("live", &fingerprint, cfg.num_supergames, agents.len(), mean_confidence);

    if let Ok(path) = std::env::var("SQLITE_PATH") {
        let mut store = HistoryStore::new(&path)?;
        store.init()?;
        store.register_run(&run_id, "live", &fingerprint, &serde_json::to_string(&cfg)?)?;
        store.persist_market(&run_id, 0, 0, &agents)?;
    }

    println!(
        "{}",
        json!({
            "run_id": run_id,
            "participants": agents.len(),
            "payments": payments,
            "history_sha256": digest(&obs)?,
        })
    );
    logging::flush();
    Ok(())
}
