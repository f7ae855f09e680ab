//! Replay stored runs and check every period's payoff and fitness bit for bit.
//!
//! Usage: replay <store.sqlite> [run_id]

use anyhow::{bail, Result};
use serde_json::json;

use evolving_managers::history::{digest, replay};
use evolving_managers::logging::{self, log_audit, v_num, v_str};
use evolving_managers::storage::HistoryStore;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: replay <store.sqlite> [run_id]");
    };
    let store = HistoryStore::new(&path)?;
    let run_ids = match args.next() {
        Some(id) => vec![id],
        None => store.run_ids()?,
    };
    if run_ids.is_empty() {
        bail!("no runs stored in {}", path);
    }

    let mut failed = 0usize;
    for run_id in &run_ids {
        let obs = store.load_observations(run_id)?;
        let updates = store.load_updates(run_id)?;
        let report = replay(&obs);
        if !report.is_exact() {
            failed += 1;
        }
        log_audit(
            "replay",
            &[
                ("run_id", v_str(run_id)),
                ("checked", v_num(report.checked as f64)),
                ("mismatches", v_num(report.mismatches.len() as f64)),
            ],
        );
        println!(
            "{}",
            json!({
                "run_id": run_id,
                "periods": report.checked,
                "updates": updates.len(),
                "exact": report.is_exact(),
                "first_mismatch": report.mismatches.first(),
                "history_sha256": digest(&obs)?,
            })
        );
    }
    logging::flush();
    if failed > 0 {
        bail!("{} of {} runs failed to replay", failed, run_ids.len());
    }
    Ok(())
}
