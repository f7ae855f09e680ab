//! Gamma sweep: one batch simulation per substitutability value.
//!
//! Usage: sweep [gamma ...]   (default 0 0.25 0.5 0.75 1)
//!
//! Other parameters come from the environment as for the main binary.

use std::time::Instant;

use anyhow::{Context, Result};

use evolving_managers::config::SimConfig;
use evolving_managers::logging;
use evolving_managers::simulation;

fn main() -> Result<()> {
    let gammas: Vec<f64> = {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.is_empty() {
            vec![0.0, 0.25, 0.5, 0.75, 1.0]
        } else {
            args.iter()
                .map(|a| a.parse::<f64>().with_context(|| format!("bad gamma '{}'", a)))
                .collect::<Result<_>>()?
        }
    };

    let base = SimConfig::from_env();
    println!("gamma,final_mean_confidence,final_mean_action,selections,elapsed_ms");
    let start = Instant::now();
    for gamma in gammas {
        let cfg = SimConfig { gamma, ..base.clone() };
        let r = simulation::run(&cfg)?.report;
        println!(
            "{},{:.6},{:.6},{},{}",
            gamma, r.final_mean_confidence, r.final_mean_action, r.selections, r.elapsed_ms
        );
    }
    eprintln!("sweep finished in {:.1}s", start.elapsed().as_secs_f64());
    logging::flush();
    Ok(())
}
