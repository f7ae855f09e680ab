//! Live experiment driven message by message.

use evolving_managers::config::LiveConfig;
use evolving_managers::experiment::LiveExperiment;
use evolving_managers::session::{Inbound, Outbound, Recipient};

fn cfg() -> LiveConfig {
    LiveConfig {
        num_participants: 4,
        population_size: 4,
        num_supergames: 2,
        num_periods: 3,
        ..LiveConfig::default()
    }
}

fn partner_of(exp: &LiveExperiment, id: usize) -> usize {
    exp.sessions()
        .iter()
        .find(|s| s.members.contains(&id))
        .and_then(|s| s.members.iter().copied().find(|&m| m != id))
        .unwrap()
}

#[test]
fn manual_supergame_with_reload() {
    let mut exp = LiveExperiment::new(cfg()).unwrap();
    exp.start_supergame().unwrap();

    let p = partner_of(&exp, 0);
    assert!(exp.handle(0, Inbound::Ready).unwrap().is_empty());
    let start = exp.handle(p, Inbound::Ready).unwrap();
    assert_eq!(start.len(), 1);
    assert_eq!(start[0].0, Recipient::All);

    // reload before any decision resends to the reloading member only
    let resend = exp.handle(0, Inbound::Ready).unwrap();
    assert_eq!(resend.len(), 1);
    assert!(matches!(resend[0].0, Recipient::Member(_)));
    assert_eq!(resend[0].1.view().period, 0);

    for period in 1..=3 {
        assert!(exp.handle(0, Inbound::Update { action: 0.3 }).unwrap().is_empty());
        assert!(exp.handle(0, Inbound::Update { action: 0.4 }).is_err());
        let out = exp.handle(p, Inbound::Update { action: 0.3 }).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.view().period, period);
        if period == 3 {
            assert!(matches!(out[0].1, Outbound::EndSupergame(_)));
        } else {
            assert!(matches!(out[0].1, Outbound::StartPeriod(_)));
        }
    }

    // the other group has not played yet
    assert!(!exp.all_finished());
    assert!(exp.finish_supergame().is_err());

    let others: Vec<usize> = (0..4).filter(|&i| i != 0 && i != p).collect();
    for &id in &others {
        exp.handle(id, Inbound::Ready).unwrap();
    }
    for _ in 0..3 {
        for &id in &others {
            exp.handle(id, Inbound::Update { action: 0.5 }).unwrap();
        }
    }
    assert!(exp.all_finished());

    let agent0_points = exp.agents()[0].cumulative_payoff;
    let report = exp.finish_supergame().unwrap();
    assert_eq!(report.supergame, 0);
    assert_eq!(report.outcomes.len(), 4);
    assert!((report.payments[0] - agent0_points / 1300.0).abs() < 1e-12);
    assert_eq!(exp.agents()[0].total_payoff, agent0_points);
    // baseline plus three periods
    assert_eq!(exp.agents()[0].history.len(), 4);
    assert_eq!(exp.supergame(), 1);
}

#[test]
fn simulated_supergames_evolve_every_time() {
    let mut exp = LiveExperiment::new(LiveConfig { simulation: true, ..cfg() }).unwrap();
    let reports = exp.run_simulated().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(exp.agents().iter().all(|a| a.updates.len() == 2));
    for a in exp.agents() {
        for r in &a.history {
            assert!((0.0..=1.0).contains(&r.action));
        }
    }
    let fee_only = exp.final_payments().iter().all(|&p| p >= 6.0);
    assert!(fee_only);
}
