use serde::Serialize;

use crate::agent::{Agent, AgentId};
use crate::logging::log_session_event;
use crate::orchestrator::apply_group_round;

/// Messages a group member's client sends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inbound {
    Ready,
    Update { action: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Recipient {
    All,
    Member(usize),
}

/// Group state broadcast after a period resolves or on (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodView {
    pub period: usize,
    pub actions: Vec<f64>,
    pub period_payoffs: Vec<f64>,
    pub round_payoffs: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    StartPeriod(PeriodView),
    EndSupergame(PeriodView),
}

impl Outbound {
    pub fn view(&self) -> &PeriodView {
        match self {
            Outbound::StartPeriod(v) | Outbound::EndSupergame(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionError {
    pub msg: String,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for SessionError {}

fn reject(msg: impl Into<String>) -> Result<Vec<(Recipient, Outbound)>, SessionError> {
    Err(SessionError { msg: msg.into() })
}

/// Rendezvous for one group during one supergame.
///
/// Payoffs for a period are computed only when every member has submitted it.
/// Member slots index `members`.
#[derive(Debug, Clone)]
pub struct GroupSession {
    pub group: usize,
    pub epoch: usize,
    pub members: Vec<AgentId>,
    pub num_periods: usize,
    pub gamma: f64,
    ready: Vec<bool>,
    submitted: Vec<usize>,
    period: usize,
    started: bool,
}

impl GroupSession {
    pub fn new(group: usize, epoch: usize, members: Vec<AgentId>, num_periods: usize, gamma: f64) -> Self {
        let n = members.len();
        Self {
            group,
            epoch,
            members,
            num_periods,
            gamma,
            ready: vec![false; n],
            submitted: vec![0; n],
            period: 0,
            started: false,
        }
    }

    /// Last period resolved for the whole group.
    pub fn period(&self) -> usize {
        self.period
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> bool {
        self.period >= self.num_periods
    }

    /// True once `slot` has submitted the current period and waits on others.
    pub fn waiting(&self, slot: usize) -> bool {
        self.submitted.get(slot).map_or(false, |&p| p > self.period)
    }

    fn view(&self, agents: &[Agent]) -> PeriodView {
        PeriodView {
            period: self.period,
            actions: self.members.iter().map(|&id| agents[id].action).collect(),
            period_payoffs: self.members.iter().map(|&id| agents[id].period_payoff).collect(),
            round_payoffs: self.members.iter().map(|&id| agents[id].cumulative_payoff).collect(),
        }
    }

    fn message(&self, agents: &[Agent]) -> Outbound {
        let view = self.view(agents);
        if self.finished() {
            Outbound::EndSupergame(view)
        } else {
            Outbound::StartPeriod(view)
        }
    }

    pub fn handle(
        &mut self,
        agents: &mut [Agent],
        slot: usize,
        msg: Inbound,
    ) -> Result<Vec<(Recipient, Outbound)>, SessionError> {
        if slot >= self.members.len() {
            return reject(format!("group {} has no slot {}", self.group, slot));
        }
        match msg {
            Inbound::Ready => self.on_ready(agents, slot),
            Inbound::Update { action } => self.on_update(agents, slot, action),
        }
    }

    fn on_ready(&mut self, agents: &[Agent], slot: usize) -> Result<Vec<(Recipient, Outbound)>, SessionError> {
        self.ready[slot] = true;
        log_session_event(self.group, slot, "ready", self.period);
        if !self.ready.iter().all(|&r| r) {
            return Ok(Vec::new());
        }
        if !self.started {
            self.started = true;
            log_session_event(self.group, slot, "start", self.period);
            return Ok(vec![(Recipient::All, self.message(agents))]);
        }
        // Reconnect: resend state to that member only, unless it is already ahead.
        if self.waiting(slot) {
            return Ok(Vec::new());
        }
        Ok(vec![(Recipient::Member(slot), self.message(agents))])
    }

    fn on_update(
        &mut self,
        agents: &mut [Agent],
        slot: usize,
        action: f64,
    ) -> Result<Vec<(Recipient, Outbound)>, SessionError> {
        if !self.started {
            return reject(format!("group {} has not started", self.group));
        }
        if self.finished() {
            return reject(format!("group {} already finished {} periods", self.group, self.num_periods));
        }
        if self.waiting(slot) {
            return reject(format!(
                "slot {} already submitted period {} in group {}",
                slot,
                self.period + 1,
                self.group
            ));
        }
        if !action.is_finite() || !(0.0..=1.0).contains(&action) {
            return reject(format!("action {} outside [0, 1]", action));
        }

        self.submitted[slot] = self.period + 1;
        agents[self.members[slot]].action = action;
        log_session_event(self.group, slot, "update", self.period + 1);

        if self.submitted.iter().any(|&p| p <= self.period) {
            return Ok(Vec::new());
        }
        self.period += 1;
        apply_group_round(agents, self.group, &self.members, self.epoch, self.period, self.gamma);
        let msg = self.message(agents);
        let event = if self.finished() { "end_supergame" } else { "start_period" };
        log_session_event(self.group, slot, event, self.period);
        Ok(vec![(Recipient::All, msg)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::begin_epoch;

    fn setup(num_periods: usize) -> (Vec<Agent>, GroupSession) {
        let mut agents = vec![Agent::new(0, 1, 1.5, 0.4), Agent::new(1, 1, 1.0, 0.3)];
        begin_epoch(&mut agents, &[vec![0, 1]], 0, 0.5);
        (agents, GroupSession::new(0, 0, vec![0, 1], num_periods, 0.5))
    }

    #[test]
    fn start_once_both_ready() {
        let (mut agents, mut s) = setup(2);
        assert!(s.handle(&mut agents, 0, Inbound::Ready).unwrap().is_empty());
        let out = s.handle(&mut agents, 1, Inbound::Ready).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Recipient::All);
        match &out[0].1 {
            Outbound::StartPeriod(v) => {
                assert_eq!(v.period, 0);
                assert!((v.period_payoffs[0] - 38.0).abs() < 1e-9);
                assert_eq!(v.round_payoffs, vec![0.0, 0.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.started());
    }

    #[test]
    fn reload_is_idempotent() {
        let (mut agents, mut s) = setup(2);
        s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Ready).unwrap();
        let again = s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].0, Recipient::Member(0));
        let again2 = s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        assert_eq!(again, again2);
        assert_eq!(s.period(), 0);
        assert_eq!(agents[0].history.len(), 1);
    }

    #[test]
    fn payoffs_wait_for_every_member() {
        let (mut agents, mut s) = setup(2);
        s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Ready).unwrap();

        assert!(s.handle(&mut agents, 0, Inbound::Update { action: 0.5 }).unwrap().is_empty());
        assert_eq!(agents[0].cumulative_payoff, 0.0);
        // a reload while waiting does not resend
        assert!(s.handle(&mut agents, 0, Inbound::Ready).unwrap().is_empty());

        let out = s.handle(&mut agents, 1, Inbound::Update { action: 0.25 }).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].1, Outbound::StartPeriod(_)));
        assert_eq!(s.period(), 1);
        // 0.5 * (1.5 - 0.5 - 0.125) * 100
        assert!((agents[0].cumulative_payoff - 43.75).abs() < 1e-9);
    }

    #[test]
    fn double_update_is_rejected() {
        let (mut agents, mut s) = setup(3);
        s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Ready).unwrap();
        s.handle(&mut agents, 0, Inbound::Update { action: 0.5 }).unwrap();
        let err = s.handle(&mut agents, 0, Inbound::Update { action: 0.6 }).unwrap_err();
        assert!(err.msg.contains("already submitted"));
        assert_eq!(agents[0].action, 0.5);
        assert_eq!(s.period(), 0);
    }

    #[test]
    fn last_period_ends_supergame() {
        let (mut agents, mut s) = setup(1);
        s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Update { action: 0.2 }).unwrap();
        let out = s.handle(&mut agents, 0, Inbound::Update { action: 0.2 }).unwrap();
        assert!(matches!(out[0].1, Outbound::EndSupergame(_)));
        assert!(s.finished());
        assert!(s.handle(&mut agents, 0, Inbound::Update { action: 0.2 }).is_err());
    }

    #[test]
    fn update_before_start_and_bad_actions_fail() {
        let (mut agents, mut s) = setup(2);
        assert!(s.handle(&mut agents, 0, Inbound::Update { action: 0.5 }).is_err());
        s.handle(&mut agents, 0, Inbound::Ready).unwrap();
        s.handle(&mut agents, 1, Inbound::Ready).unwrap();
        assert!(s.handle(&mut agents, 0, Inbound::Update { action: 1.5 }).is_err());
        assert!(s.handle(&mut agents, 0, Inbound::Update { action: f64::NAN }).is_err());
        assert!(s.handle(&mut agents, 5, Inbound::Ready).is_err());
    }
}
