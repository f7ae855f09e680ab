use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::agent::{Agent, UpdateOutcome};
use crate::history::{decode_actions, encode_actions, observations, Observation};

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub run_id: String,
    pub kind: String,
    pub params_hash: String,
    pub config_json: String,
    pub created_at: String,
}

pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite store {}", path))?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                params_hash TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS observations (
                run_id TEXT NOT NULL,
                market INTEGER NOT NULL,
                participant_id INTEGER NOT NULL,
                agent_id INTEGER NOT NULL,
                population INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                round INTEGER NOT NULL,
                gamma REAL NOT NULL,
                confidence REAL NOT NULL,
                action REAL NOT NULL,
                opponent_actions TEXT NOT NULL,
                payoff REAL NOT NULL,
                fitness REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS observations_run ON observations (run_id, epoch, round);
            CREATE TABLE IF NOT EXISTS updates (
                run_id TEXT NOT NULL,
                market INTEGER NOT NULL,
                agent_id INTEGER NOT NULL,
                population INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                fitness REAL NOT NULL,
                rank INTEGER NOT NULL,
                prob_selection REAL NOT NULL,
                weight REAL NOT NULL,
                prob_imitation_target REAL NOT NULL,
                selected INTEGER NOT NULL,
                imitation_target INTEGER,
                previous_confidence REAL NOT NULL,
                next_confidence REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn register_run(&mut self, run_id: &str, kind: &str, params_hash: &str, config_json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO runs (run_id, kind, params_hash, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, kind, params_hash, config_json, crate::logging::ts_now()],
        )?;
        Ok(())
    }

    /// Persist the full history and update trail of one market in one transaction.
    pub fn persist_market(&mut self, run_id: &str, market: usize, id_offset: usize, agents: &[Agent]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for o in observations(market, id_offset, agents) {
            tx.execute(
                "INSERT INTO observations (run_id, market, participant_id, agent_id, population, group_id,
                    epoch, round, gamma, confidence, action, opponent_actions, payoff, fitness)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    run_id,
                    o.market as i64,
                    o.participant_id as i64,
                    o.agent_id as i64,
                    o.population as i64,
                    o.group as i64,
                    o.epoch as i64,
                    o.round as i64,
                    o.gamma,
                    o.confidence,
                    o.action,
                    encode_actions(&o.opponent_actions),
                    o.payoff,
                    o.fitness
                ],
            )?;
        }
        for u in agents.iter().flat_map(|a| a.updates.iter()) {
            tx.execute(
                "INSERT INTO updates (run_id, market, agent_id, population, epoch, fitness, rank,
                    prob_selection, weight, prob_imitation_target, selected, imitation_target,
                    previous_confidence, next_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    run_id,
                    market as i64,
                    u.agent_id as i64,
                    u.population_id as i64,
                    u.epoch as i64,
                    u.fitness,
                    u.rank as i64,
                    u.prob_selection,
                    u.weight,
                    u.prob_imitation_target,
                    u.selected,
                    u.imitation_target.map(|t| t as i64),
                    u.previous_confidence,
                    u.next_confidence
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, kind, params_hash, config_json, created_at FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| {
                    Ok(RunRow {
                        run_id: r.get(0)?,
                        kind: r.get(1)?,
                        params_hash: r.get(2)?,
                        config_json: r.get(3)?,
                        created_at: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn run_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT run_id FROM runs ORDER BY created_at, run_id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn load_observations(&self, run_id: &str) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT market, participant_id, agent_id, population, group_id, epoch, round, gamma,
                    confidence, action, opponent_actions, payoff, fitness
             FROM observations WHERE run_id = ?1
             ORDER BY market, epoch, round, participant_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok((
                    Observation {
                        market: r.get::<_, i64>(0)? as usize,
                        participant_id: r.get::<_, i64>(1)? as usize,
                        agent_id: r.get::<_, i64>(2)? as usize,
                        population: r.get::<_, i64>(3)? as u32,
                        group: r.get::<_, i64>(4)? as usize,
                        epoch: r.get::<_, i64>(5)? as usize,
                        round: r.get::<_, i64>(6)? as usize,
                        gamma: r.get(7)?,
                        confidence: r.get(8)?,
                        action: r.get(9)?,
                        opponent_actions: Vec::new(),
                        payoff: r.get(11)?,
                        fitness: r.get(12)?,
                    },
                    r.get::<_, String>(10)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(mut o, raw)| {
                o.opponent_actions = decode_actions(&raw)?;
                Ok(o)
            })
            .collect()
    }

    pub fn load_updates(&self, run_id: &str) -> Result<Vec<(usize, UpdateOutcome)>> {
        let mut stmt = self.conn.prepare(
            "SELECT market, agent_id, population, epoch, fitness, rank, prob_selection, weight,
                    prob_imitation_target, selected, imitation_target, previous_confidence, next_confidence
             FROM updates WHERE run_id = ?1
             ORDER BY market, epoch, agent_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok((
                    r.get::<_, i64>(0)? as usize,
                    UpdateOutcome {
                        agent_id: r.get::<_, i64>(1)? as usize,
                        population_id: r.get::<_, i64>(2)? as u32,
                        epoch: r.get::<_, i64>(3)? as usize,
                        fitness: r.get(4)?,
                        rank: r.get::<_, i64>(5)? as usize,
                        prob_selection: r.get(6)?,
                        weight: r.get(7)?,
                        prob_imitation_target: r.get(8)?,
                        selected: r.get(9)?,
                        imitation_target: r.get::<_, Option<i64>>(10)?.map(|t| t as usize),
                        previous_confidence: r.get(11)?,
                        next_confidence: r.get(12)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
