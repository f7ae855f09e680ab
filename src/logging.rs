//! Structured logging for experiment and simulation runs.
//!
//! Every record is one JSON line carrying a run id, a sequence number, a level
//! and a domain. Records land in `<LOG_DIR>/<RUN_ID>/`:
//! `events.jsonl` (info and above), `trace.jsonl` (trace/debug) and
//! `metrics.jsonl` (run summaries and stats), next to a `manifest.json`.
//! Records are echoed to stderr unless `LOG_ECHO=0`; stdout belongs to the
//! binaries' own output.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::agent::UpdateOutcome;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Config,    // Parameter resolution and defaults
    Round,     // Stage-game periods
    Epoch,     // Epoch / supergame lifecycle
    Evolution, // Ranking, selection, imitation
    Pairing,   // Group draws
    Session,   // Live rendezvous events
    System,    // Startup, shutdown, run summaries
    Profile,   // Timing
    Audit,     // Replay verification, digests
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Config => "config",
            Domain::Round => "round",
            Domain::Epoch => "epoch",
            Domain::Evolution => "evolution",
            Domain::Pairing => "pairing",
            Domain::Session => "session",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static MIN_LEVEL: OnceLock<Level> = OnceLock::new();
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

fn min_level() -> Level {
    *MIN_LEVEL.get_or_init(Level::from_env)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    echo: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    metrics: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let echo = !matches!(std::env::var("LOG_ECHO").as_deref(), Ok("0") | Ok("false"));
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            run_id,
            echo,
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            metrics: open_sink(run_dir.join("metrics.jsonl")),
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["agent_id", "population_id", "epoch", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn enabled(level: Level, domain: Domain) -> bool {
    level >= min_level() && domain.is_enabled()
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !enabled(level, domain) {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

/// Flush buffered sinks (call before process exit).
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace, &ctx.metrics].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if event.starts_with("metrics.") || event == "run_summary" {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.echo {
        eprintln!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

/// A configuration key was absent and its default was taken.
pub fn log_config_default(key: &str, default: &Value) {
    log(
        Level::Info,
        Domain::Config,
        "config.default",
        obj(&[
            ("msg", v_str(&format!("parameter {} missing, default taken", key))),
            ("key", v_str(key)),
            ("default", default.clone()),
        ]),
    );
}

/// A configuration key was present but unusable.
pub fn log_config_invalid(key: &str, raw: &str, default: &Value) {
    log(
        Level::Warn,
        Domain::Config,
        "config.invalid",
        obj(&[
            ("key", v_str(key)),
            ("raw", v_str(raw)),
            ("default", default.clone()),
        ]),
    );
}

pub fn log_epoch(event: &str, epoch: usize, groups: usize, agents: usize) {
    log(
        Level::Debug,
        Domain::Epoch,
        event,
        obj(&[
            ("epoch", json!(epoch)),
            ("groups", json!(groups)),
            ("agents", json!(agents)),
        ]),
    );
}

pub fn log_round(agent_id: usize, epoch: usize, round: usize, action: f64, payoff: f64, fitness: f64) {
    log(
        Level::Trace,
        Domain::Round,
        "round",
        obj(&[
            ("agent_id", json!(agent_id)),
            ("epoch", json!(epoch)),
            ("round", json!(round)),
            ("action", v_num(action)),
            ("payoff", v_num(payoff)),
            ("fitness", v_num(fitness)),
        ]),
    );
}

pub fn log_groups(epoch: usize, groups: &[Vec<usize>]) {
    log(
        Level::Debug,
        Domain::Pairing,
        "groups_drawn",
        obj(&[("epoch", json!(epoch)), ("groups", json!(groups))]),
    );
}

pub fn log_selection(outcome: &UpdateOutcome) {
    log(
        Level::Debug,
        Domain::Evolution,
        "selection",
        obj(&[
            ("agent_id", json!(outcome.agent_id)),
            ("population_id", json!(outcome.population_id)),
            ("epoch", json!(outcome.epoch)),
            ("rank", json!(outcome.rank)),
            ("prob_selection", v_num(outcome.prob_selection)),
            ("weight", v_num(outcome.weight)),
            ("selected", json!(outcome.selected)),
            ("imitation_target", json!(outcome.imitation_target)),
            ("previous_confidence", v_num(outcome.previous_confidence)),
            ("next_confidence", v_num(outcome.next_confidence)),
        ]),
    );
}

pub fn log_population_update(
    population_id: u32,
    epoch: usize,
    size: usize,
    avg_fitness: f64,
    selected: usize,
    uniform_fallback: bool,
) {
    let level = if uniform_fallback { Level::Info } else { Level::Debug };
    log(
        level,
        Domain::Evolution,
        "population_update",
        obj(&[
            ("population_id", json!(population_id)),
            ("epoch", json!(epoch)),
            ("size", json!(size)),
            ("avg_fitness", v_num(avg_fitness)),
            ("selected", json!(selected)),
            ("uniform_fallback", json!(uniform_fallback)),
        ]),
    );
}

pub fn log_session_event(group: usize, slot: usize, event: &str, period: usize) {
    log(
        Level::Debug,
        Domain::Session,
        event,
        obj(&[
            ("group", json!(group)),
            ("slot", json!(slot)),
            ("period", json!(period)),
        ]),
    );
}

pub fn log_run_summary(kind: &str, params_hash: &str, epochs: usize, agents: usize, mean_confidence: f64) {
    log(
        Level::Info,
        Domain::System,
        "run_summary",
        obj(&[
            ("kind", v_str(kind)),
            ("params_hash", v_str(params_hash)),
            ("epochs", json!(epochs)),
            ("agents", json!(agents)),
            ("mean_confidence", v_num(mean_confidence)),
        ]),
    );
}

pub fn log_audit(event: &str, fields: &[(&str, Value)]) {
    log(Level::Info, Domain::Audit, event, obj(fields));
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn params_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut h);
    format!("{:x}", h.finish())
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = enabled(Level::Trace, Domain::Profile) && Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================
