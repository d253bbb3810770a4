use anyhow::Result;
use clap::{Parser, Subcommand};
use plate_live::{
    ConnectionId, LiveConfig, LiveHub, MemorySocket, MemoryStore, RunEvent, RunRecord,
    SummaryAggregator, SummaryRecord, SummaryStore,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plate", version = "0.3.0", about = "Plate live results CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a fixture's run events against in-memory connections.
    Simulate {
        fixture: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Feed events through the trigger worker pool.
        #[arg(long)]
        background: bool,
        #[arg(long)]
        json: bool,
    },
    Summarize {
        fixture: PathBuf,
        #[arg(long)]
        sample: String,
        #[arg(long)]
        json: bool,
    },
    Audit {
        fixture: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        repair: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Fixture {
    runs: Vec<RunRecord>,
    summaries: Vec<SummaryRecord>,
    connections: Vec<FixtureConnection>,
    events: Vec<RunEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureConnection {
    id: String,
    #[serde(default = "one_socket")]
    sockets: u64,
    #[serde(default)]
    topics: Vec<String>,
}

fn one_socket() -> u64 {
    1
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = match err.downcast_ref::<plate_live::LiveError>() {
                    Some(live) => live.kind(),
                    None => "command_failed",
                };
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Simulate {
            fixture,
            config,
            background,
            json,
        } => {
            let config = LiveConfig::load(config.as_deref())?;
            let fixture = load_fixture(&fixture)?;
            let outcome = simulate(config, fixture, background)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "background": background,
                    "summaries": outcome.summaries,
                    "frames": outcome.frames,
                    "failures": outcome.failures,
                    "coordinator": outcome.coordinator,
                })));
            }
            for (sample_no, summary) in &outcome.summaries {
                println!(
                    "summary {}: runs={} total={} positive={}% negative={}%",
                    sample_no,
                    summary["run_count"],
                    summary["total_count"],
                    summary["concentration"]["positive_percentage"],
                    summary["concentration"]["negative_percentage"]
                );
            }
            for (connection, by_type) in &outcome.frames {
                let parts: Vec<String> = by_type
                    .iter()
                    .map(|(kind, count)| format!("{}={}", kind, count))
                    .collect();
                println!("frames {}: {}", connection, parts.join(" "));
            }
            for failure in &outcome.failures {
                println!("failure: {}", failure);
            }
        }
        Commands::Summarize {
            fixture,
            sample,
            json,
        } => {
            let fixture = load_fixture(&fixture)?;
            let runs: Vec<RunRecord> = fixture
                .runs
                .into_iter()
                .filter(|run| run.sample_no == sample && run.is_completed())
                .collect();
            let summary = SummaryAggregator::summarize(&sample, &runs)?;
            let fingerprint = summary.fingerprint()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "summary": summary,
                    "fingerprint": fingerprint,
                })));
            }
            println!("sample: {}", summary.sample_no);
            println!("runs: {}", summary.run_count);
            println!("total_count: {}", summary.total_count);
            for (label, count) in &summary.distribution {
                println!("  {}: {}", label, count);
            }
            println!(
                "concentration: positive={}% negative={}%",
                summary.concentration.positive_percentage,
                summary.concentration.negative_percentage
            );
            println!(
                "quality: avg_confidence={} high_confidence={}% valid={}% wells={}",
                summary.quality.average_confidence,
                summary.quality.high_confidence_percentage,
                summary.quality.valid_detection_percentage,
                summary.quality.total_wells
            );
            println!("fingerprint: {}", fingerprint);
        }
        Commands::Audit {
            fixture,
            config,
            repair,
            json,
        } => {
            let mut config = LiveConfig::load(config.as_deref())?;
            config.audit_repair = config.audit_repair || repair;
            let fixture = load_fixture(&fixture)?;
            let store = seed_store(&fixture);
            let hub = LiveHub::new(config, store.clone(), store.clone())?;
            let report = hub.audit_now()?;
            let mut details = Vec::new();
            for sample_no in &report.inconsistent {
                if let Ok(check) = hub.validator().check(sample_no) {
                    details.push(check);
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "audit",
                    "repair": hub.config().audit_repair,
                    "report": report,
                    "after_repair": details,
                })));
            }
            println!("checked: {}", report.checked);
            println!("inconsistent: {}", report.inconsistent_count);
            for sample_no in &report.inconsistent {
                if report.orphaned.contains(sample_no) {
                    println!("  {} (orphaned)", sample_no);
                } else {
                    println!("  {}", sample_no);
                }
            }
            for (sample_no, error) in &report.errors {
                println!("error {}: {}", sample_no, error);
            }
            if hub.config().audit_repair {
                let still = details.iter().filter(|d| !d.consistent).count();
                println!("still_inconsistent_after_repair: {}", still);
            }
        }
        Commands::Config { file, json } => {
            let config = LiveConfig::load(file.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "config",
                    "config": config,
                })));
            }
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }
    Ok(None)
}

struct SimulationOutcome {
    summaries: BTreeMap<String, Value>,
    frames: BTreeMap<String, BTreeMap<String, usize>>,
    failures: Vec<String>,
    coordinator: Value,
}

fn simulate(config: LiveConfig, fixture: Fixture, background: bool) -> Result<SimulationOutcome> {
    let store = seed_store(&fixture);
    let hub = Arc::new(LiveHub::new(config, store.clone(), store.clone())?);

    let mut sockets: Vec<(String, Arc<MemorySocket>)> = Vec::new();
    let mut next_socket = 1u64;
    for connection in &fixture.connections {
        let id = ConnectionId::new(connection.id.clone());
        for _ in 0..connection.sockets.max(1) {
            let socket = MemorySocket::new(next_socket);
            next_socket += 1;
            hub.attach_socket(&id, socket.clone())?;
            sockets.push((connection.id.clone(), socket));
        }
        for topic in &connection.topics {
            hub.subscribe(topic, &id)?;
        }
    }
    info!(
        connections = fixture.connections.len(),
        events = fixture.events.len(),
        "simulation ready"
    );

    if background {
        hub.start_background();
    }
    for event in fixture.events {
        if let RunEvent::Deleted { run_id, .. } = &event {
            store.delete_run(*run_id);
        }
        debug!(?event, "submitting");
        if let Err(err) = hub.submit(event) {
            debug!(error = %err, "event handled with error");
        }
    }
    // Drains the trigger queue before frames are collected.
    hub.shutdown();

    let mut summaries = BTreeMap::new();
    let sample_ids: Vec<String> = fixture
        .runs
        .iter()
        .map(|run| run.sample_no.clone())
        .chain(fixture.summaries.iter().map(|s| s.summary.sample_no.clone()))
        .collect();
    for sample_no in sample_ids {
        if let Some(record) = store.load(&sample_no)? {
            summaries.insert(sample_no, serde_json::to_value(&record.summary)?);
        }
    }

    let mut frames: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for (connection, socket) in &sockets {
        let by_type = frames.entry(connection.clone()).or_default();
        for frame in socket.frame_values() {
            let kind = frame
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            *by_type.entry(kind).or_insert(0) += 1;
        }
    }

    let failures = hub
        .coordinator()
        .failures()
        .recent(usize::MAX)
        .into_iter()
        .map(|entry| format!("{} {}: {}", entry.sample_no, entry.kind, entry.message))
        .collect();

    Ok(SimulationOutcome {
        summaries,
        frames,
        failures,
        coordinator: serde_json::to_value(hub.coordinator().stats())?,
    })
}

fn seed_store(fixture: &Fixture) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_runs(fixture.runs.iter().cloned()));
    for record in &fixture.summaries {
        store.put_summary(record.clone());
    }
    store
}

fn load_fixture(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read fixture {}: {}", path.display(), e))?;
    parse_fixture(&raw).map_err(|e| anyhow::anyhow!("parse fixture {}: {}", path.display(), e))
}

/// YAML or JSON; JSON parses as YAML.
fn parse_fixture(raw: &str) -> std::result::Result<Fixture, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(Fixture::default());
    }
    serde_yaml::from_str(raw)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Simulate { json, .. }
        | Commands::Summarize { json, .. }
        | Commands::Audit { json, .. }
        | Commands::Config { json, .. } => *json,
    }
}
