use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use funnel_cache::{
    AllEdgesActive, DateRange, JsonFileRepository, LatencyContext, ParameterRepository, Pipeline,
    QueryShape, ReplayFetcher, ResolveOptions, ResolveRequest, ScenarioView, SliceKind,
    StaticScenario,
};
use funnel_common::Config;

#[derive(Parser)]
#[command(name = "funnel", about = "Conversion series cache and latency-aware forecasts")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a query against the cache, fetching from recorded responses
    Resolve(ResolveArgs),
    /// Summarize a stored parameter and verify its invariants
    Inspect {
        #[arg(long)]
        store_dir: PathBuf,
        #[arg(long)]
        parameter: String,
    },
}

#[derive(clap::Args)]
struct ResolveArgs {
    /// Directory holding one JSON file per parameter
    #[arg(long)]
    store_dir: PathBuf,
    /// Recorded source responses (JSON array)
    #[arg(long)]
    fixture: PathBuf,
    #[arg(long)]
    parameter: String,
    #[arg(long)]
    from: NaiveDate,
    #[arg(long)]
    to: NaiveDate,
    #[arg(long, default_value = "window")]
    slice: SliceKind,
    #[arg(long)]
    from_node: String,
    #[arg(long)]
    to_node: String,
    #[arg(long)]
    visited: Vec<String>,
    #[arg(long)]
    excluded: Vec<String>,
    /// Context filter as key=value; repeatable
    #[arg(long, value_parser = parse_context)]
    context: Vec<(String, String)>,
    #[arg(long)]
    bust_cache: bool,
    #[arg(long)]
    maturity_days: Option<u32>,
    /// Compute completeness, forecast and blended mean for this edge
    #[arg(long)]
    latency: bool,
    /// Edge id for scenario lookups; defaults to the parameter id
    #[arg(long)]
    edge: Option<String>,
    /// Scenario weights file ({"weights": {"edge": 0.0}})
    #[arg(long)]
    scenario: Option<PathBuf>,
    /// Analysis date; defaults to now
    #[arg(long)]
    today: Option<NaiveDate>,
}

fn parse_context(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("funnel=info".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = Config::from_env()?;
    config.log_redacted();

    match cli.command {
        Command::Resolve(args) => resolve(config, args).await,
        Command::Inspect {
            store_dir,
            parameter,
        } => inspect(store_dir, parameter).await,
    }
}

async fn resolve(config: Config, args: ResolveArgs) -> Result<()> {
    let range = DateRange::new(args.from, args.to)?;

    let mut shape = QueryShape::new(args.from_node, args.to_node);
    for node in args.visited {
        shape = shape.visiting(node);
    }
    for node in args.excluded {
        shape = shape.excluding(node);
    }
    for (key, value) in args.context {
        shape = shape.with_context(key, value);
    }

    let scenario: Arc<dyn ScenarioView> = match &args.scenario {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading scenario {}", path.display()))?;
            let scenario: StaticScenario = serde_json::from_str(&raw)
                .with_context(|| format!("parsing scenario {}", path.display()))?;
            Arc::new(scenario)
        }
        None => Arc::new(AllEdgesActive),
    };

    let fetcher = ReplayFetcher::from_file(&args.fixture).await?;
    info!(fixture = %args.fixture.display(), recordings = fetcher.len(), "Replay fetcher ready");

    let pipeline = Pipeline::new(
        config,
        Arc::new(fetcher),
        Arc::new(JsonFileRepository::new(&args.store_dir)),
        scenario,
    );

    let mut request = ResolveRequest::new(args.parameter.clone(), shape, range, args.slice)
        .with_options(ResolveOptions {
            bust_cache: args.bust_cache,
            maturity_days: args.maturity_days,
            ..Default::default()
        });
    if args.latency {
        request = request.with_latency(LatencyContext {
            edge_id: args.edge.unwrap_or(args.parameter),
            ..Default::default()
        });
    }

    let now: DateTime<Utc> = match args.today {
        Some(day) => day.and_time(NaiveTime::MIN).and_utc(),
        None => Utc::now(),
    };

    let result = pipeline.resolve(&request, now).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[derive(Serialize)]
struct EntrySummary {
    slice_kind: SliceKind,
    range: DateRange,
    signature: String,
    days: usize,
    n_total: u64,
    k_total: u64,
    retrieved_at: DateTime<Utc>,
}

async fn inspect(store_dir: PathBuf, parameter: String) -> Result<()> {
    let repo = JsonFileRepository::new(&store_dir);
    let Some(store) = repo.load(&parameter).await? else {
        bail!("no stored series for {parameter} in {}", store_dir.display());
    };

    let summaries: Vec<EntrySummary> = store
        .entries
        .iter()
        .map(|e| EntrySummary {
            slice_kind: e.slice_kind,
            range: e.range,
            signature: e.query_signature.short().to_string(),
            days: e.dates.len(),
            n_total: e.n_total,
            k_total: e.k_total,
            retrieved_at: e.retrieved_at,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    store
        .validate()
        .with_context(|| format!("{parameter} failed invariant checks"))?;
    info!(parameter = %parameter, entries = store.entries.len(), "Invariants hold");
    Ok(())
}
