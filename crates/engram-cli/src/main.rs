//! Engram CLI
//!
//! Process-boundary surface over the memory engine: consolidate, retrieve,
//! and health. Errors print as a compact taxonomy tag plus a one-line reason;
//! exit codes follow the documented mapping.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use engram_core::{
    EngineConfig, EngineError, HealthReport, MemoryEngine, Record, RecordKind, Retrieved,
    RetrievalOptions, RetrievalQuery, Strategy,
};

/// Engram - persistent memory engine for agent sessions
#[derive(Parser)]
#[command(name = "engram")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the engram memory engine")]
struct Cli {
    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a consolidation pass over a project
    Consolidate {
        #[arg(long)]
        project_id: String,
        /// Strategy: fast, balanced, or quality
        #[arg(long, default_value = "balanced")]
        strategy: String,
        /// Cap on patterns emitted this run
        #[arg(long)]
        max_patterns: Option<usize>,
    },

    /// Hybrid retrieval against a project
    Retrieve {
        #[arg(long)]
        project_id: String,
        /// Query text
        #[arg(long)]
        query: String,
        /// Number of results
        #[arg(long, default_value = "10")]
        k: usize,
        /// Restrict to record kinds (comma-separated: event,fact,pattern)
        #[arg(long)]
        kinds: Option<String>,
        /// Require tags (comma-separated)
        #[arg(long)]
        tags: Option<String>,
        /// Confidence floor
        #[arg(long)]
        min_confidence: Option<f64>,
    },

    /// Lifecycle counts, contradiction backlog, and consolidation age
    Health {
        #[arg(long)]
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = run(&cli).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", format!("[{}]", err.tag()).red().bold(), first_line(&err));
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: &Cli) -> Result<(), EngineError> {
    let config = EngineConfig::from_env()?;
    let engine = MemoryEngine::connect(config, None, None)?;

    match &cli.command {
        Commands::Consolidate {
            project_id,
            strategy,
            max_patterns,
        } => {
            let strategy = Strategy::parse_name(strategy).ok_or_else(|| {
                EngineError::Validation(format!(
                    "unknown strategy '{strategy}', expected fast, balanced, or quality"
                ))
            })?;
            let report = engine
                .consolidate(project_id, strategy, *max_patterns, None)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", "=== Consolidation ===".cyan().bold());
                println!("run:        {}", report.run_id);
                println!("strategy:   {}", report.strategy);
                println!("events:     {}", report.events_scored);
                println!("clusters:   {}", report.clusters_formed);
                println!("patterns:   {}", report.patterns_emitted.to_string().green());
                println!("procedures: {}", report.procedures_derived);
                println!("conflicts:  {}", report.conflicts_resolved);
                println!("duration:   {} ms", report.duration_ms);
                if report.validator_unavailable {
                    println!("{}", "validator unavailable, prior confidence kept".yellow());
                }
            }
        }

        Commands::Retrieve {
            project_id,
            query,
            k,
            kinds,
            tags,
            min_confidence,
        } => {
            let kinds = match kinds {
                Some(raw) => Some(parse_kinds(raw)?),
                None => None,
            };
            let request = RetrievalQuery {
                text: Some(query.clone()),
                kinds,
                tags: tags
                    .as_deref()
                    .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                min_confidence: *min_confidence,
                ..Default::default()
            };
            let results = engine
                .retrieve(project_id, request, *k, RetrievalOptions::default(), None)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }

        Commands::Health { project_id } => {
            let report = engine.health(project_id, None).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_health(&report);
            }
        }
    }
    Ok(())
}

fn parse_kinds(raw: &str) -> Result<Vec<RecordKind>, EngineError> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            RecordKind::parse_name(s)
                .ok_or_else(|| EngineError::Validation(format!("unknown record kind '{s}'")))
        })
        .collect()
}

fn print_results(results: &[Retrieved]) {
    if results.is_empty() {
        println!("{}", "no results".dimmed());
        return;
    }
    println!("{}", "=== Results ===".cyan().bold());
    for (rank, hit) in results.iter().enumerate() {
        let snippet = match &hit.record {
            Record::Event(e) => e.content.clone(),
            Record::Fact(f) => f.content.clone(),
            Record::Pattern(p) => p.content.clone(),
            Record::Task(t) => t.content.clone(),
            Record::Procedure(p) => p.name.clone(),
            Record::Entity(e) => e.name.clone(),
            Record::Relation(r) => format!("{} -> {}", r.from_entity, r.to_entity),
        };
        let snippet: String = snippet.chars().take(72).collect();
        let mut flags = Vec::new();
        if hit.diagnostics.labile {
            flags.push("labile");
        }
        if hit.diagnostics.degraded {
            flags.push("degraded");
        }
        if hit.diagnostics.reranked {
            flags.push("reranked");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(","))
        };
        println!(
            "{:>2}. {:.3} {} {} {}{}",
            rank + 1,
            hit.score,
            hit.record.kind().as_str().blue(),
            hit.record.id().dimmed(),
            snippet,
            flags.yellow(),
        );
    }
}

fn print_health(report: &HealthReport) {
    println!("{}", "=== Project Health ===".cyan().bold());
    println!("project: {}", report.project_id);
    for (kind, counts) in &report.counts {
        let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
        println!("  {:<10} {}", kind, summary.join(" "));
    }
    println!("unconsolidated events: {}", report.unconsolidated_events);
    let backlog = report.contradiction_backlog;
    let backlog_str = if backlog > 0 {
        backlog.to_string().yellow().to_string()
    } else {
        backlog.to_string()
    };
    println!("contradiction backlog: {backlog_str}");
    match report.last_consolidation_age_seconds {
        Some(age) => println!("last consolidation: {age}s ago"),
        None => println!("last consolidation: {}", "never".dimmed()),
    }
    println!(
        "pool: size={} idle={} pending={}",
        report.pool_size, report.pool_idle, report.pool_pending
    );
}

/// Exit codes: 0 success, 2 invalid arguments, 3 not found, 4 timeout,
/// 5 unavailable, 64 internal invariant violation.
fn exit_code(err: &EngineError) -> u8 {
    match err.tag() {
        "validation" => 2,
        "not_found" => 3,
        "timeout" => 4,
        "unavailable" | "rate_limited" => 5,
        _ => 64,
    }
}

fn first_line(err: &EngineError) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}
