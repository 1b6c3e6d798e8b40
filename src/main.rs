use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use testrollup::aggregate::{CategoryRollup, SuiteSummary, TestSummary};
use testrollup::config::RollupConfig;
use testrollup::history::HistoryKind;
use testrollup::ingest::BuildDocument;
use testrollup::model::{TestCategory, TestExecution};
use testrollup::status::{MergeOutcome, Status};
use testrollup::ReportingService;

#[derive(Parser)]
#[command(
    name = "testrollup",
    about = "Test-status reconciliation and reporting",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $TESTROLLUP_CONFIG, then ./testrollup.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database
    Init,

    /// Import a build document (JSON)
    Import {
        /// Path to the build document
        #[arg(long)]
        file: PathBuf,
    },

    /// Update an execution's status
    Status {
        #[command(subcommand)]
        action: StatusAction,
    },

    /// Summarize executions
    Rollup {
        #[command(subcommand)]
        action: RollupAction,
    },

    /// Find earlier comparable runs of a test
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum StatusAction {
    /// Fold a status observation through the lattice
    Merge {
        #[arg(long)]
        execution: i64,
        /// Status token (PASS, FAIL, ERROR, ...)
        #[arg(long)]
        status: String,
        /// Expected category of the execution
        #[arg(long)]
        category: Option<TestCategory>,
    },

    /// Overwrite a status without merging
    Set {
        #[arg(long)]
        execution: i64,
        #[arg(long)]
        status: String,
        #[arg(long)]
        category: Option<TestCategory>,
    },
}

#[derive(Subcommand)]
enum RollupAction {
    /// Counts for one suite
    Suite {
        #[arg(long)]
        suite: i64,
    },

    /// Counts for one group across all categories
    Group {
        #[arg(long)]
        build: i64,
        /// Group name; omit for the ungrouped bucket
        #[arg(long)]
        group: Option<String>,
    },

    /// Every group of a category, most significant first
    Groups {
        #[arg(long)]
        build: i64,
        #[arg(long)]
        category: TestCategory,
    },

    /// Per-category counts for a build
    Build {
        #[arg(long)]
        build: i64,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Most recent earlier passing run
    LastPass {
        #[arg(long)]
        execution: i64,
        #[arg(long)]
        category: Option<TestCategory>,
    },

    /// Most recent earlier non-passing run
    LastFailure {
        #[arg(long)]
        execution: i64,
        #[arg(long)]
        category: Option<TestCategory>,
    },

    /// Every earlier comparable run, most recent first
    Full {
        #[arg(long)]
        execution: i64,
        #[arg(long)]
        category: Option<TestCategory>,
    },
}

fn init_tracing(config: &RollupConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary_header() {
    println!(
        "{:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
        "Scope", "Total", "Pass", "Fail", "Error", "Skip", "Run", "Long"
    );
    println!("{:-<24}-|-{:-<6}-|-{:-<6}-|-{:-<6}-|-{:-<6}-|-{:-<6}-|-{:-<6}-|-{:-<6}", "", "", "", "", "", "", "", "");
}

fn print_summary_row(label: &str, s: &TestSummary) {
    println!(
        "{:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
        label,
        s.total,
        s.count(Status::Pass),
        s.count(Status::Fail),
        s.count(Status::Error) + s.count(Status::Kill),
        s.count(Status::Skip) + s.count(Status::Blacklist),
        s.count(Status::Running) + s.count(Status::Pending),
        s.long_running,
    );
}

fn print_outcome(execution: i64, outcome: &MergeOutcome) {
    if let Some(token) = &outcome.invalid_token {
        println!("warning: unrecognised status token {:?}", token);
    }
    if outcome.changed() {
        println!("execution {}: {} -> {}", execution, outcome.previous, outcome.status);
    } else {
        println!("execution {}: {} (unchanged)", execution, outcome.status);
    }
}

fn print_execution(e: &TestExecution) {
    let start = e
        .start_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!("{:<8} | {:<10} | {:<25} | {}", e.id, e.status.as_token(), start, e.identity);
}

/// Resolve an execution, checking its category when one was given.
fn locate(
    service: &ReportingService,
    execution: i64,
    category: Option<TestCategory>,
) -> Result<TestExecution> {
    let Some((owner, found)) = service.find_execution(execution)? else {
        bail!("execution {} not found", execution);
    };
    if let Some(expected) = category {
        if expected != owner {
            bail!("execution {} belongs to category {}, not {}", execution, owner, expected);
        }
    }
    Ok(found)
}

fn write_status(
    service: &ReportingService,
    json: bool,
    execution: i64,
    category: Option<TestCategory>,
    apply: impl FnOnce() -> Result<Option<MergeOutcome>>,
) -> Result<()> {
    locate(service, execution, category)?;
    let Some(outcome) = apply()? else {
        bail!("execution {} not found", execution);
    };
    if json {
        print_json(&outcome)
    } else {
        print_outcome(execution, &outcome);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RollupConfig::discover(cli.config.as_deref())?;
    init_tracing(&config);

    let (pool, service) = testrollup::open(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            let path = config.storage.database_path.display().to_string();
            tracing::info!(%path, "database ready");
            if json {
                print_json(&serde_json::json!({ "database": path, "ready": true }))?;
            } else {
                println!("Database ready at {}", path);
            }
        }
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let doc = BuildDocument::from_json(&text)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let summary = service.import(&pool, &doc)?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "Imported build {} ({}): {} suites, {} executions",
                    summary.build_id,
                    doc.version,
                    summary.suite_ids.len(),
                    summary.execution_ids.len()
                );
                if summary.invalid_tokens > 0 {
                    println!("warning: {} unrecognised status tokens clamped", summary.invalid_tokens);
                }
            }
        }
        Commands::Status { action } => match action {
            StatusAction::Merge {
                execution,
                status,
                category,
            } => {
                write_status(&service, json, execution, category, || {
                    Ok(service.merge_status(execution, &status)?)
                })?;
            }
            StatusAction::Set {
                execution,
                status,
                category,
            } => {
                let status = Status::from_token(&status)?;
                write_status(&service, json, execution, category, || {
                    Ok(service.set_status(execution, status)?)
                })?;
            }
        },
        Commands::Rollup { action } => match action {
            RollupAction::Suite { suite } => {
                let Some(summary) = service.summarize_suite_bounded(suite).await? else {
                    bail!("suite {} not found", suite);
                };
                if json {
                    print_json(&summary)?;
                } else {
                    print_summary_header();
                    print_summary_row(&summary.label, &summary.summary);
                }
            }
            RollupAction::Group { build, group } => {
                let summary = service.rollup_group_bounded(build, group.clone()).await?;
                if json {
                    print_json(&summary)?;
                } else {
                    print_summary_header();
                    print_summary_row(group.as_deref().unwrap_or("(ungrouped)"), &summary);
                }
            }
            RollupAction::Groups { build, category } => {
                let groups: Vec<SuiteSummary> = service.rollup_groups(build, category)?;
                if json {
                    print_json(&groups)?;
                } else if groups.is_empty() {
                    println!("No {} executions in build {}.", category, build);
                } else {
                    print_summary_header();
                    for g in &groups {
                        print_summary_row(&g.label, &g.summary);
                    }
                }
            }
            RollupAction::Build { build } => {
                let Some(report) = service.rollup_build(build).await? else {
                    bail!("build {} not found", build);
                };
                if json {
                    print_json(&report)?;
                } else {
                    println!("\nBuild {} ({})", report.build.id, report.build.version);
                    print_summary_header();
                    for (category, rollup) in &report.categories {
                        match rollup {
                            CategoryRollup::Available { summary } => {
                                print_summary_row(category.as_str(), summary)
                            }
                            CategoryRollup::Unavailable { reason } => {
                                println!("{:<24} | unavailable: {}", category.as_str(), reason)
                            }
                        }
                    }
                    print_summary_row("total", &report.total);
                    if report.is_partial() {
                        println!("(partial: some categories could not be summarized)");
                    }
                    println!();
                }
            }
        },
        Commands::History { action } => {
            let (execution, category, kind) = match action {
                HistoryAction::LastPass {
                    execution,
                    category,
                } => (execution, category, HistoryKind::LastPass),
                HistoryAction::LastFailure {
                    execution,
                    category,
                } => (execution, category, HistoryKind::LastFailure),
                HistoryAction::Full {
                    execution,
                    category,
                } => (execution, category, HistoryKind::Full),
            };
            let reference = locate(&service, execution, category)?;
            let found = service.history_bounded(&reference, kind).await?;
            tracing::debug!(execution, ?category, matches = found.len(), "history lookup");
            if json {
                print_json(&found)?;
            } else if found.is_empty() {
                println!("No earlier comparable runs of execution {}.", execution);
            } else {
                println!("{:<8} | {:<10} | {:<25} | Test", "Id", "Status", "Started");
                println!("{:-<8}-|-{:-<10}-|-{:-<25}-|-{:-<30}", "", "", "", "");
                for e in &found {
                    print_execution(e);
                }
            }
        }
    }

    Ok(())
}
