use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

use vote_reconcile::{
    get_voting_dates, open_read_only, parse_voting_date, setup_database, BfsCode, Config,
    DatasetStore, FieldComparison, MergerGraph, ReconciliationEngine, ReconciliationVerdict,
    TallyField, VerdictStatus,
};

#[derive(Parser)]
#[command(name = "vote-reconcile")]
#[command(about = "Check merger-aware municipal vote aggregates against the raw results")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List voting dates with results in the database
    Dates,

    /// List current municipalities formed by at least one merger
    Municipalities,

    /// Show the predecessor codes of a municipality
    Predecessors {
        code: BfsCode,

        /// Only follow mergers effective on or before this date
        #[arg(long, value_name = "DATE")]
        as_of: Option<String>,
    },

    /// Reconcile one municipality on one voting date
    #[command(after_help = "\
Examples:
  vote-reconcile reconcile --date 20030518 --code 5226
  vote-reconcile reconcile --date 2003-05-18 --code 5226 --json")]
    Reconcile {
        /// Voting date (YYYYMMDD or YYYY-MM-DD)
        #[arg(long)]
        date: String,

        /// Current BFS municipality code
        #[arg(long)]
        code: BfsCode,

        /// Print the full verdict as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile many municipalities and dates, report match statistics
    Validate {
        /// Voting date, repeatable (default: every date in the database)
        #[arg(long = "date", value_name = "DATE")]
        dates: Vec<String>,

        /// Municipality code, repeatable (default: every merged municipality)
        #[arg(long = "code", value_name = "CODE")]
        codes: Vec<BfsCode>,

        /// Write the comparison rows to this CSV file
        #[arg(long, value_name = "PATH")]
        csv: Option<PathBuf>,
    },

    /// Create the tables and views in an empty database file
    InitDb {
        /// Database file (default: configured database path)
        path: Option<PathBuf>,
    },
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Dates => run_dates(&config),
        Commands::Municipalities => run_municipalities(&config),
        Commands::Predecessors { code, as_of } => run_predecessors(&config, code, as_of.as_deref()),
        Commands::Reconcile { date, code, json } => run_reconcile(&config, &date, code, json),
        Commands::Validate { dates, codes, csv } => run_validate(&config, &dates, codes, csv),
        Commands::InitDb { path } => run_init_db(&config, path),
    }
}

fn open_database(config: &Config) -> Result<Connection> {
    open_read_only(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

fn build_engine(config: &Config, conn: &Connection) -> Result<ReconciliationEngine> {
    let graph = MergerGraph::load(conn).context("Failed to load merger history")?;
    Ok(ReconciliationEngine::new(graph, DatasetStore::from_config(config)))
}

fn run_dates(config: &Config) -> Result<ExitCode> {
    let conn = open_database(config)?;
    let dates = get_voting_dates(&conn)?;

    println!("📅 {} voting date(s)", dates.len());
    for summary in &dates {
        println!("  {}  {:>3} proposal(s)", summary.date, summary.proposal_count);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_municipalities(config: &Config) -> Result<ExitCode> {
    let conn = open_database(config)?;
    let graph = MergerGraph::load(&conn)?;
    let listing = graph.mergeable_municipalities();

    println!("🏘️  {} merged municipalit(ies)", listing.len());
    for entry in &listing {
        println!("  {:>5}  {:<30} {} merger(s)", entry.code, entry.name, entry.merger_count);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_predecessors(config: &Config, code: BfsCode, as_of: Option<&str>) -> Result<ExitCode> {
    let as_of = as_of.map(parse_voting_date).transpose()?;
    let conn = open_database(config)?;
    let graph = MergerGraph::load(&conn)?;
    let set = graph.resolve_predecessors(code, as_of)?;

    println!("🔗 Predecessors of {} ({} code(s))", code, set.len());
    for member in &set.members {
        let when = member
            .mutation_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>5}  {:<30} merged {}  depth {}",
            member.code,
            member.name.as_deref().unwrap_or("?"),
            when,
            member.depth
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_reconcile(config: &Config, date: &str, code: BfsCode, json: bool) -> Result<ExitCode> {
    let date = parse_voting_date(date)?;
    let conn = open_database(config)?;
    let engine = build_engine(config, &conn)?;

    let verdict = engine
        .reconcile(&conn, date, code)
        .with_context(|| format!("Reconciliation of {code} on {date} failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&verdict);
    }

    Ok(if verdict.is_perfect_match() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_validate(
    config: &Config,
    dates: &[String],
    codes: Vec<BfsCode>,
    csv_path: Option<PathBuf>,
) -> Result<ExitCode> {
    let conn = open_database(config)?;
    let engine = build_engine(config, &conn)?;

    let dates = if dates.is_empty() {
        get_voting_dates(&conn)?.into_iter().map(|s| s.date).collect()
    } else {
        dates
            .iter()
            .map(|d| parse_voting_date(d))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    let codes = if codes.is_empty() {
        engine
            .graph()
            .mergeable_municipalities()
            .into_iter()
            .map(|m| m.code)
            .collect()
    } else {
        codes
    };

    println!("🔍 Validating {} municipalit(ies) across {} date(s)...", codes.len(), dates.len());
    let summary = engine.validate_all(&conn, &dates, &codes)?;

    let total = summary.total_rows();
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Compared proposal rows: {}", total);
    for field in TallyField::ALL {
        let matched = summary.match_count(field);
        let pct = if total > 0 { 100.0 * matched as f64 / total as f64 } else { 0.0 };
        println!("  {:<8} {:>6}/{} match ({:.1}%)", field.label(), matched, total, pct);
    }
    for (status, count) in &summary.verdicts {
        println!("  {:<26} {}", status.as_str(), count);
    }
    if !summary.skipped_dates.is_empty() {
        println!("⚠️  {} date(s) without dataset skipped", summary.skipped_dates.len());
    }
    for failure in &summary.failures {
        println!("❌ {}", failure);
    }

    let mismatching: Vec<_> = summary.mismatches().collect();
    for row in mismatching.iter().take(10) {
        println!(
            "  ✗ {} {} ({}) proposal {}: yes {} vs {}",
            row.voting_date,
            row.municipality_code,
            row.municipality_name,
            row.proposal_code,
            row.aggregated_yes,
            row.recomputed_yes
        );
    }

    if let Some(path) = csv_path {
        let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        summary.write_csv(file)?;
        println!("💾 Comparison rows written to {}", path.display());
    }

    Ok(if mismatching.is_empty() && summary.failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_init_db(config: &Config, path: Option<PathBuf>) -> Result<ExitCode> {
    let path = path.unwrap_or_else(|| config.database_path.clone());
    let conn = Connection::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    setup_database(&conn)?;
    println!("✓ Schema and views ready in {}", path.display());
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Text rendering
// ============================================================================

fn print_verdict(verdict: &ReconciliationVerdict) {
    let icon = match verdict.status {
        VerdictStatus::PerfectMatch => "✅",
        VerdictStatus::Mismatch => "❌",
        VerdictStatus::NoData => "∅",
        VerdictStatus::ProposalAlignmentError => "⚠️",
    };

    println!("{} {}", icon, verdict.summary());
    println!("   Dataset: {}", verdict.source_file);
    println!(
        "   Predecessors: {}",
        verdict
            .predecessors
            .ordered_codes()
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    for edge in &verdict.timeline {
        println!(
            "     {}  {} {} → {} {}",
            edge.mutation_date, edge.old_code, edge.old_name, edge.new_code, edge.new_name
        );
    }

    for proposal in &verdict.proposals {
        println!(
            "\n   Proposal {} {:?}: {}",
            proposal.proposal_code,
            proposal.outcome,
            proposal.title_de.as_deref().unwrap_or("")
        );
        for field in &proposal.fields {
            println!("     {}", format_field(field));
        }
        for tally in &proposal.raw_tallies {
            println!(
                "       {:>5} {:<28} yes {:>8} no {:>8} valid {:>8}",
                tally.code, tally.name, tally.yes_count, tally.no_count, tally.valid_count
            );
        }
        if !proposal.absent_predecessors.is_empty() {
            println!("     not in dataset: {:?}", proposal.absent_predecessors);
        }
    }

    for caveat in &verdict.caveats {
        println!("\n   ⚠️  {}", caveat);
    }
}

fn format_field(field: &FieldComparison) -> String {
    let show = |value: Option<i64>| match (value, field.field) {
        (None, _) => "-".to_string(),
        (Some(v), TallyField::TurnoutPct) => format!("{:.2}%", v as f64 / 100.0),
        (Some(v), _) => v.to_string(),
    };
    format!(
        "{} {:<8} aggregated {:>10}  recomputed {:>10}",
        if field.matches { "✓" } else { "✗" },
        field.field.label(),
        show(field.aggregated),
        show(field.recomputed)
    )
}
