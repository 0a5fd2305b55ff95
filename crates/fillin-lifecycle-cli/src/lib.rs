//! Operator command surface for the FILLIN report lifecycle store.
//!
//! Hosts can drive the lifecycle store through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_lifecycle_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_lifecycle`] for execution against an existing [`SqliteLifecycleStore`].
//!
//! Structured output goes to stdout; diagnostics go to stderr through
//! `tracing`, filtered by the `FILLIN_LOG` environment variable.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fillin_lifecycle_core::{
    format_rfc3339, from_unix_millis, now_utc, parse_rfc3339_utc, FeedbackEventInput,
    FeedbackKind, LifecycleRuleset, MapDecision, ReportCategory, ReportId, ReportInput,
    ReportStatus,
};
use fillin_lifecycle_store_sqlite::{
    FeedbackReceipt, ProjectorCheck, ProjectorIssueSeverity, ProjectorStaleReport,
    ProjectorStatus, ReportView, SqliteLifecycleStore,
};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FILLIN_LOG";

#[derive(Debug, Parser)]
#[command(name = "fillin")]
#[command(about = "FILLIN report lifecycle CLI")]
pub struct Cli {
    #[arg(long, env = "FILLIN_DB", default_value = "./fillin.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    Feedback {
        #[command(subcommand)]
        command: Box<FeedbackCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Transitions {
        #[command(subcommand)]
        command: Box<TransitionsCommand>,
    },
    Replay(ReplayArgs),
    Projector {
        #[command(subcommand)]
        command: Box<ProjectorCommand>,
    },
    Map {
        #[command(subcommand)]
        command: Box<MapCommand>,
    },
    Ruleset {
        #[command(subcommand)]
        command: Box<RulesetCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Create(ReportCreateArgs),
    Show(ReportShowArgs),
    List(ReportListArgs),
    View(ReportIdArgs),
}

#[derive(Debug, Args)]
pub struct ReportCreateArgs {
    #[arg(long)]
    category: CategoryArg,
    #[arg(long)]
    title: String,
    #[arg(long, allow_negative_numbers = true)]
    latitude: f64,
    #[arg(long, allow_negative_numbers = true)]
    longitude: f64,
    #[arg(long)]
    submitted_by: String,
    #[arg(long)]
    created_at: Option<String>,
    #[arg(long)]
    report_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReportShowArgs {
    #[arg(long)]
    report_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReportListArgs {
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReportIdArgs {
    #[arg(long)]
    report_id: String,
}

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    Submit(FeedbackSubmitArgs),
}

#[derive(Debug, Args)]
pub struct FeedbackSubmitArgs {
    #[arg(long)]
    report_id: String,
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    voter_id: String,
    #[arg(long, conflicts_with = "occurred_at_millis")]
    occurred_at: Option<String>,
    #[arg(long)]
    occurred_at_millis: Option<i64>,
    #[arg(long, default_value_t = 1)]
    ruleset_version: u32,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    report_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum TransitionsCommand {
    List(ReportIdArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[arg(long)]
    from_event_seq: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum ProjectorCommand {
    Status(JsonFlagArgs),
    Check(JsonFlagArgs),
    StaleReports(ProjectorStaleReportsArgs),
}

#[derive(Debug, Args)]
pub struct JsonFlagArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ProjectorStaleReportsArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum MapCommand {
    Preview(MapPreviewArgs),
}

#[derive(Debug, Args)]
pub struct MapPreviewArgs {
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long = "report")]
    reports: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetCommand {
    Show,
    Load(RulesetLoadArgs),
}

#[derive(Debug, Args)]
pub struct RulesetLoadArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    Danger,
    Inconvenience,
    Discovery,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Active,
    Expiring,
    Expired,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Positive,
    Negative,
}

/// Installs the stderr `tracing` subscriber, filtered by `FILLIN_LOG`
/// (default `warn`). Repeated calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_lifecycle_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_lifecycle_with_db(db_path: &Path, command: Command) -> Result<()> {
    tracing::debug!(db = %db_path.display(), "opening lifecycle store");
    let mut store = SqliteLifecycleStore::open(db_path)?;
    store.migrate()?;
    run_lifecycle(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, persistence, replay, or
/// retrieval operations fail.
pub fn run_lifecycle(command: Command, store: &mut SqliteLifecycleStore) -> Result<()> {
    match command {
        Command::Report { command } => run_report(*command, store),
        Command::Feedback { command } => run_feedback(*command, store),
        Command::Events { command } => run_events(*command, store),
        Command::Transitions { command } => run_transitions(*command, store),
        Command::Replay(args) => {
            let report = store.replay(args.from_event_seq)?;
            print_json(&report)
        }
        Command::Projector { command } => run_projector(*command, store),
        Command::Map { command } => run_map(*command, store),
        Command::Ruleset { command } => run_ruleset(*command, store),
    }
}

fn run_report(command: ReportCommand, store: &mut SqliteLifecycleStore) -> Result<()> {
    match command {
        ReportCommand::Create(args) => {
            let input = ReportInput {
                report_id: args.report_id.as_deref().map(parse_report_id).transpose()?,
                category: map_category(args.category),
                title: args.title,
                latitude: args.latitude,
                longitude: args.longitude,
                submitted_by: args.submitted_by,
                created_at: parse_optional_utc(args.created_at.as_deref())?,
            };

            let record = store.create_report(&input)?;
            print_json(&record)
        }
        ReportCommand::Show(args) => {
            let report_id = parse_report_id(&args.report_id)?;
            let as_of = args
                .as_of
                .as_deref()
                .map(parse_utc)
                .transpose()?;

            let Some(report) = store.get_report(report_id)? else {
                return Err(anyhow!("report not found for report_id={report_id}"));
            };
            let Some(lifecycle) = store.get_lifecycle(report_id, as_of)? else {
                return Err(anyhow!(
                    "lifecycle snapshot not found for report_id={report_id}; run `fillin replay`"
                ));
            };

            print_json(&ReportView { report, lifecycle })
        }
        ReportCommand::List(args) => {
            let views = store.list_reports(args.status.map(map_status), args.limit)?;
            print_json(&views)
        }
        ReportCommand::View(args) => {
            let report_id = parse_report_id(&args.report_id)?;
            let view_count = store.record_view(report_id)?;
            print_json(&serde_json::json!({
                "report_id": report_id,
                "view_count": view_count,
            }))
        }
    }
}

fn run_feedback(command: FeedbackCommand, store: &mut SqliteLifecycleStore) -> Result<()> {
    match command {
        FeedbackCommand::Submit(args) => {
            let input = FeedbackEventInput {
                event_id: None,
                ruleset_version: args.ruleset_version,
                report_id: parse_report_id(&args.report_id)?,
                kind: map_kind(args.kind),
                occurred_at: resolve_occurred_at(
                    args.occurred_at.as_deref(),
                    args.occurred_at_millis,
                )?,
                voter_id: args.voter_id,
            };

            let receipt: FeedbackReceipt = store.submit_feedback(&input)?;
            for transition in &receipt.new_transitions {
                tracing::debug!(
                    report_id = %receipt.event.report_id,
                    from = transition.from.as_str(),
                    to = transition.to.as_str(),
                    "feedback moved report"
                );
            }
            print_json(&receipt)
        }
    }
}

fn run_events(command: EventsCommand, store: &SqliteLifecycleStore) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let report_id = parse_report_id(&args.report_id)?;
            let events = store.list_events_for_report(report_id, args.limit)?;
            print_json(&events)
        }
    }
}

fn run_transitions(command: TransitionsCommand, store: &SqliteLifecycleStore) -> Result<()> {
    match command {
        TransitionsCommand::List(args) => {
            let report_id = parse_report_id(&args.report_id)?;
            let transitions = store.list_transitions(report_id)?;
            print_json(&transitions)
        }
    }
}

fn run_projector(command: ProjectorCommand, store: &SqliteLifecycleStore) -> Result<()> {
    match command {
        ProjectorCommand::Status(args) => {
            let status = store.projector_status()?;
            if args.json {
                print_json(&status)?;
            } else {
                print_projector_status(&status);
            }
            Ok(())
        }
        ProjectorCommand::Check(args) => {
            let check = store.projector_check()?;
            if args.json {
                print_json(&check)?;
            } else {
                print_projector_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "projector consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
        ProjectorCommand::StaleReports(args) => {
            let stale_reports = store.projector_stale_reports(args.limit)?;
            if args.json {
                print_json(&stale_reports)?;
            } else {
                print_projector_stale_reports(&stale_reports);
            }
            Ok(())
        }
    }
}

fn run_map(command: MapCommand, store: &SqliteLifecycleStore) -> Result<()> {
    match command {
        MapCommand::Preview(args) => {
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            let report_ids = args
                .reports
                .iter()
                .map(|raw| parse_report_id(raw))
                .collect::<Result<Vec<_>>>()?;

            let decisions = store.map_preview(as_of, &report_ids)?;
            if args.json {
                print_json(&build_map_preview_json_payload(as_of, &decisions)?)
            } else {
                print_map_table(&decisions);
                Ok(())
            }
        }
    }
}

fn run_ruleset(command: RulesetCommand, store: &SqliteLifecycleStore) -> Result<()> {
    match command {
        RulesetCommand::Show => {
            let rulesets: Vec<LifecycleRuleset> = store.get_rulesets()?.into_values().collect();
            print_json(&rulesets)
        }
        RulesetCommand::Load(args) => {
            let ruleset = load_ruleset_file(&args.file)?;
            store.upsert_ruleset(&ruleset)?;
            print_json(&ruleset)
        }
    }
}

fn load_ruleset_file(path: &Path) -> Result<LifecycleRuleset> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ruleset file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("ruleset file must be valid JSON: {}", path.display()))?;
    LifecycleRuleset::from_json(&value).map_err(|err| anyhow!("invalid ruleset: {err}"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_utc(raw: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_utc(value),
        None => Ok(now_utc()),
    }
}

fn resolve_occurred_at(rfc3339: Option<&str>, millis: Option<i64>) -> Result<OffsetDateTime> {
    match millis {
        Some(value) => from_unix_millis(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => parse_optional_utc(rfc3339),
    }
}

fn parse_report_id(raw: &str) -> Result<ReportId> {
    ReportId::parse(raw).with_context(|| format!("invalid report id: {raw}"))
}

fn map_category(value: CategoryArg) -> ReportCategory {
    match value {
        CategoryArg::Danger => ReportCategory::Danger,
        CategoryArg::Inconvenience => ReportCategory::Inconvenience,
        CategoryArg::Discovery => ReportCategory::Discovery,
    }
}

fn map_status(value: StatusArg) -> ReportStatus {
    match value {
        StatusArg::Active => ReportStatus::Active,
        StatusArg::Expiring => ReportStatus::Expiring,
        StatusArg::Expired => ReportStatus::Expired,
    }
}

fn map_kind(value: KindArg) -> FeedbackKind {
    match value {
        KindArg::Positive => FeedbackKind::Positive,
        KindArg::Negative => FeedbackKind::Negative,
    }
}

fn print_map_table(decisions: &[MapDecision]) {
    println!(
        "{:<28} {:<14} {:<9} {:<8} {:<10} reasons",
        "report_id", "category", "status", "visible", "positive"
    );
    println!("{}", "-".repeat(100));

    for decision in decisions {
        println!(
            "{:<28} {:<14} {:<9} {:<8} {:<10} {}",
            decision.report_id,
            decision.category.as_str(),
            decision.status.as_str(),
            if decision.visible { "yes" } else { "no" },
            decision
                .positive_millionths
                .map_or_else(|| "n/a".to_string(), |value| value.to_string()),
            decision.reason_codes.join(",")
        );
    }
}

fn print_projector_status(status: &ProjectorStatus) {
    println!(
        "contract={} projector={} projected_event_seq={} latest_event_seq={} lag_events={}",
        status.contract_version,
        status.projector_name,
        status.projected_event_seq,
        status.latest_event_seq,
        status.lag_events
    );
    println!(
        "tracked_reports={} lifecycle_rows={} stale_lifecycle_rows={} reports_without_lifecycle_row={} max_stale_seq_gap={} updated_at={}",
        status.tracked_reports,
        status.lifecycle_rows,
        status.stale_lifecycle_rows,
        status.reports_without_lifecycle_row,
        status.max_stale_seq_gap,
        status.updated_at.as_deref().unwrap_or("n/a")
    );
}

fn print_projector_check(check: &ProjectorCheck) {
    println!("contract={}", check.contract_version);
    print_projector_status(&check.status);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    ProjectorIssueSeverity::Warning => "warning",
                    ProjectorIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `fillin projector stale-reports --json` for affected reports");
    }
}

fn print_projector_stale_reports(stale_reports: &[ProjectorStaleReport]) {
    println!(
        "{:<28} {:<14} projected_event_seq",
        "report_id", "max_event_seq"
    );
    println!("{}", "-".repeat(70));
    for item in stale_reports {
        println!(
            "{:<28} {:<14} {}",
            item.report_id,
            item.max_event_seq,
            item.projected_event_seq
                .map_or_else(|| "none".to_string(), |value| value.to_string())
        );
    }
}

#[derive(Debug, serde::Serialize)]
struct MapPreviewJson<'a> {
    contract_version: &'static str,
    as_of: String,
    decisions: &'a [MapDecision],
}

fn build_map_preview_json_payload(
    as_of: OffsetDateTime,
    decisions: &[MapDecision],
) -> Result<MapPreviewJson<'_>> {
    Ok(MapPreviewJson {
        contract_version: "map_preview.v1",
        as_of: format_rfc3339(as_of).map_err(|err| anyhow!(err.to_string()))?,
        decisions,
    })
}
