use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use entityfix_core::config::{FixConfig, load_config};
use entityfix_core::db::{open_connection, table_exists};
use entityfix_core::entities::canonical_rules;
use entityfix_core::runner::{FixRunner, MatchRecord, RunMode, RunReport, VerifyReport};
use entityfix_core::runtime::{
    PathOverrides, ResolvedPaths, ensure_db_ready, inspect_runtime, materialize_starter_config,
    resolve_config_path, resolve_db_path,
};
use similar::{ChangeTag, TextDiff};

#[derive(Debug, Parser)]
#[command(
    name = "entityfix",
    version,
    about = "HTML-entity batch fixer for the directory-site database"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            db: cli.db.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Fix entity-encoded values, then verify (use --dry-run to preview)")]
    Run(RunArgs),
    #[command(about = "Re-scan and fail if any rows still match the entity table")]
    Verify(VerifyArgs),
    #[command(about = "Report candidate rows per configured location without writing")]
    Scan,
    #[command(about = "Print the canonical entity table")]
    Rules,
    Status,
    Init(InitArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, help = "Report intended changes without writing them")]
    dry_run: bool,
    #[arg(long, value_name = "PATH", help = "Also write the report as JSON")]
    json: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long, value_name = "PATH", help = "Also write the report as JSON")]
    json: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Run(args)) => run_fix(&runtime, args),
        Some(Commands::Verify(args)) => run_verify(&runtime, args),
        Some(Commands::Scan) => run_scan(&runtime),
        Some(Commands::Rules) => run_rules(),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Init(args)) => run_init(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_fix(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_db_ready(&paths, &status)?;

    let connection = open_connection(&paths.db_path)?;
    let runner = FixRunner::new(&connection, canonical_rules(), &config.scan);
    let mode = if args.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Live
    };
    let report = runner.run(mode)?;

    println!("entity fix run");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("mode: {}", report.mode.as_str());
    print_run_report(&report);

    if args.dry_run {
        for record in &report.matches {
            print_match_preview(record);
        }
    }
    if let Some(verify) = &report.verify {
        print_verify_report(verify);
        if verify.remaining > 0 {
            println!(
                "warning: {} rows still match after the fix; re-run or extend the entity table",
                verify.remaining
            );
        }
    }
    if let Some(path) = &args.json {
        write_json_artifact(path, &report)?;
    }
    print_warnings(&status.warnings);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_verify(runtime: &RuntimeOptions, args: VerifyArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_db_ready(&paths, &status)?;

    let connection = open_connection(&paths.db_path)?;
    let runner = FixRunner::new(&connection, canonical_rules(), &config.scan);
    let verify = runner.verify()?;

    println!("entity verify");
    println!("db_path: {}", normalize_path(&paths.db_path));
    print_verify_report(&verify);
    if let Some(path) = &args.json {
        write_json_artifact(path, &verify)?;
    }
    print_warnings(&status.warnings);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if verify.remaining > 0 {
        bail!("verification found {} rows still matching", verify.remaining);
    }
    Ok(())
}

fn run_scan(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_db_ready(&paths, &status)?;

    let connection = open_connection(&paths.db_path)?;
    let runner = FixRunner::new(&connection, canonical_rules(), &config.scan);
    let report = runner.run(RunMode::DryRun)?;

    println!("entity scan");
    println!("db_path: {}", normalize_path(&paths.db_path));
    for location in &config.scan {
        let count = report
            .matches
            .iter()
            .filter(|record| {
                record.table == location.table && record.column == location.column
            })
            .count();
        println!("scan.{}: {count}", location.display_name());
    }
    println!("scan.total_matches: {}", report.matches.len());
    print_location_errors(&report);
    print_warnings(&status.warnings);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_rules() -> Result<()> {
    let rules = canonical_rules();
    println!("entity rules");
    println!("rules.count: {}", rules.len());
    for rule in rules {
        println!("{} -> {}", rule.encoded, rule.decoded);
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("rules.count: {}", canonical_rules().len());
    println!("scan_locations.count: {}", config.scan.len());
    if status.db_exists {
        let connection = open_connection(&paths.db_path)?;
        for location in &config.scan {
            let present = table_exists(&connection, &location.table)?;
            println!(
                "scan_locations.location: {} ({})",
                location.display_name(),
                if present { "table found" } else { "table missing" }
            );
        }
    } else {
        for location in &config.scan {
            println!("scan_locations.location: {}", location.display_name());
        }
    }
    print_warnings(&status.warnings);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    dotenvy::dotenv().ok();
    let cwd = env::current_dir().context("failed to read current directory")?;
    let overrides = PathOverrides {
        db: runtime.db.clone(),
        config: runtime.config.clone(),
    };
    let (config_path, config_source) = resolve_config_path(&cwd, &overrides);

    let wrote = materialize_starter_config(&config_path, args.force)?;
    if wrote {
        println!("Wrote config: {}", normalize_path(&config_path));
    } else {
        println!(
            "Config already exists: {} (use --force to overwrite)",
            normalize_path(&config_path)
        );
    }
    if runtime.diagnostics {
        println!("config_source: {}", config_source.as_str());
    }
    Ok(())
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, FixConfig)> {
    dotenvy::dotenv().ok();
    let cwd = env::current_dir().context("failed to read current directory")?;
    let overrides = PathOverrides {
        db: runtime.db.clone(),
        config: runtime.config.clone(),
    };

    let (config_path, config_source) = resolve_config_path(&cwd, &overrides);
    let config = load_config(&config_path)?;
    let (db_path, db_source) = resolve_db_path(&cwd, &overrides, &config);

    Ok((
        ResolvedPaths {
            db_path,
            config_path,
            db_source,
            config_source,
        },
        config,
    ))
}

fn print_run_report(report: &RunReport) {
    println!("report.total_scanned: {}", report.total_scanned);
    println!("report.total_updated: {}", report.total_updated);
    println!("report.total_errored: {}", report.total_errored);
    println!("report.matches: {}", report.matches.len());
    if report.per_entity_counts.is_empty() {
        println!("report.entities: <none>");
    } else {
        for (entity, count) in &report.per_entity_counts {
            println!("report.entity.{entity}: {count}");
        }
    }
    print_location_errors(report);
    for error in &report.update_errors {
        println!(
            "update_error: {} id={} ({})",
            error.table, error.record_id, error.error
        );
    }
}

fn print_location_errors(report: &RunReport) {
    for error in &report.location_errors {
        println!(
            "location_error: {}.{} ({})",
            error.table, error.column, error.error
        );
    }
}

fn print_verify_report(verify: &VerifyReport) {
    println!("verify.remaining: {}", verify.remaining);
    for row in &verify.rows {
        println!("verify.row: {}.{} id={}", row.table, row.column, row.record_id);
    }
    for error in &verify.location_errors {
        println!(
            "verify.location_error: {}.{} ({})",
            error.table, error.column, error.error
        );
    }
}

fn print_match_preview(record: &MatchRecord) {
    println!(
        "would update {}.{} id={}",
        record.table, record.column, record.record_id
    );
    let diff = TextDiff::from_lines(
        record.original_value.as_str(),
        record.decoded_value.as_str(),
    );
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        print!("  {sign} {}", change.value());
        if change.missing_newline() {
            println!();
        }
    }
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn write_json_artifact<T: serde::Serialize>(path: &Path, report: &T) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(report).context("failed to serialize report as JSON")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    println!("json_report: {}", normalize_path(path));
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
