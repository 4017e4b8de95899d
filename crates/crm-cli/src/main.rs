use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use crm_import::{run_import, run_link, ImportConfig, ImportSettings};
use crm_repair::{repair_file, RepairMode, RepairOutcome, DEFAULT_TARGET};
use crm_storage::CsvStore;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crm")]
#[command(version, about = "CRM data utilities: workbook import, CSV upkeep, diff-artifact repair")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild a file that had a `git diff` pasted into it.
    Repair {
        /// File to repair.
        #[arg(default_value = DEFAULT_TARGET)]
        path: PathBuf,
        /// Print the reconstructed file instead of writing it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Import the client workbook into the import CSV tables.
    Import {
        /// Workbook path (default: $CRM_WORKBOOK or GESTIONE_CLIENTI.xlsm).
        #[arg(long)]
        workbook: Option<PathBuf>,
        /// Output directory (default: $CRM_STORAGE_DIR or storage).
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Settings file (default: $CRM_IMPORT_SETTINGS or import.yaml).
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Assign client IDs to the imported tables and write the CRM tables.
    Link {
        /// Storage directory (default: $CRM_STORAGE_DIR or storage).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Normalize dates in the stored CRM tables to dd/mm/yyyy.
    FixDates {
        /// Storage directory (default: $CRM_STORAGE_DIR or storage).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        error!("{:?}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn real_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Repair { path, dry_run } => cmd_repair(path, dry_run),
        Commands::Import {
            workbook,
            out_dir,
            settings,
        } => cmd_import(workbook, out_dir, settings),
        Commands::Link { dir } => cmd_link(dir),
        Commands::FixDates { dir } => cmd_fix_dates(dir),
    }
}

fn cmd_repair(path: PathBuf, dry_run: bool) -> Result<()> {
    if !path.exists() {
        Cli::command()
            .error(
                ErrorKind::ValueValidation,
                format!("file {} does not exist", path.display()),
            )
            .exit();
    }

    let mode = if dry_run {
        RepairMode::Preview
    } else {
        RepairMode::Repair
    };
    let outcome =
        repair_file(&path, mode).with_context(|| format!("repairing {}", path.display()))?;
    if let RepairOutcome::Previewed(text) = &outcome {
        print!("{}", text.content);
    }
    println!("{}", outcome.status_line(&path));
    Ok(())
}

fn cmd_import(
    workbook: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    settings: Option<PathBuf>,
) -> Result<()> {
    let mut config = ImportConfig::from_env();
    if let Some(workbook) = workbook {
        config.workbook = workbook;
    }
    if let Some(out_dir) = out_dir {
        config.storage_dir = out_dir;
    }
    if let Some(settings) = settings {
        config.settings_path = settings;
    }
    let settings = ImportSettings::load(&config.settings_path)?;

    let summary = run_import(&config, &settings)?;
    println!(
        "import complete: run_id={} sheets={} clients={} contracts={} excluded={} failed={}",
        summary.run_id,
        summary.sheets_seen,
        summary.clients,
        summary.contracts,
        summary.excluded_sheets.len(),
        summary.failed_sheets.len()
    );
    for failure in &summary.failed_sheets {
        println!("  skipped sheet `{}`: {}", failure.sheet, failure.reason);
    }
    println!(
        "  clients: {}\n  contracts: {}\n  report: {}",
        summary.clients_file.path, summary.contracts_file.path, summary.report_path
    );
    Ok(())
}

fn storage_dir(dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| ImportConfig::from_env().storage_dir)
}

fn cmd_link(dir: Option<PathBuf>) -> Result<()> {
    let store = CsvStore::new(storage_dir(dir));
    let report = run_link(&store)?;
    println!(
        "link complete: clients={} contracts={} unresolved={} duplicate_names={}",
        report.clients,
        report.contracts,
        report.unresolved.len(),
        report.duplicate_names.len()
    );
    Ok(())
}

fn cmd_fix_dates(dir: Option<PathBuf>) -> Result<()> {
    let store = CsvStore::new(storage_dir(dir));
    let reports = store
        .repair_all_dates()
        .with_context(|| format!("fixing dates under {}", store.root().display()))?;
    if reports.is_empty() {
        println!("no CRM tables found in {}", store.root().display());
    }
    for report in reports {
        if report.rewritten {
            println!(
                "fixed {}: {} values changed, {} inverted dates corrected",
                report.path.display(),
                report.changed_values,
                report.inverted_dates
            );
        } else {
            println!("{}: no changes needed", report.path.display());
        }
    }
    Ok(())
}
