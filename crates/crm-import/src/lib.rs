//! Import of the client workbook (one sheet per client) into the CRM's flat
//! client and contract tables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crm_core::{Client, ImportedContract};
use crm_storage::{write_atomic, CsvStore, StoredFile};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub mod link;
pub mod sheet;
pub mod source;

pub use link::{link_import, run_link, LinkReport};
pub use sheet::{client_from_sheet, extract_contracts, CellPos, IdentityLayout, SheetGrid};
pub use source::{CalamineWorkbook, InMemoryWorkbook, WorkbookSource};

pub const CRATE_NAME: &str = "crm-import";

pub const DEFAULT_WORKBOOK: &str = "GESTIONE_CLIENTI.xlsm";
pub const DEFAULT_STORAGE_DIR: &str = "storage";
pub const DEFAULT_SETTINGS_FILE: &str = "import.yaml";
pub const REPORT_FILE: &str = "import_report.json";

/// Index, summary, lookup, counter and log sheets that describe no client.
pub const DEFAULT_EXCLUDED_SHEETS: [&str; 6] =
    ["INDICE", "RIEPILOGO", "ELENCO", "TABELLE", "CONTATORE", "LOG"];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("opening workbook {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("reading sheet `{sheet}`: {reason}")]
    Sheet { sheet: String, reason: String },
    #[error("reading settings {path}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing settings {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub workbook: PathBuf,
    pub storage_dir: PathBuf,
    pub settings_path: PathBuf,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            workbook: std::env::var("CRM_WORKBOOK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKBOOK)),
            storage_dir: std::env::var("CRM_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_DIR)),
            settings_path: std::env::var("CRM_IMPORT_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_FILE)),
        }
    }
}

/// Optional `import.yaml` tuning the importer to a workbook.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub excluded_sheets: Vec<String>,
    pub identity_layout: IdentityLayout,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            excluded_sheets: DEFAULT_EXCLUDED_SHEETS.iter().map(|s| s.to_string()).collect(),
            identity_layout: IdentityLayout::STANDARD,
        }
    }
}

impl ImportSettings {
    /// Missing file means built-in defaults.
    pub fn load(path: &Path) -> Result<Self, ImportError> {
        if !path.exists() {
            debug!(path = %path.display(), "no import settings file; using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ImportError::SettingsIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ImportError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_excluded(&self, sheet_name: &str) -> bool {
        let name = sheet_name.trim();
        self.excluded_sheets.iter().any(|excluded| excluded.trim() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetFailure {
    pub sheet: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutput {
    pub clients: Vec<Client>,
    pub contracts: Vec<ImportedContract>,
    pub sheets_seen: usize,
    pub excluded: Vec<String>,
    pub failed: Vec<SheetFailure>,
}

/// Walk every sheet in workbook order. Excluded sheets are skipped, sheets
/// that fail to read are recorded and skipped; neither stops the run.
pub fn import_workbook<S: WorkbookSource + ?Sized>(
    source: &mut S,
    settings: &ImportSettings,
) -> ImportOutput {
    let names = source.sheet_names();
    let mut out = ImportOutput {
        sheets_seen: names.len(),
        ..ImportOutput::default()
    };

    for name in names {
        if settings.is_excluded(&name) {
            debug!(sheet = %name, "excluded sheet");
            out.excluded.push(name);
            continue;
        }

        let span = info_span!("sheet", sheet = %name);
        let _guard = span.enter();

        let grid = match source.read_sheet(&name) {
            Ok(grid) => grid,
            Err(err) => {
                warn!(error = %err, "skipping unreadable sheet");
                out.failed.push(SheetFailure {
                    reason: err.to_string(),
                    sheet: name,
                });
                continue;
            }
        };

        let client = client_from_sheet(&name, &grid, &settings.identity_layout);
        let contracts = extract_contracts(&grid, &client.company_name);
        debug!(client = %client.company_name, contracts = contracts.len(), "sheet imported");
        out.contracts.extend(contracts);
        out.clients.push(client);
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFile {
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

impl From<&StoredFile> for ReportFile {
    fn from(file: &StoredFile) -> Self {
        Self {
            path: file.path.display().to_string(),
            sha256: file.content_hash.clone(),
            bytes: file.byte_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workbook: String,
    pub sheets_seen: usize,
    pub sheets_imported: usize,
    pub excluded_sheets: Vec<String>,
    pub failed_sheets: Vec<SheetFailure>,
    pub clients: usize,
    pub contracts: usize,
    pub clients_file: ReportFile,
    pub contracts_file: ReportFile,
    pub report_path: String,
}

/// Persist an import: both tables plus `import_report.json`.
pub fn write_import(
    store: &CsvStore,
    workbook: &Path,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    output: &ImportOutput,
) -> Result<ImportRunSummary> {
    let (clients_file, contracts_file) = store
        .save_imported(&output.clients, &output.contracts)
        .with_context(|| format!("writing import tables to {}", store.root().display()))?;

    let report_path = store.path(REPORT_FILE);
    let summary = ImportRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        workbook: workbook.display().to_string(),
        sheets_seen: output.sheets_seen,
        sheets_imported: output.clients.len(),
        excluded_sheets: output.excluded.clone(),
        failed_sheets: output.failed.clone(),
        clients: output.clients.len(),
        contracts: output.contracts.len(),
        clients_file: ReportFile::from(&clients_file),
        contracts_file: ReportFile::from(&contracts_file),
        report_path: report_path.display().to_string(),
    };

    let bytes = serde_json::to_vec_pretty(&summary).context("serializing import report")?;
    write_atomic(&report_path, &bytes)
        .with_context(|| format!("writing {}", report_path.display()))?;
    Ok(summary)
}

/// Open the workbook (fatal if it cannot be opened), import every client
/// sheet and write the results under `config.storage_dir`.
pub fn run_import(config: &ImportConfig, settings: &ImportSettings) -> Result<ImportRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let mut workbook = CalamineWorkbook::open(&config.workbook)?;
    info!(
        %run_id,
        workbook = %workbook.path().display(),
        sheets = workbook.sheet_names().len(),
        "workbook opened"
    );

    let output = import_workbook(&mut workbook, settings);
    let store = CsvStore::new(&config.storage_dir);
    write_import(&store, &config.workbook, run_id, started_at, &output)
}
