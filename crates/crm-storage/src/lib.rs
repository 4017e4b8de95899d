//! CSV table storage for the CRM: BOM-prefixed UTF-8 files in the consumer's
//! column order, written by atomic temp-file rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crm_core::{
    normalize_stored_date, Client, Contract, ImportedContract, CLIENT_COLUMNS,
    CLIENT_DATE_COLUMNS, CONTRACT_COLUMNS, CONTRACT_DATE_COLUMNS, IMPORTED_CONTRACT_COLUMNS,
};
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crm-storage";

pub const CLIENTS_FILE: &str = "clienti.csv";
pub const CONTRACTS_FILE: &str = "contratti_clienti.csv";
pub const IMPORTED_CLIENTS_FILE: &str = "clienti_import.csv";
pub const IMPORTED_CONTRACTS_FILE: &str = "contratti_import.csv";

const UTF8_BOM: &str = "\u{feff}";
const CLIENT_ID_COLUMN: &str = "ClienteID";

/// Cell spellings left behind by earlier tooling that mean "no value".
const NULL_TOKENS: [&str; 7] = ["nan", "NaN", "None", "NULL", "null", "NaT", "<NA>"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> StorageError + '_ {
    move |source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<StoredFile, StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_err(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(io_err(&temp_path))?;
    if let Err(source) = file.write_all(bytes).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::Io {
            path: temp_path,
            source,
        });
    }
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    debug!(path = %path.display(), bytes = bytes.len(), "wrote file atomically");
    Ok(StoredFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

/// Trim and drop leading zeros so `007` and `7 ` name the same client.
pub fn normalize_client_id(value: &str) -> String {
    value.trim().trim_start_matches('0').to_string()
}

fn clean_cell(value: &str) -> &str {
    if NULL_TOKENS.contains(&value.trim()) {
        ""
    } else {
        value
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

/// Header plus every well-formed record of a CSV file, null tokens cleared.
/// Malformed lines are logged and skipped.
fn read_raw(path: &Path) -> Result<(StringRecord, Vec<StringRecord>), StorageError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let decoded = String::from_utf8_lossy(&bytes);
    let text: &str = decoded.strip_prefix(UTF8_BOM).unwrap_or(&decoded);

    let mut reader = ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());
    let headers = reader.headers().map_err(csv_err(path))?.clone();

    let mut records = Vec::new();
    for (index, record) in reader.records().enumerate() {
        match record {
            Ok(record) => records.push(record.iter().map(clean_cell).collect()),
            Err(err) => warn!(
                path = %path.display(),
                line = index + 2,
                error = %err,
                "skipping malformed csv line"
            ),
        }
    }
    Ok((headers, records))
}

/// Load a table, tolerating missing columns (left blank) and extra columns
/// (ignored). A missing file is an empty table.
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !path.exists() {
        debug!(path = %path.display(), "table file missing; treating as empty");
        return Ok(Vec::new());
    }
    let (headers, records) = read_raw(path)?;
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        match record.deserialize::<T>(Some(&headers)) {
            Ok(row) => rows.push(row),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable row"),
        }
    }
    Ok(rows)
}

/// BOM, explicit header record, then whatever `write_rows` emits.
fn encode_with<H, F>(header: H, write_rows: F) -> Result<Vec<u8>, csv::Error>
where
    H: IntoIterator,
    H::Item: AsRef<[u8]>,
    F: FnOnce(&mut Writer<&mut Vec<u8>>) -> Result<(), csv::Error>,
{
    let mut out = UTF8_BOM.as_bytes().to_vec();
    {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(&mut out);
        writer.write_record(header)?;
        write_rows(&mut writer)?;
        writer.flush()?;
    }
    Ok(out)
}

/// Encode rows under an explicit header so empty tables still carry columns.
pub fn encode_table<T: Serialize>(columns: &[&str], rows: &[T]) -> Result<Vec<u8>, csv::Error> {
    encode_with(columns, |writer| {
        for row in rows {
            writer.serialize(row)?;
        }
        Ok(())
    })
}

pub fn write_table<T: Serialize>(
    path: &Path,
    columns: &[&str],
    rows: &[T],
) -> Result<StoredFile, StorageError> {
    let bytes = encode_table(columns, rows).map_err(csv_err(path))?;
    write_atomic(path, &bytes)
}

/// Per-file outcome of [`repair_stored_dates`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateRepairReport {
    pub path: PathBuf,
    pub rows: usize,
    pub changed_values: usize,
    pub inverted_dates: usize,
    pub rewritten: bool,
}

/// Re-normalize `date_columns` to `dd/mm/yyyy` and `ClienteID` to its
/// canonical form. The file is rewritten only when a value changed.
pub fn repair_stored_dates(
    path: &Path,
    date_columns: &[&str],
) -> Result<DateRepairReport, StorageError> {
    let (headers, records) = read_raw(path)?;
    let date_indexes: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| date_columns.contains(name))
        .map(|(index, _)| index)
        .collect();
    let id_index = headers.iter().position(|name| name == CLIENT_ID_COLUMN);

    let mut report = DateRepairReport {
        path: path.to_path_buf(),
        rows: records.len(),
        ..DateRepairReport::default()
    };

    let mut repaired = Vec::with_capacity(records.len());
    for record in &records {
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        for (index, value) in row.iter_mut().enumerate() {
            let replacement = if date_indexes.contains(&index) {
                let normalized = normalize_stored_date(value);
                if normalized.inverted {
                    report.inverted_dates += 1;
                }
                normalized.text
            } else if Some(index) == id_index {
                normalize_client_id(value)
            } else {
                continue;
            };
            if replacement != *value {
                report.changed_values += 1;
                *value = replacement;
            }
        }
        repaired.push(row);
    }

    if report.changed_values == 0 {
        info!(path = %path.display(), "no date changes needed");
        return Ok(report);
    }

    let out = encode_with(&headers, |writer| {
        for row in &repaired {
            writer.write_record(row)?;
        }
        Ok(())
    })
    .map_err(csv_err(path))?;
    write_atomic(path, &out)?;
    report.rewritten = true;
    info!(
        path = %path.display(),
        changed = report.changed_values,
        inverted = report.inverted_dates,
        "rewrote table with normalized dates"
    );
    Ok(report)
}

/// Directory holding the CRM's CSV tables.
#[derive(Debug, Clone)]
pub struct CsvStore {
    root: PathBuf,
}

impl CsvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn load_clients(&self) -> Result<Vec<Client>, StorageError> {
        let mut clients: Vec<Client> = read_table(&self.path(CLIENTS_FILE))?;
        for client in &mut clients {
            client.client_id = normalize_client_id(&client.client_id);
        }
        Ok(clients)
    }

    pub fn load_contracts(&self) -> Result<Vec<Contract>, StorageError> {
        let mut contracts: Vec<Contract> = read_table(&self.path(CONTRACTS_FILE))?;
        for contract in &mut contracts {
            contract.client_id = normalize_client_id(&contract.client_id);
        }
        Ok(contracts)
    }

    /// Save clients with recall/visit dates normalized to `dd/mm/yyyy`.
    pub fn save_clients(&self, clients: &[Client]) -> Result<StoredFile, StorageError> {
        let normalized: Vec<Client> = clients
            .iter()
            .cloned()
            .map(|mut client| {
                client.client_id = normalize_client_id(&client.client_id);
                for field in [
                    &mut client.last_recall,
                    &mut client.next_recall,
                    &mut client.last_visit,
                    &mut client.next_visit,
                ] {
                    *field = normalize_stored_date(field).text;
                }
                client
            })
            .collect();
        write_table(&self.path(CLIENTS_FILE), &CLIENT_COLUMNS, &normalized)
    }

    pub fn save_contracts(&self, contracts: &[Contract]) -> Result<StoredFile, StorageError> {
        let normalized: Vec<Contract> = contracts
            .iter()
            .cloned()
            .map(|mut contract| {
                contract.client_id = normalize_client_id(&contract.client_id);
                contract.start_date = normalize_stored_date(&contract.start_date).text;
                contract.end_date = normalize_stored_date(&contract.end_date).text;
                contract
            })
            .collect();
        write_table(&self.path(CONTRACTS_FILE), &CONTRACT_COLUMNS, &normalized)
    }

    pub fn load_imported(&self) -> Result<(Vec<Client>, Vec<ImportedContract>), StorageError> {
        let clients = read_table(&self.path(IMPORTED_CLIENTS_FILE))?;
        let contracts = read_table(&self.path(IMPORTED_CONTRACTS_FILE))?;
        Ok((clients, contracts))
    }

    /// Write the importer's two tables verbatim; dates are already formatted.
    pub fn save_imported(
        &self,
        clients: &[Client],
        contracts: &[ImportedContract],
    ) -> Result<(StoredFile, StoredFile), StorageError> {
        let clients_file = write_table(&self.path(IMPORTED_CLIENTS_FILE), &CLIENT_COLUMNS, clients)?;
        let contracts_file = write_table(
            &self.path(IMPORTED_CONTRACTS_FILE),
            &IMPORTED_CONTRACT_COLUMNS,
            contracts,
        )?;
        Ok((clients_file, contracts_file))
    }

    /// Run [`repair_stored_dates`] over both CRM tables that exist.
    pub fn repair_all_dates(&self) -> Result<Vec<DateRepairReport>, StorageError> {
        let mut reports = Vec::new();
        for (file_name, columns) in [
            (CLIENTS_FILE, &CLIENT_DATE_COLUMNS[..]),
            (CONTRACTS_FILE, &CONTRACT_DATE_COLUMNS[..]),
        ] {
            let path = self.path(file_name);
            if !path.exists() {
                info!(path = %path.display(), "table not found; skipping date repair");
                continue;
            }
            reports.push(repair_stored_dates(&path, columns)?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn atomic_write_replaces_file_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.txt");

        write_atomic(&path, b"first").expect("first write");
        let stored = write_atomic(&path, b"second").expect("second write");

        assert_eq!(fs::read(&path).expect("read back"), b"second");
        assert_eq!(stored.byte_size, 6);
        assert_eq!(stored.content_hash, sha256_hex(b"second"));
        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn empty_tables_still_carry_the_consumer_header() {
        let bytes = encode_table::<Client>(&CLIENT_COLUMNS, &[]).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with(UTF8_BOM));
        assert_eq!(
            text.trim_start_matches(UTF8_BOM).trim_end(),
            CLIENT_COLUMNS.join(",")
        );
    }

    #[test]
    fn loading_fills_missing_columns_and_clears_null_tokens() {
        let dir = tempdir().expect("tempdir");
        let store = CsvStore::new(dir.path());
        fs::write(
            store.path(CLIENTS_FILE),
            "\u{feff}ClienteID,RagioneSociale,CAP,Extra\n007,Rossi SRL,00184,zzz\n8,nan,NaN,\n",
        )
        .unwrap();

        let clients = store.load_clients().expect("load");
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].client_id, "7");
        assert_eq!(clients[0].company_name, "Rossi SRL");
        assert_eq!(clients[0].postal_code, "00184");
        assert_eq!(clients[0].email, "");
        assert_eq!(clients[1].company_name, "");
        assert_eq!(clients[1].postal_code, "");
    }

    #[test]
    fn semicolon_separated_files_are_detected() {
        let dir = tempdir().expect("tempdir");
        let store = CsvStore::new(dir.path());
        fs::write(
            store.path(CONTRACTS_FILE),
            "ClienteID;NumeroContratto;Stato\n3;C-9;aperto\n",
        )
        .unwrap();

        let contracts = store.load_contracts().expect("load");
        assert_eq!(contracts[0].client_id, "3");
        assert_eq!(contracts[0].contract_number, "C-9");
        assert_eq!(contracts[0].status, "aperto");
    }

    #[test]
    fn missing_table_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CsvStore::new(dir.path());
        assert!(store.load_contracts().expect("load").is_empty());
        assert!(store.repair_all_dates().expect("repair").is_empty());
    }

    #[test]
    fn saving_contracts_normalizes_dates() {
        let dir = tempdir().expect("tempdir");
        let store = CsvStore::new(dir.path());
        let contract = Contract {
            client_id: "04".into(),
            start_date: "2024-03-15".into(),
            end_date: "03/25/2027".into(),
            ..Contract::default()
        };
        store.save_contracts(&[contract]).expect("save");

        let loaded = store.load_contracts().expect("load");
        assert_eq!(loaded[0].client_id, "4");
        assert_eq!(loaded[0].start_date, "15/03/2024");
        assert_eq!(loaded[0].end_date, "25/03/2027");
    }

    #[test]
    fn date_repair_rewrites_only_when_needed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONTRACTS_FILE);
        fs::write(&path, "ClienteID,DataInizio,DataFine\n1,03/25/2024,15/03/2025\n").unwrap();

        let first = repair_stored_dates(&path, &CONTRACT_DATE_COLUMNS).expect("repair");
        assert!(first.rewritten);
        assert_eq!(first.inverted_dates, 1);
        assert_eq!(first.changed_values, 1);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("1,25/03/2024,15/03/2025"));

        let second = repair_stored_dates(&path, &CONTRACT_DATE_COLUMNS).expect("repair");
        assert!(!second.rewritten);
        assert_eq!(second.changed_values, 0);
    }
}
