//! Core record model for the CRM tables (clients, contracts) and workbook cells.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub mod dates;

pub use dates::{excel_to_date, fmt_date, normalize_stored_date, NormalizedDate};

pub const CRATE_NAME: &str = "crm-core";

/// Client column order expected by the CRUD application.
pub const CLIENT_COLUMNS: [&str; 16] = [
    "ClienteID",
    "RagioneSociale",
    "NomeCliente",
    "Indirizzo",
    "Città",
    "CAP",
    "Telefono",
    "Email",
    "PartitaIVA",
    "IBAN",
    "SDI",
    "UltimoRecall",
    "ProssimoRecall",
    "UltimaVisita",
    "ProssimaVisita",
    "Note",
];

/// Contract column order expected by the CRUD application.
pub const CONTRACT_COLUMNS: [&str; 14] = [
    "ClienteID",
    "NumeroContratto",
    "DataInizio",
    "DataFine",
    "Durata",
    "DescrizioneProdotto",
    "NOL_FIN",
    "NOL_INT",
    "TotRata",
    "CopieBN",
    "EccBN",
    "CopieCol",
    "EccCol",
    "Stato",
];

/// Importer intermediate form: the owning client is referenced by name.
pub const IMPORTED_CONTRACT_COLUMNS: [&str; 14] = [
    "Cliente",
    "NumeroContratto",
    "DataInizio",
    "DataFine",
    "Durata",
    "DescrizioneProdotto",
    "NOL_FIN",
    "NOL_INT",
    "TotRata",
    "CopieBN",
    "EccBN",
    "CopieCol",
    "EccCol",
    "Stato",
];

pub const CLIENT_DATE_COLUMNS: [&str; 4] =
    ["UltimoRecall", "ProssimoRecall", "UltimaVisita", "ProssimaVisita"];

pub const CONTRACT_DATE_COLUMNS: [&str; 2] = ["DataInizio", "DataFine"];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    #[serde(rename = "ClienteID")]
    pub client_id: String,
    #[serde(rename = "RagioneSociale")]
    pub company_name: String,
    #[serde(rename = "NomeCliente")]
    pub contact_name: String,
    #[serde(rename = "Indirizzo")]
    pub address: String,
    #[serde(rename = "Città")]
    pub city: String,
    #[serde(rename = "CAP")]
    pub postal_code: String,
    #[serde(rename = "Telefono")]
    pub phone: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "PartitaIVA")]
    pub vat_number: String,
    #[serde(rename = "IBAN")]
    pub iban: String,
    #[serde(rename = "SDI")]
    pub sdi_code: String,
    #[serde(rename = "UltimoRecall")]
    pub last_recall: String,
    #[serde(rename = "ProssimoRecall")]
    pub next_recall: String,
    #[serde(rename = "UltimaVisita")]
    pub last_visit: String,
    #[serde(rename = "ProssimaVisita")]
    pub next_visit: String,
    #[serde(rename = "Note")]
    pub notes: String,
}

impl Client {
    /// Client carrying only a display name, every other field blank.
    pub fn named(company_name: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            ..Self::default()
        }
    }
}

/// Contract row as persisted by the CRUD application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Contract {
    #[serde(rename = "ClienteID")]
    pub client_id: String,
    #[serde(rename = "NumeroContratto")]
    pub contract_number: String,
    #[serde(rename = "DataInizio")]
    pub start_date: String,
    #[serde(rename = "DataFine")]
    pub end_date: String,
    #[serde(rename = "Durata")]
    pub duration: String,
    #[serde(rename = "DescrizioneProdotto")]
    pub product_description: String,
    #[serde(rename = "NOL_FIN")]
    pub financial_rent: String,
    #[serde(rename = "NOL_INT")]
    pub internal_rent: String,
    #[serde(rename = "TotRata")]
    pub total_installment: String,
    #[serde(rename = "CopieBN")]
    pub copies_bw: String,
    #[serde(rename = "EccBN")]
    pub excess_bw: String,
    #[serde(rename = "CopieCol")]
    pub copies_color: String,
    #[serde(rename = "EccCol")]
    pub excess_color: String,
    #[serde(rename = "Stato")]
    pub status: String,
}

/// Contract row produced by the workbook import, before client IDs exist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportedContract {
    #[serde(rename = "Cliente")]
    pub client_name: String,
    #[serde(rename = "NumeroContratto")]
    pub contract_number: String,
    #[serde(rename = "DataInizio")]
    pub start_date: String,
    #[serde(rename = "DataFine")]
    pub end_date: String,
    #[serde(rename = "Durata")]
    pub duration: String,
    #[serde(rename = "DescrizioneProdotto")]
    pub product_description: String,
    #[serde(rename = "NOL_FIN")]
    pub financial_rent: String,
    #[serde(rename = "NOL_INT")]
    pub internal_rent: String,
    #[serde(rename = "TotRata")]
    pub total_installment: String,
    #[serde(rename = "CopieBN")]
    pub copies_bw: String,
    #[serde(rename = "EccBN")]
    pub excess_bw: String,
    #[serde(rename = "CopieCol")]
    pub copies_color: String,
    #[serde(rename = "EccCol")]
    pub excess_color: String,
    #[serde(rename = "Stato")]
    pub status: String,
}

impl ImportedContract {
    pub fn into_contract(self, client_id: impl Into<String>) -> Contract {
        Contract {
            client_id: client_id.into(),
            contract_number: self.contract_number,
            start_date: self.start_date,
            end_date: self.end_date,
            duration: self.duration,
            product_description: self.product_description,
            financial_rent: self.financial_rent,
            internal_rent: self.internal_rent,
            total_installment: self.total_installment,
            copies_bw: self.copies_bw,
            excess_bw: self.excess_bw,
            copies_color: self.copies_color,
            excess_color: self.excess_color,
            status: self.status,
        }
    }
}

/// Contract lifecycle as encoded by workbook authors.
///
/// The workbook has no formal status enum: an "x" in the status cell marks a
/// closed contract and `VENDITA` written in the start-date cell marks an
/// outright sale. Any other status text is kept verbatim (lower-cased) as
/// `Open`, including values that are probably typos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractStatus {
    Open(String),
    Closed,
    Sale,
}

impl ContractStatus {
    pub const SALE_MARKER: &'static str = "VENDITA";
    pub const CLOSED_LITERAL: &'static str = "chiuso";
    pub const SALE_LITERAL: &'static str = "vendita";

    pub fn from_cells(start_date_text: &str, status_text: &str) -> Self {
        if is_sale_marker(start_date_text) {
            return Self::Sale;
        }
        let lowered = status_text.to_lowercase();
        if lowered.contains('x') {
            Self::Closed
        } else {
            Self::Open(lowered)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open(text) => text,
            Self::Closed => Self::CLOSED_LITERAL,
            Self::Sale => Self::SALE_LITERAL,
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when a start-date cell carries the sale marker, in any case.
pub fn is_sale_marker(text: &str) -> bool {
    text.to_uppercase().contains(ContractStatus::SALE_MARKER)
}

/// One workbook cell, untyped enough to survive ragged hand-edited sheets.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Error(String),
}

impl Cell {
    pub fn text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => render_number(*n),
            Cell::Bool(true) => "TRUE".to_string(),
            Cell::Bool(false) => "FALSE".to_string(),
            Cell::DateTime(dt) => dt.format(dates::DATE_FORMAT).to_string(),
            Cell::Error(token) => token.clone(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Cell::Error(_))
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(value.to_string())
        }
    }
}

/// Integral values render without a decimal point (`12345`, not `12345.0`).
pub fn render_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
