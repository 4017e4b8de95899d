//! Per-sheet extraction: one client identity, its labelled extras and notes,
//! plus the contract table found below the "Contratti di Noleggio" marker row.

use std::fmt;

use crm_core::{
    excel_to_date, fmt_date, is_sale_marker, Cell, Client, ContractStatus, ImportedContract,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

static EMPTY_CELL: Cell = Cell::Empty;

/// Rectangular cell grid in absolute worksheet coordinates (row 0 is row 1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetGrid {
    rows: Vec<Vec<Cell>>,
    width: usize,
}

impl SheetGrid {
    /// Pads ragged rows with empty cells.
    pub fn from_rows(mut rows: Vec<Vec<Cell>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for row in &mut rows {
            row.resize(width, Cell::Empty);
        }
        Self { rows, width }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Out-of-range positions read as empty.
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn at(&self, pos: CellPos) -> &Cell {
        self.cell(pos.row, pos.col)
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }
}

/// Zero-based cell coordinate, written in A1 notation in settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct CellPos {
    pub row: usize,
    pub col: usize,
}

impl CellPos {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn from_a1(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let split = reference.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = reference.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let row: usize = digits.parse().ok()?;
        let col = letters
            .chars()
            .try_fold(0usize, |acc, c| {
                let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
                acc.checked_mul(26)?.checked_add(digit)
            })?;
        Some(Self::new(row.checked_sub(1)?, col - 1))
    }
}

impl TryFrom<String> for CellPos {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_a1(&value).ok_or_else(|| format!("invalid cell reference `{value}`"))
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut n = self.col + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        letters.reverse();
        write!(f, "{}{}", letters.into_iter().collect::<String>(), self.row + 1)
    }
}

/// Where the client template keeps identity values.
///
/// Client sheets open with a title row and then a label column (A) next to a
/// value column (B): name, phone, city, postal code, VAT number and email on
/// rows 2 to 7. Every client sheet is cloned from the same template, so the
/// positions are fixed; settings may override them for a different template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentityLayout {
    pub name: CellPos,
    pub phone: CellPos,
    pub city: CellPos,
    pub postal_code: CellPos,
    pub vat_number: CellPos,
    pub email: CellPos,
}

impl IdentityLayout {
    pub const STANDARD: Self = Self {
        name: CellPos::new(1, 1),
        phone: CellPos::new(2, 1),
        city: CellPos::new(3, 1),
        postal_code: CellPos::new(4, 1),
        vat_number: CellPos::new(5, 1),
        email: CellPos::new(6, 1),
    };

    fn positions(&self) -> [(&'static str, CellPos); 6] {
        [
            ("name", self.name),
            ("phone", self.phone),
            ("city", self.city),
            ("postal_code", self.postal_code),
            ("vat_number", self.vat_number),
            ("email", self.email),
        ]
    }
}

impl Default for IdentityLayout {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("identity cell {field} at {position} holds workbook error {token}")]
pub struct IdentityError {
    pub field: &'static str,
    pub position: CellPos,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub phone: String,
    pub city: String,
    pub postal_code: String,
    pub vat_number: String,
    pub email: String,
}

/// Read the six identity cells; a workbook error value in any of them fails
/// the read as a whole.
pub fn read_identity(
    grid: &SheetGrid,
    layout: &IdentityLayout,
) -> Result<ClientIdentity, IdentityError> {
    for (field, position) in layout.positions() {
        let cell = grid.at(position);
        if cell.is_error() {
            return Err(IdentityError {
                field,
                position,
                token: cell.text(),
            });
        }
    }
    let text = |pos: CellPos| grid.at(pos).text().trim().to_string();
    Ok(ClientIdentity {
        name: text(layout.name),
        phone: text(layout.phone),
        city: text(layout.city),
        postal_code: postal_code_text(grid.at(layout.postal_code)),
        vat_number: text(layout.vat_number),
        email: text(layout.email),
    })
}

/// Numeric postal codes lose their leading zeros in the workbook.
fn postal_code_text(cell: &Cell) -> String {
    match cell {
        Cell::Number(n) if n.fract() == 0.0 && (0.0..100_000.0).contains(n) => {
            format!("{:05}", *n as u32)
        }
        other => other.text().trim().to_string(),
    }
}

/// Client record for one sheet. Falls back to the sheet name when the
/// identity read fails or the name cell is blank.
pub fn client_from_sheet(sheet_name: &str, grid: &SheetGrid, layout: &IdentityLayout) -> Client {
    let identity = match read_identity(grid, layout) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(sheet = sheet_name, error = %err, "identity unreadable; using sheet name");
            return Client::named(sheet_name.trim());
        }
    };
    let company_name = if identity.name.is_empty() {
        sheet_name.trim().to_string()
    } else {
        identity.name
    };
    let extras = read_labelled_fields(grid);
    Client {
        company_name,
        address: extras.address,
        city: identity.city,
        postal_code: identity.postal_code,
        phone: identity.phone,
        email: identity.email,
        vat_number: identity.vat_number,
        sdi_code: extras.sdi_code,
        last_recall: extras.last_recall,
        last_visit: extras.last_visit,
        notes: read_notes(grid),
        ..Client::default()
    }
}

/// Template label column (A) and its value column (B).
const LABEL_COLUMN: usize = 0;
const VALUE_COLUMN: usize = 1;

/// Client fields the template carries next to a label rather than at a
/// fixed cell. Rows were added to the template over time, so their
/// positions vary between sheets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelledFields {
    pub address: String,
    pub sdi_code: String,
    pub last_recall: String,
    pub last_visit: String,
}

/// Scan the rows above the notes and contract blocks for labelled fields.
/// The first non-blank value under each label wins; recall and visit
/// values are formatted as dates.
pub fn read_labelled_fields(grid: &SheetGrid) -> LabelledFields {
    let mut fields = LabelledFields::default();
    let end = [find_contract_header(grid), find_notes_header(grid)]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(grid.height());

    for row in 0..end {
        let label = grid.cell(row, LABEL_COLUMN).text().to_lowercase();
        let value = grid.cell(row, VALUE_COLUMN);
        if value.is_blank() || value.is_error() {
            continue;
        }
        let (slot, is_date) = if label.contains("ultimo recall") {
            (&mut fields.last_recall, true)
        } else if label.contains("ultima visita") {
            (&mut fields.last_visit, true)
        } else if label.contains("indirizzo") && !label.contains("mail") {
            (&mut fields.address, false)
        } else if label.contains("sdi") {
            (&mut fields.sdi_code, false)
        } else {
            continue;
        };
        if slot.is_empty() {
            *slot = if is_date {
                fmt_date(excel_to_date(value))
            } else {
                value.text().trim().to_string()
            };
        }
    }
    fields
}

/// Lower-cased text of the row introducing the contract table.
pub const CONTRACTS_MARKER: &str = "contratti di noleggio";

/// Rows between the marker row and the first data row (marker + sub-header).
const HEADER_ROWS: usize = 2;

pub const CONTRACT_COLUMN_COUNT: usize = 13;

/// Column meaning inside the contract table, left to right from column A.
pub mod column {
    pub const START_DATE: usize = 0;
    pub const END_DATE: usize = 1;
    pub const DURATION: usize = 2;
    pub const DESCRIPTION: usize = 3;
    pub const NOL_FIN: usize = 4;
    pub const CONTRACT_NUMBER: usize = 5;
    pub const NOL_INT: usize = 6;
    pub const TOT_RATA: usize = 7;
    pub const COPIES_BW: usize = 8;
    pub const EXCESS_BW: usize = 9;
    pub const COPIES_COLOR: usize = 10;
    pub const EXCESS_COLOR: usize = 11;
    pub const STATUS: usize = 12;
}

/// Lower-cased text of the row opening the free-text client notes.
pub const NOTES_MARKER: &str = "note clienti";

fn find_marker_row(grid: &SheetGrid, marker: &str) -> Option<usize> {
    grid.rows().iter().position(|row| {
        row.iter()
            .any(|cell| cell.text().to_lowercase().contains(marker))
    })
}

/// First row with a cell mentioning the contract marker, case-insensitively.
pub fn find_contract_header(grid: &SheetGrid) -> Option<usize> {
    find_marker_row(grid, CONTRACTS_MARKER)
}

pub fn find_notes_header(grid: &SheetGrid) -> Option<usize> {
    find_marker_row(grid, NOTES_MARKER)
}

/// Every non-blank row below the notes marker, cells and rows joined by a
/// space. A contract block further down ends the notes.
pub fn read_notes(grid: &SheetGrid) -> String {
    let Some(start) = find_notes_header(grid) else {
        return String::new();
    };
    let end = find_contract_header(grid)
        .filter(|&row| row > start)
        .unwrap_or(grid.height());

    grid.rows()[start + 1..end]
        .iter()
        .map(|row| {
            row.iter()
                .filter(|cell| !cell.is_blank())
                .map(|cell| cell.text().trim().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A row is kept when it has a contract number, a description or the sale
/// marker in its start-date cell; everything else is filler.
fn contract_from_row(grid: &SheetGrid, row: usize, client_name: &str) -> Option<ImportedContract> {
    let text = |col: usize| grid.cell(row, col).text();
    let start_text = text(column::START_DATE);
    let contract_number = text(column::CONTRACT_NUMBER).trim().to_string();
    let product_description = text(column::DESCRIPTION).trim().to_string();

    if contract_number.is_empty()
        && product_description.is_empty()
        && !is_sale_marker(&start_text)
    {
        return None;
    }

    let status = ContractStatus::from_cells(&start_text, &text(column::STATUS));
    Some(ImportedContract {
        client_name: client_name.to_string(),
        contract_number,
        start_date: fmt_date(excel_to_date(grid.cell(row, column::START_DATE))),
        end_date: fmt_date(excel_to_date(grid.cell(row, column::END_DATE))),
        duration: text(column::DURATION).trim().to_string(),
        product_description,
        financial_rent: text(column::NOL_FIN),
        internal_rent: text(column::NOL_INT),
        total_installment: text(column::TOT_RATA),
        copies_bw: text(column::COPIES_BW),
        excess_bw: text(column::EXCESS_BW),
        copies_color: text(column::COPIES_COLOR),
        excess_color: text(column::EXCESS_COLOR),
        status: status.to_string(),
    })
}

/// Valid contract rows of a sheet, top to bottom. No marker row, no contracts.
pub fn extract_contracts(grid: &SheetGrid, client_name: &str) -> Vec<ImportedContract> {
    let Some(header) = find_contract_header(grid) else {
        debug!(client = client_name, "no contract block in sheet");
        return Vec::new();
    };
    (header + HEADER_ROWS..grid.height())
        .filter_map(|row| contract_from_row(grid, row, client_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_row(values: &[&str]) -> Vec<Cell> {
        values.iter().map(|v| Cell::from(*v)).collect()
    }

    fn identity_rows() -> Vec<Vec<Cell>> {
        vec![
            text_row(&["SCHEDA CLIENTE"]),
            text_row(&["Nome Cliente", "  Ottica Bianchi  "]),
            text_row(&["Telefono", "06 1234567"]),
            text_row(&["Città", "Roma"]),
            vec![Cell::from("CAP"), Cell::Number(184.0)],
            text_row(&["P.IVA", "01234567890"]),
            text_row(&["Email", "info@bianchi.it"]),
        ]
    }

    #[test]
    fn a1_references_round_trip() {
        assert_eq!(CellPos::from_a1("B2"), Some(CellPos::new(1, 1)));
        assert_eq!(CellPos::from_a1("aa10"), Some(CellPos::new(9, 26)));
        assert_eq!(CellPos::from_a1("A0"), None);
        assert_eq!(CellPos::from_a1("12"), None);
        assert_eq!(CellPos::new(9, 27).to_string(), "AB10");
    }

    #[test]
    fn identity_is_read_from_template_positions() {
        let grid = SheetGrid::from_rows(identity_rows());
        let client = client_from_sheet("BIANCHI", &grid, &IdentityLayout::STANDARD);
        assert_eq!(client.company_name, "Ottica Bianchi");
        assert_eq!(client.phone, "06 1234567");
        assert_eq!(client.city, "Roma");
        assert_eq!(client.postal_code, "00184");
        assert_eq!(client.vat_number, "01234567890");
        assert_eq!(client.email, "info@bianchi.it");
        assert_eq!(client.client_id, "");
    }

    #[test]
    fn short_sheet_yields_blank_identity_fields() {
        let grid = SheetGrid::from_rows(identity_rows().into_iter().take(3).collect());
        let identity = read_identity(&grid, &IdentityLayout::STANDARD).expect("read");
        assert_eq!(identity.name, "Ottica Bianchi");
        assert_eq!(identity.city, "");
        assert_eq!(identity.email, "");
    }

    #[test]
    fn identity_error_falls_back_to_sheet_name() {
        let mut rows = identity_rows();
        rows[2][1] = Cell::Error("#REF!".into());
        let grid = SheetGrid::from_rows(rows);
        let client = client_from_sheet(" ROSSI SRL ", &grid, &IdentityLayout::STANDARD);
        assert_eq!(client, Client::named("ROSSI SRL"));
    }

    #[test]
    fn blank_name_cell_uses_sheet_name() {
        let grid = SheetGrid::default();
        let client = client_from_sheet("VERDI", &grid, &IdentityLayout::STANDARD);
        assert_eq!(client.company_name, "VERDI");
    }

    fn contract_sheet(rows: Vec<Vec<Cell>>) -> SheetGrid {
        let mut all = vec![
            text_row(&["anagrafica"]),
            text_row(&["", "ELENCO CONTRATTI DI NOLEGGIO ATTIVI"]),
            text_row(&["Inizio", "Fine", "Durata", "Prodotto"]),
        ];
        all.extend(rows);
        SheetGrid::from_rows(all)
    }

    #[test]
    fn marker_search_is_case_insensitive() {
        let grid = contract_sheet(vec![]);
        assert_eq!(find_contract_header(&grid), Some(1));
        assert_eq!(find_contract_header(&SheetGrid::from_rows(identity_rows())), None);
    }

    #[test]
    fn contract_rows_start_two_rows_below_the_marker() {
        let mut row = vec![Cell::Empty; CONTRACT_COLUMN_COUNT];
        row[column::START_DATE] = Cell::Number(45366.0);
        row[column::END_DATE] = Cell::from("14/03/2029");
        row[column::DURATION] = Cell::from("60 mesi");
        row[column::DESCRIPTION] = Cell::from("Multifunzione A3 colore");
        row[column::NOL_FIN] = Cell::Number(89.9);
        row[column::CONTRACT_NUMBER] = Cell::Number(20457.0);
        row[column::STATUS] = Cell::from("Aperto");
        let grid = contract_sheet(vec![row]);

        let contracts = extract_contracts(&grid, "Ottica Bianchi");
        assert_eq!(contracts.len(), 1);
        let c = &contracts[0];
        assert_eq!(c.client_name, "Ottica Bianchi");
        assert_eq!(c.contract_number, "20457");
        assert_eq!(c.start_date, "15/03/2024");
        assert_eq!(c.end_date, "14/03/2029");
        assert_eq!(c.duration, "60 mesi");
        assert_eq!(c.financial_rent, "89.9");
        assert_eq!(c.status, "aperto");
    }

    #[test]
    fn row_with_only_a_date_is_dropped() {
        let grid = contract_sheet(vec![text_row(&["15/03/2024", "", "", "  "])]);
        assert!(extract_contracts(&grid, "x").is_empty());
    }

    #[test]
    fn sale_rows_are_kept_with_sale_status() {
        let mut row = text_row(&["Vendita"]);
        row.resize(CONTRACT_COLUMN_COUNT, Cell::Empty);
        row[column::STATUS] = Cell::from("aperto");
        let grid = contract_sheet(vec![row]);

        let contracts = extract_contracts(&grid, "x");
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].status, "vendita");
        assert_eq!(contracts[0].start_date, "");
    }

    #[test]
    fn x_in_status_closes_the_contract() {
        let mut row = text_row(&["01/02/2020", "", "", "Stampante"]);
        row.resize(CONTRACT_COLUMN_COUNT, Cell::Empty);
        row[column::STATUS] = Cell::from("X");
        let grid = contract_sheet(vec![row]);

        assert_eq!(extract_contracts(&grid, "x")[0].status, "chiuso");
    }

    #[test]
    fn labelled_fields_and_notes_are_collected() {
        let mut rows = identity_rows();
        rows.push(text_row(&["Indirizzo", "Via Appia Nuova 12"]));
        rows.push(text_row(&["Codice SDI", "M5UXCR1"]));
        rows.push(vec![Cell::from("Ultimo recall"), Cell::Number(45366.0)]);
        rows.push(text_row(&["Ultima visita", "02/01/2024"]));
        rows.push(vec![]);
        rows.push(text_row(&["NOTE CLIENTI"]));
        rows.push(text_row(&["Cliente storico dal 2009"]));
        rows.push(text_row(&["", "chiamare", "solo al mattino"]));
        rows.push(vec![]);
        rows.push(text_row(&["Indirizzo", "ignored: inside the notes"]));
        rows.push(text_row(&["Contratti di Noleggio"]));
        rows.push(text_row(&["Inizio", "Fine"]));
        let mut contract = text_row(&["01/02/2024", "", "", "Plotter A0"]);
        contract.resize(CONTRACT_COLUMN_COUNT, Cell::Empty);
        rows.push(contract);
        let grid = SheetGrid::from_rows(rows);

        let client = client_from_sheet("BIANCHI", &grid, &IdentityLayout::STANDARD);

        assert_eq!(client.address, "Via Appia Nuova 12");
        assert_eq!(client.sdi_code, "M5UXCR1");
        assert_eq!(client.last_recall, "15/03/2024");
        assert_eq!(client.last_visit, "02/01/2024");
        assert_eq!(
            client.notes,
            "Cliente storico dal 2009 chiamare solo al mattino Indirizzo ignored: inside the notes"
        );
        assert_eq!(extract_contracts(&grid, &client.company_name).len(), 1);
    }

    #[test]
    fn notes_run_to_the_end_without_a_following_contract_block() {
        let grid = SheetGrid::from_rows(vec![
            text_row(&["Contratti di Noleggio"]),
            text_row(&["Inizio"]),
            text_row(&["Note Clienti:"]),
            text_row(&["  ", "paga a 60 giorni "]),
        ]);
        assert_eq!(read_notes(&grid), "paga a 60 giorni");
        assert_eq!(read_notes(&SheetGrid::from_rows(identity_rows())), "");
    }

    #[test]
    fn sheet_without_marker_has_no_contracts() {
        let grid = SheetGrid::from_rows(identity_rows());
        assert!(extract_contracts(&grid, "x").is_empty());
    }
}
