//! Date conversion between workbook serials, free-text dates and the CRM's
//! `dd/mm/yyyy` text form.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

use crate::Cell;

pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// Serial day 0. Spreadsheet serials count from 1899-12-30 so that the
/// phantom 1900-02-29 of the legacy date system cancels out for every date
/// after February 1900.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Serial of 9999-12-31, the last date spreadsheets can represent.
const MAX_SERIAL: f64 = 2_958_465.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Which numeric group of an ambiguous `a/b/yyyy` date holds the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
    DayFirst,
    MonthFirst,
}

/// Convert a workbook cell into a timestamp.
///
/// Numbers are serial day offsets from the 1899-12-30 epoch, text is parsed
/// day-first, date cells pass through. Anything else, including blank or
/// unparseable text, yields `None`.
pub fn excel_to_date(cell: &Cell) -> Option<NaiveDateTime> {
    match cell {
        Cell::Number(serial) => serial_to_datetime(*serial),
        Cell::DateTime(dt) => Some(*dt),
        Cell::Text(text) => parse_date_text(text),
        Cell::Empty | Cell::Bool(_) | Cell::Error(_) => None,
    }
}

/// Render as zero-padded `dd/mm/yyyy`; `None` renders blank.
pub fn fmt_date(value: Option<NaiveDateTime>) -> String {
    value
        .map(|dt| dt.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial.abs() > MAX_SERIAL {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?.and_time(NaiveTime::MIN);
    let offset = TimeDelta::try_milliseconds((serial * MILLIS_PER_DAY).round() as i64)?;
    epoch.checked_add_signed(offset)
}

/// Day-first parse that falls back to month-first when the day-first reading
/// is not a valid calendar date (`03/25/2024` is 25 March).
pub fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    parse_with_order(text, FieldOrder::DayFirst)
        .or_else(|| parse_with_order(text, FieldOrder::MonthFirst))
}

/// Date layouts whose reading does not depend on field order.
const YEAR_FIRST_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

const MONTH_NAME_FORMATS: [&str; 8] = [
    "%d %B %y",
    "%d %B %Y",
    "%d-%B-%y",
    "%d-%B-%Y",
    "%B %d, %y",
    "%B %d, %Y",
    "%B %d %y",
    "%B %d %Y",
];

/// Two-digit years come before four-digit ones: `%Y` also accepts `24`.
const DAY_FIRST_FORMATS: [&str; 6] = [
    "%d/%m/%y", "%d/%m/%Y", "%d-%m-%y", "%d-%m-%Y", "%d.%m.%y", "%d.%m.%Y",
];

const MONTH_FIRST_FORMATS: [&str; 6] = [
    "%m/%d/%y", "%m/%d/%Y", "%m-%d-%y", "%m-%d-%Y", "%m.%d.%y", "%m.%d.%Y",
];

/// Timestamps carrying an offset keep their written wall-clock time.
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

const TIME_FORMATS: [&str; 2] = ["%H:%M:%S%.f", "%H:%M"];

/// Parse a free-text date with an optional time of day. Numeric `a/b/y`
/// dates are read in `order`; year-first, month-name and offset timestamps
/// read the same either way. Text after a complete date that is not a time
/// (a trailing note) is ignored.
pub fn parse_with_order(text: &str, order: FieldOrder) -> Option<NaiveDateTime> {
    let text = tidy_separators(text);
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Some(dt.naive_local());
    }
    if let Some(dt) = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(&text, fmt).ok())
    {
        return Some(dt.naive_local());
    }

    let leading_digits = text.bytes().take_while(u8::is_ascii_digit).count();
    let year_first = match leading_digits {
        4 => YEAR_FIRST_FORMATS
            .iter()
            .find_map(|fmt| date_with_remainder(&text, fmt)),
        8 => date_with_remainder(&text, "%Y%m%d"),
        _ => None,
    };
    if year_first.is_some() {
        return year_first;
    }

    let numeric: &[&str] = match order {
        FieldOrder::DayFirst => &DAY_FIRST_FORMATS,
        FieldOrder::MonthFirst => &MONTH_FIRST_FORMATS,
    };
    numeric
        .iter()
        .chain(MONTH_NAME_FORMATS.iter())
        .find_map(|fmt| date_with_remainder(&text, fmt))
}

/// Trim and drop whitespace around `/`, `-` and `.` (`15 / 03 / 2024`).
fn tidy_separators(text: &str) -> String {
    let chars: Vec<char> = text.trim().chars().collect();
    let is_separator = |c: &char| matches!(c, '/' | '-' | '.');
    let mut out = String::with_capacity(chars.len());
    for (index, c) in chars.iter().enumerate() {
        if c.is_whitespace() {
            let before = chars[..index].iter().rev().find(|c| !c.is_whitespace());
            let after = chars[index + 1..].iter().find(|c| !c.is_whitespace());
            if before.is_some_and(is_separator) || after.is_some_and(is_separator) {
                continue;
            }
        }
        out.push(*c);
    }
    out
}

/// Date at the start of `text`, plus the time of day found after it.
fn date_with_remainder(text: &str, fmt: &str) -> Option<NaiveDateTime> {
    let (date, rest) = NaiveDate::parse_and_remainder(text, fmt).ok()?;
    // `%y` stopping inside `2024`, `%d` inside `123`
    if rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let time_text = rest.strip_prefix('T').unwrap_or(rest).trim();
    let time = parse_time(time_text).unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time))
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
}

/// Result of re-normalizing a date already stored in a CRM table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDate {
    pub text: String,
    /// The value only made sense month-first and was swapped.
    pub inverted: bool,
}

/// Normalize a stored date to `dd/mm/yyyy`.
///
/// Day-first wins whenever it is valid; a value that is only valid
/// month-first is swapped and flagged. Blank or unparseable values become
/// blank.
pub fn normalize_stored_date(value: &str) -> NormalizedDate {
    let day_first = parse_with_order(value, FieldOrder::DayFirst);
    let month_first = parse_with_order(value, FieldOrder::MonthFirst);
    match (day_first, month_first) {
        (Some(dt), _) => NormalizedDate {
            text: fmt_date(Some(dt)),
            inverted: false,
        },
        (None, Some(dt)) => NormalizedDate {
            text: fmt_date(Some(dt)),
            inverted: true,
        },
        (None, None) => NormalizedDate {
            text: String::new(),
            inverted: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_time(NaiveTime::MIN)
    }

    #[test]
    fn serial_two_is_first_of_january_1900() {
        let value = excel_to_date(&Cell::Number(2.0));
        assert_eq!(fmt_date(value), "01/01/1900");
    }

    #[test]
    fn serial_uses_the_1899_12_30_epoch() {
        assert_eq!(serial_to_datetime(0.0), Some(ymd(1899, 12, 30)));
        assert_eq!(serial_to_datetime(45366.0), Some(ymd(2024, 3, 15)));
        let noon = serial_to_datetime(45366.5).unwrap();
        assert_eq!(fmt_date(Some(noon)), "15/03/2024");
        assert_eq!(serial_to_datetime(f64::NAN), None);
        assert_eq!(serial_to_datetime(1e12), None);
    }

    #[test]
    fn text_prefers_day_first() {
        assert_eq!(parse_date_text("05/03/2024"), Some(ymd(2024, 3, 5)));
        assert_eq!(parse_date_text("5-3-24"), Some(ymd(2024, 3, 5)));
        assert_eq!(parse_date_text("2024-03-05 00:00:00"), Some(ymd(2024, 3, 5)));
        assert_eq!(parse_date_text("03/25/2024"), Some(ymd(2024, 3, 25)));
    }

    #[test]
    fn common_written_forms_are_recognised() {
        let march_15 = ymd(2024, 3, 15);
        for text in [
            "15 Mar 2024",
            "15 march 2024",
            "15-mar-2024",
            "15-MAR-24",
            "20240315",
            "2024/03/15",
            "15.03.2024",
            "March 15, 2024",
            "15 / 03 / 2024",
            "15/03/2024 rinnovo tacito",
        ] {
            assert_eq!(parse_date_text(text).map(|dt| dt.date()), Some(march_15.date()), "{text}");
        }
    }

    #[test]
    fn times_and_offsets_are_kept_as_written() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(parse_date_text("2024-03-15T10:30:00Z"), Some(expected));
        assert_eq!(parse_date_text("2024-03-15T10:30:00+01:00"), Some(expected));
        assert_eq!(parse_date_text("2024-03-15T10:30:00"), Some(expected));
        assert_eq!(parse_date_text("15/03/2024 10:30"), Some(expected));
        assert_eq!(parse_date_text("15/03/24 10:30:00"), Some(expected));
    }

    #[test]
    fn two_digit_years_pivot_at_seventy() {
        assert_eq!(parse_date_text("01/01/69"), Some(ymd(2069, 1, 1)));
        assert_eq!(parse_date_text("01/01/70"), Some(ymd(1970, 1, 1)));
    }

    #[test]
    fn blank_and_garbage_yield_blank() {
        assert_eq!(fmt_date(excel_to_date(&Cell::Empty)), "");
        assert_eq!(fmt_date(excel_to_date(&Cell::Text("  ".into()))), "");
        assert_eq!(fmt_date(excel_to_date(&Cell::Text("VENDITA".into()))), "");
        assert_eq!(fmt_date(excel_to_date(&Cell::Text("31/02/2024".into()))), "");
        assert_eq!(fmt_date(excel_to_date(&Cell::Error("#REF!".into()))), "");
    }

    #[test]
    fn date_cells_pass_through() {
        let dt = ymd(2023, 11, 7);
        assert_eq!(excel_to_date(&Cell::DateTime(dt)), Some(dt));
    }

    #[test]
    fn formatted_dates_reparse_to_the_same_day() {
        for cell in [
            Cell::Number(44927.0),
            Cell::Text("17/08/2022".into()),
            Cell::Text("2021-12-31".into()),
        ] {
            let parsed = excel_to_date(&cell).unwrap();
            let text = fmt_date(Some(parsed));
            assert_eq!(parse_date_text(&text).map(|dt| dt.date()), Some(parsed.date()));
        }
    }

    #[test]
    fn stored_dates_swap_only_when_day_first_is_impossible() {
        let swapped = normalize_stored_date("03/25/2024");
        assert_eq!(swapped.text, "25/03/2024");
        assert!(swapped.inverted);

        let kept = normalize_stored_date("05/03/2024");
        assert_eq!(kept.text, "05/03/2024");
        assert!(!kept.inverted);

        assert_eq!(normalize_stored_date("2024-03-15").text, "15/03/2024");
        assert_eq!(normalize_stored_date("da definire").text, "");
    }
}
