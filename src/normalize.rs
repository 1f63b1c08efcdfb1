use crate::ingestion::RawCell;
use crate::schema::{Country, NormalizedDate};
use chrono::{NaiveDate, NaiveDateTime};
use log::warn;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// A textual date convention found in the source sheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateConvention {
    /// `15-ago-14`, `1-dic-17`, `13 abr 2020`
    MonthAbbreviation,
    /// `17/11/2015`, `17-11-2015`
    DayMonthYear,
    /// `martes, 17 de noviembre de 2015`
    SpelledOut,
    /// `2015-11-17`, optionally followed by a time of day
    Iso,
}

/// Conventions in the order they are attempted. The first match wins.
pub const DATE_CONVENTIONS: [DateConvention; 4] = [
    DateConvention::MonthAbbreviation,
    DateConvention::DayMonthYear,
    DateConvention::SpelledOut,
    DateConvention::Iso,
];

impl DateConvention {
    pub fn parse(&self, text: &str) -> Option<NaiveDate> {
        match self {
            DateConvention::MonthAbbreviation => parse_month_abbreviation(text),
            DateConvention::DayMonthYear => parse_day_month_year(text),
            DateConvention::SpelledOut => parse_spelled_out(text),
            DateConvention::Iso => parse_iso(text),
        }
    }
}

pub fn normalize_date(cell: &RawCell) -> NormalizedDate {
    match cell {
        RawCell::Empty => NormalizedDate::Missing,
        RawCell::Date(date) => NormalizedDate::Parsed(*date),
        RawCell::Text(text) => parse_date_text(text),
        RawCell::Number(n) => {
            warn!("Numeric value {} found where a date was expected", n);
            NormalizedDate::Unparsed(n.to_string())
        }
    }
}

pub fn parse_date_text(text: &str) -> NormalizedDate {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return NormalizedDate::Missing;
    }

    for convention in DATE_CONVENTIONS {
        if let Some(date) = convention.parse(trimmed) {
            return NormalizedDate::Parsed(date);
        }
    }

    warn!("Could not parse date '{}', keeping it unparsed", text);
    NormalizedDate::Unparsed(text.to_string())
}

pub fn normalize_amount(cell: &RawCell) -> Option<Decimal> {
    match cell {
        RawCell::Empty => None,
        RawCell::Text(text) => parse_amount_text(text),
        RawCell::Number(n) => {
            let value = Decimal::from_f64(*n);
            if value.is_none() {
                warn!("Numeric amount {} cannot be represented as a decimal", n);
            }
            value
        }
        RawCell::Date(date) => {
            warn!("Date {} found where an amount was expected", date);
            None
        }
    }
}

/// Parses an amount written with `.` as thousands separator and `,` as decimal
/// separator (`1.234.567,89`).
pub fn parse_amount_text(text: &str) -> Option<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let canonical = trimmed.replace('.', "").replace(',', ".");
    match Decimal::from_str(&canonical) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Could not convert amount '{}'", text);
            None
        }
    }
}

pub fn resolve_country(stage_id: &str) -> Country {
    stage_id
        .get(..2)
        .map(Country::from_code)
        .unwrap_or(Country::Unknown)
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "ene" | "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "sep" | "set" => 9,
        "oct" => 10,
        "nov" => 11,
        "dic" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn parse_number(part: &str, min_len: usize, max_len: usize) -> Option<u32> {
    if part.len() < min_len || part.len() > max_len || !part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    part.parse().ok()
}

fn parse_year(part: &str) -> Option<i32> {
    match part.len() {
        2 => parse_number(part, 2, 2).map(|y| 2000 + y as i32),
        4 => parse_number(part, 4, 4).map(|y| y as i32),
        _ => None,
    }
}

fn parse_month_abbreviation(text: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = text
        .split(|c| c == '-' || c == ' ')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 3 {
        return None;
    }

    let day = parse_number(parts[0], 1, 2)?;
    let name = parts[1].trim_end_matches('.');
    if !name.chars().all(char::is_alphabetic) {
        return None;
    }
    let month = month_from_name(name)?;
    let year = parse_year(parts[2])?;

    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_day_month_year(text: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = text.split(|c| c == '/' || c == '-').collect();
    if parts.len() != 3 {
        return None;
    }

    let day = parse_number(parts[0], 1, 2)?;
    let month = parse_number(parts[1], 1, 2)?;
    let year = parse_year(parts[2])?;

    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_spelled_out(text: &str) -> Option<NaiveDate> {
    let cleaned = text.replace(',', " ");
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();

    // Leading weekday name is optional.
    if tokens.len() == 6 {
        tokens.remove(0);
    }
    if tokens.len() != 5 {
        return None;
    }
    if !tokens[1].eq_ignore_ascii_case("de") || !tokens[3].eq_ignore_ascii_case("de") {
        return None;
    }

    let day = parse_number(tokens[0], 1, 2)?;
    let month = month_from_name(tokens[2])?;
    let year = parse_year(tokens[4]).filter(|_| tokens[4].len() == 4)?;

    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_iso(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}
