use crate::error::{DisbursementError, Result};
use crate::ingestion::{RawCell, RawTable, TableSet};
use log::debug;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

pub fn decode_csv<R: Read>(name: &str, reader: R, delimiter: u8) -> Result<RawTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut table = RawTable::new(name, headers);
    for record in rdr.records() {
        let record = record?;
        table.push_row(record.iter().map(RawCell::from_text).collect());
    }

    debug!("Decoded {} rows from CSV relation '{}'", table.rows.len(), name);
    Ok(table)
}

/// One I/O handle shared by concurrent decodes. The lock is held only while a decode
/// runs and each caller gets its own `RawTable`.
pub struct SharedSource<R> {
    handle: Mutex<R>,
}

impl<R: Read + Seek> SharedSource<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle: Mutex::new(handle),
        }
    }

    /// Runs `decode` with exclusive access to the handle, rewound to the start.
    fn with_handle<T>(&self, decode: impl FnOnce(&mut R) -> Result<T>) -> Result<T> {
        let mut guard = self
            .handle
            .lock()
            .map_err(|_| DisbursementError::SourcePoisoned)?;
        guard.seek(SeekFrom::Start(0))?;
        decode(&mut *guard)
    }

    pub fn decode_csv(&self, name: &str, delimiter: u8) -> Result<RawTable> {
        self.with_handle(|handle| decode_csv(name, handle, delimiter))
    }

    /// Decodes the named sheets of an `.xlsx` workbook. Sheets that do not exist are
    /// skipped so the caller can report the missing relation by name.
    #[cfg(feature = "xlsx")]
    pub fn decode_workbook(&self, sheets: &[&str]) -> Result<Vec<RawTable>> {
        self.with_handle(|handle| workbook::decode_sheets(handle, sheets))
    }

    pub fn into_inner(self) -> Result<R> {
        self.handle
            .into_inner()
            .map_err(|_| DisbursementError::SourcePoisoned)
    }
}

/// Decodes one CSV relation per source and slots each one by name.
pub fn decode_csv_tables<R: Read + Seek>(
    sources: &[(&str, &SharedSource<R>)],
    delimiter: u8,
) -> Result<TableSet> {
    let mut tables = TableSet::default();
    for (name, source) in sources {
        tables.insert(source.decode_csv(name, delimiter)?);
    }
    Ok(tables)
}

#[cfg(feature = "xlsx")]
pub fn decode_workbook_tables<R: Read + Seek>(source: &SharedSource<R>) -> Result<TableSet> {
    use crate::ingestion::{DISBURSEMENTS, PROJECTS, STAGES};

    let mut tables = TableSet::default();
    for table in source.decode_workbook(&[PROJECTS, STAGES, DISBURSEMENTS])? {
        tables.insert(table);
    }
    Ok(tables)
}

#[cfg(feature = "xlsx")]
mod workbook {
    use super::*;
    use calamine::{Data, Reader, Xlsx};

    pub(super) fn decode_sheets<RS: Read + Seek>(
        handle: RS,
        sheets: &[&str],
    ) -> Result<Vec<RawTable>> {
        let mut workbook: Xlsx<RS> =
            Xlsx::new(handle).map_err(|e| DisbursementError::Workbook(e.to_string()))?;
        let available = workbook.sheet_names();

        let mut tables = Vec::new();
        for name in sheets {
            if !available.iter().any(|s| s.as_str() == *name) {
                debug!("Workbook has no sheet named '{}'", name);
                continue;
            }

            let range = workbook
                .worksheet_range(name)
                .map_err(|e| DisbursementError::Workbook(format!("sheet '{}': {}", name, e)))?;

            let mut rows = range.rows();
            let headers = rows
                .next()
                .map(|header| {
                    header
                        .iter()
                        .map(|cell| cell.to_string().trim().to_string())
                        .collect()
                })
                .unwrap_or_default();

            let mut table = RawTable::new(*name, headers);
            for row in rows {
                table.push_row(row.iter().map(cell_from_data).collect());
            }
            debug!("Decoded {} rows from sheet '{}'", table.rows.len(), name);
            tables.push(table);
        }

        Ok(tables)
    }

    fn cell_from_data(cell: &Data) -> RawCell {
        match cell {
            Data::Empty => RawCell::Empty,
            Data::String(s) => RawCell::from_text(s),
            Data::Float(n) => RawCell::Number(*n),
            Data::Int(n) => RawCell::Number(*n as f64),
            Data::DateTime(dt) => dt
                .as_datetime()
                .map(|d| RawCell::Date(d.date()))
                .unwrap_or(RawCell::Number(dt.as_f64())),
            // ISO timestamps: keep the date part only.
            Data::DateTimeIso(s) => RawCell::from_text(s.get(..10).unwrap_or(s)),
            other => RawCell::from_text(&other.to_string()),
        }
    }

}
