use crate::error::{DisbursementError, Result};
use crate::normalize::{normalize_amount, normalize_date};
use crate::schema::{DisbursementRecord, NormalizedDate, OperationStage, Project};
use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const PROJECTS: &str = "Proyectos";
pub const STAGES: &str = "Operaciones";
pub const DISBURSEMENTS: &str = "Desembolsos";

static EMPTY_CELL: RawCell = RawCell::Empty;

pub mod columns {
    pub const PROJECT_ID: &[&str] = &["NoProyecto"];
    pub const PRIORITY_AREA: &[&str] = &["IDAreaPrioritaria"];
    pub const INTERVENTION_AREA: &[&str] = &["IDAreaIntervencion"];
    pub const COUNTRY: &[&str] = &["Pais"];
    pub const ALIAS: &[&str] = &["Alias"];

    pub const STAGE_ID: &[&str] = &["IDEtapa", "NoEtapa"];
    pub const EFFECTIVE_START: &[&str] = &["FechaVigencia"];
    pub const CEILING: &[&str] = &["AporteFonplata", "AporteFONPLATAVigente"];
    pub const SECTOR: &[&str] = &["SECTOR"];
    pub const SUBSECTOR: &[&str] = &["SUBSECTOR"];
    pub const NICKNAME: &[&str] = &["APODO"];

    pub const DISBURSEMENT_ID: &[&str] = &["IDDesembolso"];
    pub const DISBURSEMENT_STAGE: &[&str] = &["IDEtapa", "NoOperacion"];
    pub const DISBURSEMENT_DATE: &[&str] = &["FechaEfectiva"];
    pub const AMOUNT: &[&str] = &["Monto"];
}

/// A decoded cell, before any normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawCell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl RawCell {
    pub fn from_text(text: &str) -> Self {
        if text.trim().is_empty() {
            RawCell::Empty
        } else {
            RawCell::Text(text.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RawCell::Empty)
    }

    /// Identifier/label view of the cell. Whole numbers print without a fraction.
    pub fn to_text(&self) -> Option<String> {
        match self {
            RawCell::Empty => None,
            RawCell::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            RawCell::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
            RawCell::Date(d) => Some(d.format("%d/%m/%Y").to_string()),
        }
    }
}

/// One decoded relation: a header row plus data rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<RawCell>>,
}

impl RawTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<RawCell>) {
        self.rows.push(row);
    }

    /// Finds the first alias present in the header row (trimmed, case-insensitive).
    pub fn column_index(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| {
            self.headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(alias))
        })
    }

    pub fn require_column(&self, relation: &str, aliases: &[&str]) -> Result<usize> {
        self.column_index(aliases)
            .ok_or_else(|| DisbursementError::missing_column(relation, aliases))
    }

    fn cell(row: &[RawCell], idx: Option<usize>) -> &RawCell {
        idx.and_then(|i| row.get(i)).unwrap_or(&EMPTY_CELL)
    }

    fn data_rows(&self) -> impl Iterator<Item = &Vec<RawCell>> {
        self.rows
            .iter()
            .filter(|row| !row.iter().all(RawCell::is_empty))
    }
}

/// The three relations the engine consumes. A `None` relation is a fatal input error.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    pub projects: Option<RawTable>,
    pub stages: Option<RawTable>,
    pub disbursements: Option<RawTable>,
}

impl TableSet {
    pub fn new(projects: RawTable, stages: RawTable, disbursements: RawTable) -> Self {
        Self {
            projects: Some(projects),
            stages: Some(stages),
            disbursements: Some(disbursements),
        }
    }

    /// Slots a decoded table by its relation name (`Proyectos`, `Operaciones`, `Desembolsos`).
    pub fn insert(&mut self, table: RawTable) -> Option<RawTable> {
        let slot = match table.name.as_str() {
            PROJECTS => &mut self.projects,
            STAGES => &mut self.stages,
            DISBURSEMENTS => &mut self.disbursements,
            other => {
                warn!("Ignoring unrecognised relation '{}'", other);
                return Some(table);
            }
        };
        slot.replace(table)
    }
}

fn require_table<'a>(table: &'a Option<RawTable>, relation: &str) -> Result<&'a RawTable> {
    table.as_ref().ok_or_else(|| DisbursementError::MissingTable {
        relation: relation.to_string(),
    })
}

/// Counts of fields that did not survive normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub unparsed_dates: usize,
    pub missing_dates: usize,
    pub missing_amounts: usize,
    pub missing_ceilings: usize,
    pub skipped_rows: usize,
}

impl NormalizationReport {
    fn record_date(&mut self, date: &NormalizedDate) {
        match date {
            NormalizedDate::Unparsed(_) => self.unparsed_dates += 1,
            NormalizedDate::Missing => self.missing_dates += 1,
            NormalizedDate::Parsed(_) => {}
        }
    }
}

/// Typed, normalized records for all three relations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub projects: Vec<Project>,
    pub stages: Vec<OperationStage>,
    pub disbursements: Vec<DisbursementRecord>,
    pub report: NormalizationReport,
}

impl Dataset {
    pub fn from_tables(tables: &TableSet) -> Result<Self> {
        let projects_table = require_table(&tables.projects, PROJECTS)?;
        let stages_table = require_table(&tables.stages, STAGES)?;
        let disbursements_table = require_table(&tables.disbursements, DISBURSEMENTS)?;

        let mut report = NormalizationReport::default();
        let projects = load_projects(projects_table, &mut report)?;
        let stages = load_stages(stages_table, &mut report)?;
        let disbursements = load_disbursements(disbursements_table, &mut report)?;

        debug!(
            "Loaded {} projects, {} stages and {} disbursements ({:?})",
            projects.len(),
            stages.len(),
            disbursements.len(),
            report
        );

        Ok(Self {
            projects,
            stages,
            disbursements,
            report,
        })
    }
}

pub fn load_projects(table: &RawTable, report: &mut NormalizationReport) -> Result<Vec<Project>> {
    let id = table.require_column(PROJECTS, columns::PROJECT_ID)?;
    let sector = table.column_index(columns::PRIORITY_AREA);
    let sub_sector = table.column_index(columns::INTERVENTION_AREA);
    let country = table.column_index(columns::COUNTRY);
    let alias = table.column_index(columns::ALIAS);

    let mut projects = Vec::new();
    for row in table.data_rows() {
        let Some(project_id) = RawTable::cell(row, Some(id)).to_text() else {
            warn!("Skipping {} row without a project id", PROJECTS);
            report.skipped_rows += 1;
            continue;
        };

        projects.push(Project {
            project_id,
            sector: RawTable::cell(row, sector).to_text(),
            sub_sector: RawTable::cell(row, sub_sector).to_text(),
            country: RawTable::cell(row, country).to_text(),
            alias: RawTable::cell(row, alias).to_text(),
        });
    }

    Ok(projects)
}

pub fn load_stages(
    table: &RawTable,
    report: &mut NormalizationReport,
) -> Result<Vec<OperationStage>> {
    let id = table.require_column(STAGES, columns::STAGE_ID)?;
    let start = table.require_column(STAGES, columns::EFFECTIVE_START)?;
    let ceiling_col = table.require_column(STAGES, columns::CEILING)?;
    let project = table.column_index(columns::PROJECT_ID);
    let sector = table.column_index(columns::SECTOR);
    let sub_sector = table.column_index(columns::SUBSECTOR);
    let nickname = table.column_index(columns::NICKNAME);

    let mut stages = Vec::new();
    for row in table.data_rows() {
        let Some(stage_id) = RawTable::cell(row, Some(id)).to_text() else {
            warn!("Skipping {} row without a stage id", STAGES);
            report.skipped_rows += 1;
            continue;
        };

        let effective_start = normalize_date(RawTable::cell(row, Some(start)));
        report.record_date(&effective_start);

        let ceiling = normalize_amount(RawTable::cell(row, Some(ceiling_col)));
        if ceiling.is_none() {
            report.missing_ceilings += 1;
        }

        stages.push(OperationStage {
            stage_id,
            project_id: RawTable::cell(row, project).to_text(),
            effective_start,
            ceiling,
            sector: RawTable::cell(row, sector).to_text(),
            sub_sector: RawTable::cell(row, sub_sector).to_text(),
            nickname: RawTable::cell(row, nickname).to_text(),
        });
    }

    Ok(stages)
}

/// Disbursement rows are never dropped for bad fields: blank ids stay empty and
/// simply fail to join.
pub fn load_disbursements(
    table: &RawTable,
    report: &mut NormalizationReport,
) -> Result<Vec<DisbursementRecord>> {
    let id = table.require_column(DISBURSEMENTS, columns::DISBURSEMENT_ID)?;
    let stage = table.require_column(DISBURSEMENTS, columns::DISBURSEMENT_STAGE)?;
    let date = table.require_column(DISBURSEMENTS, columns::DISBURSEMENT_DATE)?;
    let amount = table.require_column(DISBURSEMENTS, columns::AMOUNT)?;

    let mut disbursements = Vec::new();
    for row in table.data_rows() {
        let disbursement_date = normalize_date(RawTable::cell(row, Some(date)));
        report.record_date(&disbursement_date);

        let value = normalize_amount(RawTable::cell(row, Some(amount)));
        if value.is_none() {
            report.missing_amounts += 1;
        }

        disbursements.push(DisbursementRecord {
            disbursement_id: RawTable::cell(row, Some(id)).to_text().unwrap_or_default(),
            stage_id: RawTable::cell(row, Some(stage)).to_text().unwrap_or_default(),
            disbursement_date,
            amount: value,
        });
    }

    Ok(disbursements)
}
