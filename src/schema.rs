use crate::error::{DisbursementError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Project reference data (`Proyectos`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    /// `IDAreaPrioritaria`
    pub sector: Option<String>,
    /// `IDAreaIntervencion`
    pub sub_sector: Option<String>,
    pub country: Option<String>,
    pub alias: Option<String>,
}

/// A financing operation stage (`Operaciones`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStage {
    pub stage_id: String,
    pub project_id: Option<String>,
    pub effective_start: NormalizedDate,
    /// Committed ceiling. `None` when the source value was empty or unparseable.
    pub ceiling: Option<Decimal>,
    pub sector: Option<String>,
    pub sub_sector: Option<String>,
    pub nickname: Option<String>,
}

/// A single disbursement transaction (`Desembolsos`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisbursementRecord {
    pub disbursement_id: String,
    pub stage_id: String,
    pub disbursement_date: NormalizedDate,
    pub amount: Option<Decimal>,
}

/// Outcome of normalizing a date field.
///
/// Text that matches none of the known conventions is kept verbatim as
/// `Unparsed` so callers can report it; it never takes part in bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum NormalizedDate {
    Parsed(NaiveDate),
    Unparsed(String),
    Missing,
}

impl NormalizedDate {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            NormalizedDate::Parsed(date) => Some(*date),
            _ => None,
        }
    }

    pub fn is_unparsed(&self) -> bool {
        matches!(self, NormalizedDate::Unparsed(_))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Country {
    Argentina,
    Bolivia,
    Brasil,
    Paraguay,
    Uruguay,
    Unknown,
}

impl Country {
    /// Maps a two-letter stage prefix to a country. Total: anything unmapped is `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "AR" => Country::Argentina,
            "BO" => Country::Bolivia,
            "BR" => Country::Brasil,
            "PY" => Country::Paraguay,
            "UR" => Country::Uruguay,
            _ => Country::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Country::Argentina => "Argentina",
            Country::Bolivia => "Bolivia",
            Country::Brasil => "Brasil",
            Country::Paraguay => "Paraguay",
            Country::Uruguay => "Uruguay",
            Country::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum GroupingKey {
    #[schemars(description = "One reporting unit per financing stage (IDEtapa)")]
    Stage,

    #[schemars(description = "One reporting unit per stage SECTOR")]
    Sector,

    #[schemars(description = "One reporting unit per country resolved from the stage prefix")]
    Country,

    #[schemars(description = "One reporting unit per parent project (NoProyecto)")]
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum PercentConvention {
    #[schemars(description = "Percentages relative to the committed ceiling of the reporting unit")]
    Ceiling,

    #[schemars(
        description = "Percentages relative to the unit's own total disbursed. Use when no ceiling is available."
    )]
    SelfNormalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum PeriodGranularity {
    #[schemars(description = "366-day buckets since the effective start")]
    Year,

    #[schemars(description = "30-day buckets since the effective start")]
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Metric {
    Amount,
    PercentOfCeiling,
    CumulativeAmount,
    CumulativePercent,
}

impl Metric {
    pub fn is_percentage(&self) -> bool {
        matches!(self, Metric::PercentOfCeiling | Metric::CumulativePercent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum RowOrder {
    Alphabetical,
    AsGiven,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum Category {
    Completed,
    FinalDisbursements,
    JustStarted,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Completed => "Completed",
            Category::FinalDisbursements => "Final disbursements",
            Category::JustStarted => "Just started",
        };
        f.write_str(label)
    }
}

/// Recency/frequency/monetary segment of a stage, in assignment order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum Segment {
    Champions,
    LoyalCustomers,
    PotentialLoyalist,
    NewCustomers,
    AtRisk,
    CantLoseThem,
    Hibernating,
}

impl Segment {
    pub const ALL: [Segment; 7] = [
        Segment::Champions,
        Segment::LoyalCustomers,
        Segment::PotentialLoyalist,
        Segment::NewCustomers,
        Segment::AtRisk,
        Segment::CantLoseThem,
        Segment::Hibernating,
    ];
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Segment::Champions => "Champions",
            Segment::LoyalCustomers => "Loyal Customers",
            Segment::PotentialLoyalist => "Potential Loyalist",
            Segment::NewCustomers => "New Customers",
            Segment::AtRisk => "At Risk",
            Segment::CantLoseThem => "Can't Lose Them",
            Segment::Hibernating => "Hibernating",
        };
        f.write_str(label)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum StageStatus {
    /// Disbursed within the completion tolerance of its ceiling.
    Finished,
    Active,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Finished => f.write_str("Finished"),
            StageStatus::Active => f.write_str("Active"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReportConfig {
    #[schemars(description = "Which attribute defines a reporting unit")]
    pub grouping: GroupingKey,

    #[schemars(description = "How period percentages are computed")]
    pub convention: PercentConvention,

    #[schemars(description = "Whether periods are elapsed years or elapsed months")]
    pub granularity: PeriodGranularity,

    #[schemars(
        description = "Drop disbursements dated before their stage's effective start (negative periods). Off by default."
    )]
    pub only_since_activation: bool,

    #[schemars(description = "Countries to keep. Empty keeps every country.")]
    pub countries: Vec<Country>,

    #[schemars(description = "Row ordering of the matrices")]
    pub row_order: RowOrder,

    #[schemars(
        with = "String",
        description = "Half-width of the window around 100 that still counts as Completed"
    )]
    pub completion_tolerance: Decimal,

    #[schemars(
        with = "String",
        description = "Divisor applied to the presentation amount matrix (1000000 = millions)"
    )]
    pub amount_scale: Decimal,

    #[schemars(description = "Decimal places kept in the presentation amount matrix")]
    pub amount_decimals: u32,

    #[schemars(description = "Decimal places kept in the presentation percentage matrix")]
    pub percent_decimals: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            grouping: GroupingKey::Stage,
            convention: PercentConvention::Ceiling,
            granularity: PeriodGranularity::Year,
            only_since_activation: false,
            countries: Vec::new(),
            row_order: RowOrder::Alphabetical,
            completion_tolerance: crate::classify::default_completion_tolerance(),
            amount_scale: dec!(1000000),
            amount_decimals: 3,
            percent_decimals: 2,
        }
    }
}

impl ReportConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ReportConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.completion_tolerance < Decimal::ZERO || self.completion_tolerance > dec!(100) {
            return Err(DisbursementError::InvalidTolerance(
                self.completion_tolerance,
            ));
        }

        if self.amount_scale <= Decimal::ZERO {
            return Err(DisbursementError::InvalidScale(self.amount_scale));
        }

        if self.amount_decimals > 12 || self.percent_decimals > 12 {
            return Err(DisbursementError::InvalidConfig(format!(
                "rounding to {} / {} decimal places is not supported (max 12)",
                self.amount_decimals, self.percent_decimals
            )));
        }

        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReportConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
