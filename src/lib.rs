//! # Disbursement Curves
//!
//! A library for turning raw disbursement records into elapsed-time curves,
//! cross-project matrices and completion classifications.
//!
//! ## Core Concepts
//!
//! - **Relations**: `Proyectos`, `Operaciones` and `Desembolsos` tables decoded from
//!   CSV (or `.xlsx` with the `xlsx` feature) into typed records
//! - **Periods**: each disbursement is bucketed by the days elapsed since its stage's
//!   effective start (366-day years, 30-day months)
//! - **Reporting Units**: stage, sector, country or project, chosen per report
//! - **Curves**: per-period amounts, running totals and percentages of the ceiling
//! - **Matrices**: units as rows, periods as columns, with an exact `Total`
//! - **Classification**: Completed / Final disbursements / Just started
//! - **RFM**: recency, frequency and monetary scoring of stages into segments
//!
//! ## Example
//!
//! ```rust,ignore
//! use disbursement_curves::*;
//! use std::io::Cursor;
//!
//! let projects = SharedSource::new(Cursor::new(projects_csv));
//! let stages = SharedSource::new(Cursor::new(stages_csv));
//! let disbursements = SharedSource::new(Cursor::new(disbursements_csv));
//!
//! let tables = decode_csv_tables(
//!     &[
//!         (PROJECTS, &projects),
//!         (STAGES, &stages),
//!         (DISBURSEMENTS, &disbursements),
//!     ],
//!     b',',
//! )?;
//!
//! let config = ReportConfig {
//!     grouping: GroupingKey::Country,
//!     ..ReportConfig::default()
//! };
//!
//! let report = build_report(&tables, &config)?;
//! for classification in &report.classifications {
//!     println!("{}: {}", classification.unit, classification.category);
//! }
//! ```

pub mod classify;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod join;
pub mod matrix;
pub mod normalize;
pub mod period;
pub mod rfm;
pub mod schema;
pub mod source;
pub mod summary;
pub mod utils;

pub use classify::{categorize, classify, default_completion_tolerance, Classification, Classifier};
pub use engine::{aggregate, ceilings_from_rows, ceilings_of, Aggregator, PeriodSeries, SeriesPoint, UnitCeilings};
pub use error::{DisbursementError, Result};
pub use ingestion::*;
pub use join::{join, reporting_units, JoinedRow, ReportingUnit};
pub use matrix::{pivot, CellState, Matrix, MatrixBuilder, MatrixCell, MatrixRow};
pub use normalize::{normalize_amount, normalize_date, resolve_country, DateConvention};
pub use period::{bucketize, retain_since_activation, BucketedRow, Bucketing, Period};
pub use rfm::{rfm_analysis, segment_stats, Quartiles, RfmAnalysis, RfmAnalyzer, RfmQuartiles, RfmRecord, RfmScores, SegmentStats};
pub use schema::*;
pub use source::*;
pub use summary::{average_curve, calendar_month_summary, category_counts, CurvePoint, MonthSummary};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the pipeline discarded or could not resolve along the way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub normalization: NormalizationReport,
    pub joined_rows: usize,
    pub rows_without_stage: usize,
    pub rows_filtered_by_country: usize,
    /// Rows missing the disbursement date or the effective-start date.
    pub rows_without_dates: usize,
    pub rows_before_activation: usize,
    pub rows_removed_before_activation: usize,
    pub rows_without_unit: usize,
    /// Units whose percentages could not be computed.
    pub undefined_units: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub config: ReportConfig,
    pub series: PeriodSeries,
    pub amount_matrix: Matrix,
    pub percent_matrix: Matrix,
    pub classifications: Vec<Classification>,
    pub category_counts: BTreeMap<Category, usize>,
    pub unit_labels: BTreeMap<String, String>,
    pub diagnostics: Diagnostics,
}

impl Report {
    /// Amount matrix divided by `amount_scale` and rounded to `amount_decimals`.
    pub fn presentation_amounts(&self) -> Result<Matrix> {
        self.amount_matrix
            .scaled(self.config.amount_scale, self.config.amount_decimals)
    }

    pub fn presentation_percentages(&self) -> Result<Matrix> {
        self.percent_matrix.rounded(self.config.percent_decimals)
    }

    pub fn label(&self, unit: &str) -> String {
        self.unit_labels
            .get(unit)
            .cloned()
            .unwrap_or_else(|| unit.to_string())
    }

    pub fn classification(&self, unit: &str) -> Option<&Classification> {
        self.classifications.iter().find(|c| c.unit == unit)
    }
}

pub struct DisbursementReportProcessor;

impl DisbursementReportProcessor {
    pub fn process(tables: &TableSet, config: &ReportConfig) -> Result<Report> {
        config.validate()?;
        let dataset = Dataset::from_tables(tables)?;
        Self::process_dataset(&dataset, config)
    }

    pub fn process_dataset(dataset: &Dataset, config: &ReportConfig) -> Result<Report> {
        config.validate()?;

        info!(
            "Building report by {:?} ({:?} convention, {:?} periods)",
            config.grouping, config.convention, config.granularity
        );
        debug!(
            "Dataset contains {} projects, {} stages and {} disbursements",
            dataset.projects.len(),
            dataset.stages.len(),
            dataset.disbursements.len()
        );

        let mut diagnostics = Diagnostics {
            normalization: dataset.report.clone(),
            ..Diagnostics::default()
        };

        let in_scope = |stage_id: &str| {
            config.countries.is_empty() || config.countries.contains(&resolve_country(stage_id))
        };

        let stages: Vec<OperationStage> = dataset
            .stages
            .iter()
            .filter(|s| in_scope(&s.stage_id))
            .cloned()
            .collect();

        let mut rows = join(&dataset.projects, &stages, &dataset.disbursements);
        let before_filter = rows.len();
        rows.retain(|r| in_scope(&r.stage_id));
        diagnostics.rows_filtered_by_country = before_filter - rows.len();
        diagnostics.joined_rows = rows.len();
        diagnostics.rows_without_stage = rows.iter().filter(|r| !r.stage_matched).count();

        if diagnostics.rows_without_stage > 0 {
            warn!(
                "{} disbursements reference a stage missing from '{}'",
                diagnostics.rows_without_stage, STAGES
            );
        }

        let mut bucketing = bucketize(rows);
        diagnostics.rows_without_dates = bucketing.excluded;
        diagnostics.rows_before_activation = bucketing.negative;

        if config.only_since_activation {
            diagnostics.rows_removed_before_activation =
                retain_since_activation(&mut bucketing.rows);
            debug!(
                "Removed {} disbursements dated before activation",
                diagnostics.rows_removed_before_activation
            );
        }

        let units = reporting_units(&dataset.projects, &stages, config.grouping);
        let series = Aggregator::new(config.grouping, config.convention)
            .granularity(config.granularity)
            .with_ceilings(ceilings_of(&units))
            .aggregate(&bucketing.rows)?;
        diagnostics.rows_without_unit = series.dropped_rows;

        let mut row_units: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        let known: BTreeSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
        row_units.extend(
            series
                .units()
                .into_iter()
                .filter(|u| !known.contains(u))
                .map(str::to_string),
        );

        let amount_matrix = MatrixBuilder::new(Metric::Amount)
            .units(row_units.iter().cloned())
            .order(config.row_order)
            .build(&series)?;
        let percent_matrix = MatrixBuilder::new(Metric::PercentOfCeiling)
            .units(row_units.iter().cloned())
            .order(config.row_order)
            .build(&series)?;

        diagnostics.undefined_units = percent_matrix
            .rows
            .iter()
            .filter(|r| !r.percent_defined)
            .map(|r| r.unit.clone())
            .collect();
        if !diagnostics.undefined_units.is_empty() {
            warn!(
                "{} units have no usable denominator: {:?}",
                diagnostics.undefined_units.len(),
                diagnostics.undefined_units
            );
        }

        let classifications = Classifier::new()
            .tolerance(config.completion_tolerance)
            .classify(&percent_matrix)?;
        let category_counts = category_counts(&classifications);

        let unit_labels = row_units
            .iter()
            .map(|id| {
                let label = units
                    .iter()
                    .find(|u| &u.id == id)
                    .map(|u| u.label.clone())
                    .unwrap_or_else(|| id.clone());
                (id.clone(), label)
            })
            .collect();

        info!(
            "Report ready: {} units over {} periods ({:?})",
            amount_matrix.rows.len(),
            amount_matrix.periods.len(),
            category_counts
        );

        Ok(Report {
            config: config.clone(),
            series,
            amount_matrix,
            percent_matrix,
            classifications,
            category_counts,
            unit_labels,
            diagnostics,
        })
    }
}

pub fn build_report(tables: &TableSet, config: &ReportConfig) -> Result<Report> {
    DisbursementReportProcessor::process(tables, config)
}
