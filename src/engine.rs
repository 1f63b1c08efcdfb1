use crate::error::{DisbursementError, Result};
use crate::join::ReportingUnit;
use crate::period::BucketedRow;
use crate::schema::{GroupingKey, PercentConvention, PeriodGranularity};
use crate::utils::{checked_sum, percent_of};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ceiling per reporting unit. `None` marks a unit whose percentages are undefined.
pub type UnitCeilings = BTreeMap<String, Option<Decimal>>;

pub fn ceilings_of(units: &[ReportingUnit]) -> UnitCeilings {
    units
        .iter()
        .map(|unit| (unit.id.clone(), unit.ceiling))
        .collect()
}

/// Derives unit ceilings from the joined rows alone.
///
/// Each distinct stage contributes the ceiling of its first row. A disbursement with
/// no matching stage has no ceiling, which leaves its unit undefined.
pub fn ceilings_from_rows(rows: &[BucketedRow], key: GroupingKey) -> UnitCeilings {
    let mut seen: BTreeSet<(String, &str)> = BTreeSet::new();
    let mut ceilings = UnitCeilings::new();

    for bucketed in rows {
        let Some(unit) = bucketed.row.unit(key) else {
            continue;
        };
        if !seen.insert((unit.clone(), bucketed.row.stage_id.as_str())) {
            continue;
        }
        let sum = ceilings.entry(unit).or_insert(Some(Decimal::ZERO));
        *sum = match (*sum, bucketed.row.ceiling) {
            (Some(total), Some(ceiling)) => total.checked_add(ceiling),
            _ => None,
        };
    }

    ceilings
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub unit: String,
    pub period: i64,
    pub amount: Decimal,
    pub cumulative_amount: Decimal,
    pub percent_of_ceiling: Option<Decimal>,
    pub cumulative_percent_of_ceiling: Option<Decimal>,
    /// Denominator the percentages were computed against.
    pub ceiling: Option<Decimal>,
    pub disbursements: usize,
}

/// One point per (unit, period), ordered by unit then period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSeries {
    pub convention: PercentConvention,
    pub granularity: PeriodGranularity,
    pub points: Vec<SeriesPoint>,
    pub ceilings: UnitCeilings,
    pub denominators: BTreeMap<String, Option<Decimal>>,
    /// Rows dropped because their grouping attribute was missing.
    pub dropped_rows: usize,
}

impl PeriodSeries {
    pub fn unit(&self, id: &str) -> Vec<&SeriesPoint> {
        self.points.iter().filter(|p| p.unit == id).collect()
    }

    pub fn units(&self) -> BTreeSet<&str> {
        self.points.iter().map(|p| p.unit.as_str()).collect()
    }

    pub fn periods(&self) -> BTreeSet<i64> {
        self.points.iter().map(|p| p.period).collect()
    }

    pub fn denominator(&self, unit: &str) -> Option<Decimal> {
        self.denominators.get(unit).copied().flatten()
    }

    /// `None` if the unit's amounts overflow.
    pub fn total(&self, unit: &str) -> Option<Decimal> {
        checked_sum(
            self.points
                .iter()
                .filter(|p| p.unit == unit)
                .map(|p| p.amount),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Rebuilds the cumulative columns, denominators and percentages from `amount`.
    /// Running it twice yields the same series.
    pub fn recompute_cumulative(&mut self) -> Result<()> {
        self.points
            .sort_by(|a, b| a.unit.cmp(&b.unit).then(a.period.cmp(&b.period)));

        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for point in &self.points {
            let total = totals.entry(point.unit.clone()).or_default();
            *total = total
                .checked_add(point.amount)
                .ok_or_else(|| DisbursementError::overflow(&point.unit))?;
        }

        let mut denominators: BTreeMap<String, Option<Decimal>> = self
            .ceilings
            .keys()
            .chain(totals.keys())
            .map(|unit| (unit.clone(), None))
            .collect();
        for (unit, denominator) in denominators.iter_mut() {
            *denominator = match self.convention {
                PercentConvention::Ceiling => self.ceilings.get(unit).copied().flatten(),
                PercentConvention::SelfNormalizing => totals.get(unit).copied(),
            }
            .filter(|d| *d > Decimal::ZERO);
        }

        let mut running = Decimal::ZERO;
        let mut current: Option<String> = None;
        for point in self.points.iter_mut() {
            if current.as_deref() != Some(point.unit.as_str()) {
                running = Decimal::ZERO;
                current = Some(point.unit.clone());
            }
            running = running
                .checked_add(point.amount)
                .ok_or_else(|| DisbursementError::overflow(&point.unit))?;
            point.cumulative_amount = running;

            let denominator = denominators.get(&point.unit).copied().flatten();
            point.ceiling = denominator;
            point.percent_of_ceiling = denominator.and_then(|d| percent_of(point.amount, d));
            point.cumulative_percent_of_ceiling = denominator.and_then(|d| percent_of(running, d));
        }

        self.denominators = denominators;
        Ok(())
    }
}

pub struct Aggregator {
    key: GroupingKey,
    convention: PercentConvention,
    granularity: PeriodGranularity,
    ceilings: Option<UnitCeilings>,
}

impl Aggregator {
    pub fn new(key: GroupingKey, convention: PercentConvention) -> Self {
        Self {
            key,
            convention,
            granularity: PeriodGranularity::Year,
            ceilings: None,
        }
    }

    pub fn granularity(mut self, granularity: PeriodGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Uses these ceilings instead of deriving them from the rows.
    pub fn with_ceilings(mut self, ceilings: UnitCeilings) -> Self {
        self.ceilings = Some(ceilings);
        self
    }

    pub fn aggregate(&self, rows: &[BucketedRow]) -> Result<PeriodSeries> {
        let mut buckets: BTreeMap<(String, i64), (Decimal, usize)> = BTreeMap::new();
        let mut dropped_rows = 0usize;

        for bucketed in rows {
            let Some(unit) = bucketed.row.unit(self.key) else {
                dropped_rows += 1;
                continue;
            };
            let amount = bucketed.row.amount.unwrap_or(Decimal::ZERO);
            let bucket = buckets
                .entry((unit, bucketed.period.index(self.granularity)))
                .or_insert((Decimal::ZERO, 0));
            bucket.0 = bucket
                .0
                .checked_add(amount)
                .ok_or_else(|| {
                    DisbursementError::overflow(&bucketed.row.unit(self.key).unwrap_or_default())
                })?;
            bucket.1 += 1;
        }

        if dropped_rows > 0 {
            warn!(
                "Dropped {} disbursements with no {:?} to group by",
                dropped_rows, self.key
            );
        }

        let points = buckets
            .into_iter()
            .map(|((unit, period), (amount, disbursements))| SeriesPoint {
                unit,
                period,
                amount,
                cumulative_amount: Decimal::ZERO,
                percent_of_ceiling: None,
                cumulative_percent_of_ceiling: None,
                ceiling: None,
                disbursements,
            })
            .collect();

        let ceilings = match &self.ceilings {
            Some(ceilings) => ceilings.clone(),
            None => ceilings_from_rows(rows, self.key),
        };

        let mut series = PeriodSeries {
            convention: self.convention,
            granularity: self.granularity,
            points,
            ceilings,
            denominators: BTreeMap::new(),
            dropped_rows,
        };
        series.recompute_cumulative()?;

        debug!(
            "Aggregated {} rows into {} points across {} units",
            rows.len(),
            series.points.len(),
            series.units().len()
        );

        Ok(series)
    }
}

pub fn aggregate(
    rows: &[BucketedRow],
    key: GroupingKey,
    convention: PercentConvention,
    granularity: PeriodGranularity,
) -> Result<PeriodSeries> {
    Aggregator::new(key, convention)
        .granularity(granularity)
        .aggregate(rows)
}
