use crate::classify::Classification;
use crate::engine::PeriodSeries;
use crate::error::{DisbursementError, Result};
use crate::schema::{Category, DisbursementRecord};
use crate::utils::{checked_sum, first_day_of_month, last_day_of_month, same_calendar_month};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Units per category. Every category is present, possibly with zero.
pub fn category_counts(classifications: &[Classification]) -> BTreeMap<Category, usize> {
    let mut counts: BTreeMap<Category, usize> = [
        Category::Completed,
        Category::FinalDisbursements,
        Category::JustStarted,
    ]
    .into_iter()
    .map(|c| (c, 0))
    .collect();

    for classification in classifications {
        *counts.entry(classification.category).or_default() += 1;
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub period: i64,
    /// Units with a point in this period.
    pub units: usize,
    pub mean_amount: Decimal,
    pub mean_cumulative_amount: Decimal,
    /// Mean over the units whose percentage is defined.
    pub mean_cumulative_percent: Option<Decimal>,
}

fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    checked_sum(values.iter().copied())?.checked_div(Decimal::from(values.len()))
}

/// Per-period mean curve across the units accepted by `filter`.
pub fn average_curve<F>(series: &PeriodSeries, filter: F) -> Vec<CurvePoint>
where
    F: Fn(&str) -> bool,
{
    let mut by_period: BTreeMap<i64, (Vec<Decimal>, Vec<Decimal>, Vec<Decimal>)> = BTreeMap::new();

    for point in series.points.iter().filter(|p| filter(&p.unit)) {
        let (amounts, cumulative, percents) = by_period.entry(point.period).or_default();
        amounts.push(point.amount);
        cumulative.push(point.cumulative_amount);
        if let Some(percent) = point.cumulative_percent_of_ceiling {
            percents.push(percent);
        }
    }

    by_period
        .into_iter()
        .map(|(period, (amounts, cumulative, percents))| CurvePoint {
            period,
            units: amounts.len(),
            mean_amount: mean(&amounts).unwrap_or_default(),
            mean_cumulative_amount: mean(&cumulative).unwrap_or_default(),
            mean_cumulative_percent: mean(&percents),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total_amount: Decimal,
    pub disbursements: usize,
    pub distinct_stages: usize,
}

/// Totals for disbursements dated within one calendar month.
pub fn calendar_month_summary(
    disbursements: &[DisbursementRecord],
    year: i32,
    month: u32,
) -> Result<MonthSummary> {
    let (Some(from), Some(to)) = (first_day_of_month(year, month), last_day_of_month(year, month))
    else {
        return Err(DisbursementError::InvalidConfig(format!(
            "{}-{} is not a calendar month",
            year, month
        )));
    };

    let in_month: Vec<&DisbursementRecord> = disbursements
        .iter()
        .filter(|d| {
            d.disbursement_date
                .as_date()
                .is_some_and(|date| same_calendar_month(date, year, month))
        })
        .collect();

    let stages: BTreeSet<&str> = in_month.iter().map(|d| d.stage_id.as_str()).collect();
    let total_amount = checked_sum(in_month.iter().filter_map(|d| d.amount))
        .ok_or_else(|| DisbursementError::overflow(&format!("{}-{:02}", year, month)))?;

    Ok(MonthSummary {
        from,
        to,
        total_amount,
        disbursements: in_month.len(),
        distinct_stages: stages.len(),
    })
}
