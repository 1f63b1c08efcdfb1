use crate::engine::{PeriodSeries, SeriesPoint};
use crate::error::{DisbursementError, Result};
use crate::schema::{Metric, RowOrder};
use crate::utils::checked_sum;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellState {
    Observed,
    /// No disbursement fell in this period.
    NoDisbursement,
    /// A disbursement exists but its percentage has no denominator.
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatrixCell {
    pub value: Decimal,
    pub state: CellState,
}

impl MatrixCell {
    fn empty(state: CellState) -> Self {
        Self {
            value: Decimal::ZERO,
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    pub unit: String,
    pub cells: Vec<MatrixCell>,
    pub total: Decimal,
    /// False for a percentage row whose unit has no usable denominator.
    pub percent_defined: bool,
}

impl MatrixRow {
    fn retotal(&mut self) -> Result<()> {
        self.total = checked_sum(self.cells.iter().map(|c| c.value))
            .ok_or_else(|| DisbursementError::overflow(&self.unit))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub metric: Metric,
    pub periods: Vec<i64>,
    pub rows: Vec<MatrixRow>,
}

impl Matrix {
    pub fn row(&self, unit: &str) -> Option<&MatrixRow> {
        self.rows.iter().find(|r| r.unit == unit)
    }

    pub fn value(&self, unit: &str, period: i64) -> Option<Decimal> {
        let column = self.periods.iter().position(|p| *p == period)?;
        self.row(unit)?.cells.get(column).map(|c| c.value)
    }

    pub fn units(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.unit.as_str()).collect()
    }

    /// Divides every cell by `divisor` and rounds to `dp` places. `Total` is
    /// recomputed from the shown cells.
    pub fn scaled(&self, divisor: Decimal, dp: u32) -> Result<Matrix> {
        if divisor <= Decimal::ZERO {
            return Err(DisbursementError::InvalidScale(divisor));
        }

        let mut scaled = self.clone();
        for row in scaled.rows.iter_mut() {
            for cell in row.cells.iter_mut() {
                cell.value = cell
                    .value
                    .checked_div(divisor)
                    .ok_or(DisbursementError::InvalidScale(divisor))?
                    .round_dp(dp);
            }
            row.retotal()?;
        }
        Ok(scaled)
    }

    pub fn rounded(&self, dp: u32) -> Result<Matrix> {
        let mut rounded = self.clone();
        for row in rounded.rows.iter_mut() {
            for cell in row.cells.iter_mut() {
                cell.value = cell.value.round_dp(dp);
            }
            row.retotal()?;
        }
        Ok(rounded)
    }
}

pub struct MatrixBuilder {
    metric: Metric,
    units: Option<Vec<String>>,
    order: RowOrder,
}

impl MatrixBuilder {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            units: None,
            order: RowOrder::Alphabetical,
        }
    }

    /// Rows to emit. Units absent from the series get a row of zeros; series units
    /// not listed here are left out.
    pub fn units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.units = Some(units.into_iter().map(Into::into).collect());
        self
    }

    pub fn order(mut self, order: RowOrder) -> Self {
        self.order = order;
        self
    }

    pub fn build(&self, series: &PeriodSeries) -> Result<Matrix> {
        let periods: Vec<i64> = series.periods().into_iter().collect();

        let mut units: Vec<String> = match &self.units {
            Some(units) => {
                let mut seen = BTreeSet::new();
                units
                    .iter()
                    .filter(|u| seen.insert(u.as_str()))
                    .cloned()
                    .collect()
            }
            None => series.units().into_iter().map(str::to_string).collect(),
        };
        if self.order == RowOrder::Alphabetical {
            units.sort();
        }

        let index: HashMap<(&str, i64), &SeriesPoint> = series
            .points
            .iter()
            .map(|p| ((p.unit.as_str(), p.period), p))
            .collect();

        let rows = units
            .into_iter()
            .map(|unit| -> Result<MatrixRow> {
                let cells = periods
                    .iter()
                    .map(|period| match index.get(&(unit.as_str(), *period)) {
                        None => MatrixCell::empty(CellState::NoDisbursement),
                        Some(point) => match self.cell_value(point) {
                            Some(value) => MatrixCell {
                                value,
                                state: CellState::Observed,
                            },
                            None => MatrixCell::empty(CellState::Undefined),
                        },
                    })
                    .collect();

                let mut row = MatrixRow {
                    percent_defined: !self.metric.is_percentage()
                        || series.denominator(&unit).is_some(),
                    unit,
                    cells,
                    total: Decimal::ZERO,
                };
                row.retotal()?;
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Built {:?} matrix with {} rows and {} period columns",
            self.metric,
            rows.len(),
            periods.len()
        );

        Ok(Matrix {
            metric: self.metric,
            periods,
            rows,
        })
    }

    fn cell_value(&self, point: &SeriesPoint) -> Option<Decimal> {
        match self.metric {
            Metric::Amount => Some(point.amount),
            Metric::CumulativeAmount => Some(point.cumulative_amount),
            Metric::PercentOfCeiling => point.percent_of_ceiling,
            Metric::CumulativePercent => point.cumulative_percent_of_ceiling,
        }
    }
}

pub fn pivot(series: &PeriodSeries, metric: Metric) -> Result<Matrix> {
    MatrixBuilder::new(metric).build(series)
}
