use crate::error::{DisbursementError, Result};
use crate::matrix::Matrix;
use crate::schema::{Category, Metric};
use crate::utils::HUNDRED;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Half-width of the window around 100 that counts as `Completed`.
pub fn default_completion_tolerance() -> Decimal {
    dec!(0.005)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub unit: String,
    /// Sum of the row's period percentages.
    pub total: Decimal,
    pub last_active_period: Option<i64>,
    pub category: Category,
    pub percent_defined: bool,
}

/// Category for a cumulative percentage.
///
/// Totals above the completion window fall through to `FinalDisbursements`.
pub fn categorize(total: Decimal, tolerance: Decimal) -> Category {
    if (total - HUNDRED).abs() <= tolerance {
        Category::Completed
    } else if total >= dec!(50) {
        Category::FinalDisbursements
    } else {
        Category::JustStarted
    }
}

pub struct Classifier {
    tolerance: Decimal,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            tolerance: default_completion_tolerance(),
        }
    }

    pub fn tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Classifies every row of a `PercentOfCeiling` matrix.
    pub fn classify(&self, matrix: &Matrix) -> Result<Vec<Classification>> {
        if self.tolerance < Decimal::ZERO {
            return Err(DisbursementError::InvalidTolerance(self.tolerance));
        }
        if matrix.metric != Metric::PercentOfCeiling {
            return Err(DisbursementError::InvalidConfig(format!(
                "classification needs a PercentOfCeiling matrix, got {:?}",
                matrix.metric
            )));
        }

        Ok(matrix
            .rows
            .iter()
            .map(|row| {
                let last_active_period = matrix
                    .periods
                    .iter()
                    .zip(&row.cells)
                    .filter(|(_, cell)| !cell.value.is_zero())
                    .map(|(period, _)| *period)
                    .max();

                Classification {
                    unit: row.unit.clone(),
                    total: row.total,
                    last_active_period,
                    category: categorize(row.total, self.tolerance),
                    percent_defined: row.percent_defined,
                }
            })
            .collect())
    }
}

pub fn classify(matrix: &Matrix, tolerance: Decimal) -> Result<Vec<Classification>> {
    Classifier::new().tolerance(tolerance).classify(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{CellState, MatrixCell, MatrixRow};

    fn matrix(metric: Metric, rows: Vec<(&str, Vec<Decimal>)>) -> Matrix {
        let width = rows.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        Matrix {
            metric,
            periods: (0..width as i64).collect(),
            rows: rows
                .into_iter()
                .map(|(unit, values)| MatrixRow {
                    unit: unit.to_string(),
                    cells: values
                        .iter()
                        .map(|v| MatrixCell {
                            value: *v,
                            state: CellState::Observed,
                        })
                        .collect(),
                    total: values.iter().copied().sum(),
                    percent_defined: true,
                })
                .collect(),
        }
    }

    #[test]
    fn test_completion_window() {
        let t = default_completion_tolerance();
        assert_eq!(categorize(dec!(100.00000001), t), Category::Completed);
        assert_eq!(categorize(dec!(99.995), t), Category::Completed);
        assert_eq!(categorize(dec!(100.005), t), Category::Completed);
        assert_eq!(categorize(dec!(99.9), t), Category::FinalDisbursements);
        assert_eq!(categorize(dec!(99.9949), t), Category::FinalDisbursements);
        assert_eq!(categorize(dec!(50), t), Category::FinalDisbursements);
        assert_eq!(categorize(dec!(49.99), t), Category::JustStarted);
        assert_eq!(categorize(Decimal::ZERO, t), Category::JustStarted);
    }

    #[test]
    fn test_over_disbursed_units_are_not_completed() {
        assert_eq!(
            categorize(dec!(120), default_completion_tolerance()),
            Category::FinalDisbursements
        );
    }

    #[test]
    fn test_classify_rows() {
        let m = matrix(
            Metric::PercentOfCeiling,
            vec![
                ("AR-1", vec![dec!(30), dec!(30), dec!(40)]),
                ("BO-1", vec![dec!(10), dec!(0), dec!(0)]),
                ("PY-1", vec![dec!(0), dec!(0), dec!(0)]),
            ],
        );

        let result = Classifier::new().classify(&m).unwrap();
        assert_eq!(result[0].category, Category::Completed);
        assert_eq!(result[0].last_active_period, Some(2));
        assert_eq!(result[1].category, Category::JustStarted);
        assert_eq!(result[1].last_active_period, Some(0));
        assert_eq!(result[2].last_active_period, None);
        assert_eq!(result[2].total, Decimal::ZERO);
    }

    #[test]
    fn test_custom_tolerance() {
        let m = matrix(Metric::PercentOfCeiling, vec![("AR-1", vec![dec!(99.5)])]);
        let strict = classify(&m, default_completion_tolerance()).unwrap();
        let loose = classify(&m, dec!(1)).unwrap();
        assert_eq!(strict[0].category, Category::FinalDisbursements);
        assert_eq!(loose[0].category, Category::Completed);
    }

    #[test]
    fn test_rejects_amount_matrix() {
        let m = matrix(Metric::Amount, vec![("AR-1", vec![dec!(1)])]);
        assert!(matches!(
            Classifier::new().classify(&m),
            Err(DisbursementError::InvalidConfig(_))
        ));
    }
}
