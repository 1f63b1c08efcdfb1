//! Elapsed-time bucketing of joined disbursements.
//!
//! A disbursement made `d` days after its stage's effective start lands in year
//! bucket `floor(d / 366)` and month bucket `floor(d / 30)`. Disbursements dated
//! before the effective start get negative buckets by the same formula; nothing is
//! clamped. Use [`retain_since_activation`] to keep only `Period >= 0`.

use crate::join::JoinedRow;
use crate::schema::PeriodGranularity;
use crate::utils::days_between;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const DAYS_PER_YEAR_BUCKET: i64 = 366;
pub const DAYS_PER_MONTH_BUCKET: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i64,
    pub month: i64,
}

impl Period {
    pub fn from_days(days: i64) -> Self {
        Self {
            year: days.div_euclid(DAYS_PER_YEAR_BUCKET),
            month: days.div_euclid(DAYS_PER_MONTH_BUCKET),
        }
    }

    pub fn index(&self, granularity: PeriodGranularity) -> i64 {
        match granularity {
            PeriodGranularity::Year => self.year,
            PeriodGranularity::Month => self.month,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketedRow {
    pub row: JoinedRow,
    pub days_elapsed: i64,
    pub period: Period,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucketing {
    pub rows: Vec<BucketedRow>,
    /// Rows dropped because the disbursement or effective-start date was missing.
    pub excluded: usize,
    /// Rows dated before their stage's effective start.
    pub negative: usize,
}

pub fn bucketize(rows: Vec<JoinedRow>) -> Bucketing {
    let mut bucketing = Bucketing::default();

    for row in rows {
        let (Some(paid), Some(start)) = (row.disbursement_date, row.effective_start) else {
            bucketing.excluded += 1;
            continue;
        };

        let days_elapsed = days_between(paid, start);
        if days_elapsed < 0 {
            bucketing.negative += 1;
        }

        bucketing.rows.push(BucketedRow {
            period: Period::from_days(days_elapsed),
            days_elapsed,
            row,
        });
    }

    if bucketing.negative > 0 {
        warn!(
            "{} disbursements predate their stage's effective start and fall in negative periods",
            bucketing.negative
        );
    }
    debug!(
        "Bucketed {} rows, excluded {} without both dates",
        bucketing.rows.len(),
        bucketing.excluded
    );

    bucketing
}

/// Drops rows dated before their stage's effective start. Returns how many were removed.
pub fn retain_since_activation(rows: &mut Vec<BucketedRow>) -> usize {
    let before = rows.len();
    rows.retain(|r| r.days_elapsed >= 0);
    before - rows.len()
}
