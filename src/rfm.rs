use crate::classify::{categorize, default_completion_tolerance};
use crate::error::{DisbursementError, Result};
use crate::join::index_stages;
use crate::normalize::resolve_country;
use crate::schema::{Category, Country, DisbursementRecord, OperationStage, Segment, StageStatus};
use crate::utils::{checked_sum, days_between, percent_of};
use chrono::NaiveDate;
use log::{debug, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 25th, 50th and 75th percentiles, linearly interpolated between the closest ranks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quartiles {
    pub q1: Decimal,
    pub median: Decimal,
    pub q3: Decimal,
}

impl Quartiles {
    /// `None` for an empty slice.
    pub fn of(values: &[Decimal]) -> Option<Self> {
        let mut sorted = values.to_vec();
        sorted.sort();
        Some(Self {
            q1: quantile(&sorted, dec!(0.25))?,
            median: quantile(&sorted, dec!(0.5))?,
            q3: quantile(&sorted, dec!(0.75))?,
        })
    }

    /// 1 at or below `q1`, 2 up to the median, 3 up to `q3`, 4 above.
    pub fn bucket(&self, value: Decimal) -> u8 {
        if value <= self.q1 {
            1
        } else if value <= self.median {
            2
        } else if value <= self.q3 {
            3
        } else {
            4
        }
    }
}

fn quantile(sorted: &[Decimal], q: Decimal) -> Option<Decimal> {
    let last = sorted.len().checked_sub(1)?;
    let position = Decimal::from(last).checked_mul(q)?;
    let lower = position.floor();
    let index = lower.to_usize()?;

    let low = *sorted.get(index)?;
    let high = *sorted.get((index + 1).min(last))?;
    let step = high.checked_sub(low)?.checked_mul(position - lower)?;
    low.checked_add(step)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RfmQuartiles {
    /// Over the stages that have a dated disbursement.
    pub recency: Option<Quartiles>,
    pub frequency: Option<Quartiles>,
    pub monetary: Option<Quartiles>,
}

/// Scores run from 1 (most recent, most frequent, largest) to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfmScores {
    pub recency: u8,
    pub frequency: u8,
    pub monetary: u8,
}

impl RfmScores {
    /// At Risk and Can't Lose Them are never assigned. Both need `frequency <= 2`,
    /// which Champions and Loyal Customers claim first.
    pub fn segment(&self) -> Segment {
        let (r, f, m) = (self.recency, self.frequency, self.monetary);
        if r <= 2 && f <= 2 {
            Segment::Champions
        } else if f <= 2 {
            Segment::LoyalCustomers
        } else if r <= 2 && m > 2 {
            Segment::PotentialLoyalist
        } else if r <= 2 {
            Segment::NewCustomers
        } else {
            Segment::Hibernating
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRecord {
    pub stage_id: String,
    pub country: Country,
    pub sector: Option<String>,
    pub last_disbursement: Option<NaiveDate>,
    /// Days from the last dated disbursement to the analysis date.
    pub recency_days: Option<i64>,
    pub frequency: usize,
    pub monetary: Decimal,
    pub ceiling: Option<Decimal>,
    /// `monetary` as a percentage of `ceiling`.
    pub disbursed_percent: Option<Decimal>,
    pub status: StageStatus,
    pub scores: RfmScores,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmAnalysis {
    pub as_of: NaiveDate,
    pub quartiles: RfmQuartiles,
    /// One record per disbursed stage, ordered by stage id.
    pub records: Vec<RfmRecord>,
}

impl RfmAnalysis {
    pub fn record(&self, stage_id: &str) -> Option<&RfmRecord> {
        self.records.iter().find(|r| r.stage_id == stage_id)
    }

    pub fn with_status(&self, status: StageStatus) -> Vec<&RfmRecord> {
        self.records.iter().filter(|r| r.status == status).collect()
    }

    pub fn in_country(&self, country: Country) -> Vec<&RfmRecord> {
        self.records.iter().filter(|r| r.country == country).collect()
    }

    pub fn in_sector(&self, sector: &str) -> Vec<&RfmRecord> {
        self.records
            .iter()
            .filter(|r| r.sector.as_deref() == Some(sector))
            .collect()
    }

    pub fn segment_stats(&self) -> BTreeMap<Segment, SegmentStats> {
        segment_stats(&self.records)
    }
}

#[derive(Default)]
struct StageTally {
    last: Option<NaiveDate>,
    count: usize,
    monetary: Decimal,
}

pub struct RfmAnalyzer {
    as_of: NaiveDate,
    tolerance: Decimal,
}

impl RfmAnalyzer {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            tolerance: default_completion_tolerance(),
        }
    }

    /// Completion window used for `StageStatus::Finished`.
    pub fn tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn analyze(
        &self,
        stages: &[OperationStage],
        disbursements: &[DisbursementRecord],
    ) -> Result<RfmAnalysis> {
        if self.tolerance < Decimal::ZERO {
            return Err(DisbursementError::InvalidTolerance(self.tolerance));
        }

        let mut tallies: BTreeMap<&str, StageTally> = BTreeMap::new();
        let mut without_stage = 0usize;
        for disbursement in disbursements {
            let stage_id = disbursement.stage_id.as_str();
            if stage_id.is_empty() {
                without_stage += 1;
                continue;
            }
            let tally = tallies.entry(stage_id).or_default();
            tally.count += 1;
            if let Some(date) = disbursement.disbursement_date.as_date() {
                tally.last = tally.last.max(Some(date));
            }
            if let Some(amount) = disbursement.amount {
                tally.monetary = tally
                    .monetary
                    .checked_add(amount)
                    .ok_or_else(|| DisbursementError::overflow(stage_id))?;
            }
        }

        if without_stage > 0 {
            debug!("Skipped {} disbursements without a stage id", without_stage);
        }

        let undated = tallies.values().filter(|t| t.last.is_none()).count();
        if undated > 0 {
            warn!(
                "{} stages have no dated disbursement and get recency score 4",
                undated
            );
        }

        let recencies: Vec<Decimal> = tallies
            .values()
            .filter_map(|t| t.last)
            .map(|last| Decimal::from(days_between(self.as_of, last)))
            .collect();
        let frequencies: Vec<Decimal> = tallies.values().map(|t| Decimal::from(t.count)).collect();
        let amounts: Vec<Decimal> = tallies.values().map(|t| t.monetary).collect();

        let quartiles = RfmQuartiles {
            recency: Quartiles::of(&recencies),
            frequency: Quartiles::of(&frequencies),
            monetary: Quartiles::of(&amounts),
        };
        debug!("RFM quartiles as of {}: {:?}", self.as_of, quartiles);

        let stage_index = index_stages(stages);
        let records: Vec<RfmRecord> = tallies
            .into_iter()
            .map(|(stage_id, tally)| {
                let stage = stage_index.get(stage_id).and_then(|s| s.first());
                let ceiling = stage.and_then(|s| s.ceiling);
                let disbursed_percent = ceiling.and_then(|c| percent_of(tally.monetary, c));
                let status = match disbursed_percent {
                    Some(percent) if categorize(percent, self.tolerance) == Category::Completed => {
                        StageStatus::Finished
                    }
                    _ => StageStatus::Active,
                };

                let recency_days = tally.last.map(|last| days_between(self.as_of, last));
                let scores = RfmScores {
                    recency: match (recency_days, quartiles.recency) {
                        (Some(days), Some(q)) => q.bucket(Decimal::from(days)),
                        _ => 4,
                    },
                    frequency: quartiles
                        .frequency
                        .map_or(1, |q| 5 - q.bucket(Decimal::from(tally.count))),
                    monetary: quartiles
                        .monetary
                        .map_or(1, |q| 5 - q.bucket(tally.monetary)),
                };

                RfmRecord {
                    stage_id: stage_id.to_string(),
                    country: resolve_country(stage_id),
                    sector: stage.and_then(|s| s.sector.clone()),
                    last_disbursement: tally.last,
                    recency_days,
                    frequency: tally.count,
                    monetary: tally.monetary,
                    ceiling,
                    disbursed_percent,
                    status,
                    segment: scores.segment(),
                    scores,
                }
            })
            .collect();

        info!(
            "RFM analysis as of {}: {} stages, {} finished",
            self.as_of,
            records.len(),
            records
                .iter()
                .filter(|r| r.status == StageStatus::Finished)
                .count()
        );

        Ok(RfmAnalysis {
            as_of: self.as_of,
            quartiles,
            records,
        })
    }
}

pub fn rfm_analysis(
    stages: &[OperationStage],
    disbursements: &[DisbursementRecord],
    as_of: NaiveDate,
    tolerance: Decimal,
) -> Result<RfmAnalysis> {
    RfmAnalyzer::new(as_of)
        .tolerance(tolerance)
        .analyze(stages, disbursements)
}

/// Per-segment counts and means, rounded to whole numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub count: usize,
    /// Over members with a dated disbursement.
    pub mean_recency: Option<Decimal>,
    pub mean_frequency: Option<Decimal>,
    pub mean_monetary: Option<Decimal>,
}

fn rounded_mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    checked_sum(values.iter().copied())?
        .checked_div(Decimal::from(values.len()))
        .map(|m| m.round_dp(0))
}

/// Every segment is present, empty ones with a zero count and no means.
pub fn segment_stats(records: &[RfmRecord]) -> BTreeMap<Segment, SegmentStats> {
    Segment::ALL
        .into_iter()
        .map(|segment| {
            let members: Vec<&RfmRecord> =
                records.iter().filter(|r| r.segment == segment).collect();
            let recency: Vec<Decimal> = members
                .iter()
                .filter_map(|r| r.recency_days)
                .map(Decimal::from)
                .collect();
            let frequency: Vec<Decimal> =
                members.iter().map(|r| Decimal::from(r.frequency)).collect();
            let monetary: Vec<Decimal> = members.iter().map(|r| r.monetary).collect();

            let stats = SegmentStats {
                count: members.len(),
                mean_recency: rounded_mean(&recency),
                mean_frequency: rounded_mean(&frequency),
                mean_monetary: rounded_mean(&monetary),
            };
            (segment, stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NormalizedDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn stage(id: &str, ceiling: Option<Decimal>, sector: &str) -> OperationStage {
        OperationStage {
            stage_id: id.to_string(),
            project_id: None,
            effective_start: NormalizedDate::Missing,
            ceiling,
            sector: Some(sector.to_string()),
            sub_sector: None,
            nickname: None,
        }
    }

    fn paid(stage_id: &str, on: Option<NaiveDate>, amount: Decimal) -> DisbursementRecord {
        DisbursementRecord {
            disbursement_id: "D".to_string(),
            stage_id: stage_id.to_string(),
            disbursement_date: on.map_or(NormalizedDate::Missing, NormalizedDate::Parsed),
            amount: Some(amount),
        }
    }

    fn scores(recency: u8, frequency: u8, monetary: u8) -> RfmScores {
        RfmScores {
            recency,
            frequency,
            monetary,
        }
    }

    #[test]
    fn test_quartiles_interpolate_between_ranks() {
        let q = Quartiles::of(&[dec!(4), dec!(1), dec!(3), dec!(2)]).unwrap();
        assert_eq!(q.q1, dec!(1.75));
        assert_eq!(q.median, dec!(2.5));
        assert_eq!(q.q3, dec!(3.25));

        let q = Quartiles::of(&[dec!(10), dec!(20), dec!(30), dec!(40), dec!(50)]).unwrap();
        assert_eq!((q.q1, q.median, q.q3), (dec!(20), dec!(30), dec!(40)));

        let single = Quartiles::of(&[dec!(7)]).unwrap();
        assert_eq!((single.q1, single.median, single.q3), (dec!(7), dec!(7), dec!(7)));
        assert_eq!(Quartiles::of(&[]), None);
    }

    #[test]
    fn test_bucket_boundaries_are_inclusive() {
        let q = Quartiles::of(&[dec!(10), dec!(20), dec!(30), dec!(40), dec!(50)]).unwrap();
        assert_eq!(q.bucket(dec!(10)), 1);
        assert_eq!(q.bucket(dec!(20)), 1);
        assert_eq!(q.bucket(dec!(20.01)), 2);
        assert_eq!(q.bucket(dec!(30)), 2);
        assert_eq!(q.bucket(dec!(40)), 3);
        assert_eq!(q.bucket(dec!(40.01)), 4);
    }

    #[test]
    fn test_segment_assignment_order() {
        assert_eq!(scores(1, 1, 4).segment(), Segment::Champions);
        assert_eq!(scores(2, 2, 4).segment(), Segment::Champions);
        assert_eq!(scores(3, 2, 1).segment(), Segment::LoyalCustomers);
        assert_eq!(scores(2, 3, 3).segment(), Segment::PotentialLoyalist);
        assert_eq!(scores(1, 4, 2).segment(), Segment::NewCustomers);
        assert_eq!(scores(3, 3, 1).segment(), Segment::Hibernating);
        assert_eq!(scores(4, 4, 4).segment(), Segment::Hibernating);

        // Low-frequency stale stages are claimed by Loyal Customers first.
        assert_eq!(scores(3, 1, 1).segment(), Segment::LoyalCustomers);
        assert_eq!(scores(4, 2, 2).segment(), Segment::LoyalCustomers);
    }

    fn portfolio() -> (Vec<OperationStage>, Vec<DisbursementRecord>) {
        let stages = vec![
            stage("AR-1", Some(dec!(100)), "Transporte"),
            stage("BO-1", Some(dec!(1000)), "Social"),
            stage("PY-1", Some(dec!(500)), "Energia"),
            stage("UR-1", None, "Transporte"),
        ];
        let disbursements = vec![
            paid("AR-1", Some(date(2023, 1, 10)), dec!(40)),
            paid("AR-1", Some(date(2023, 11, 20)), dec!(30)),
            paid("AR-1", Some(date(2023, 12, 1)), dec!(30)),
            paid("BO-1", Some(date(2022, 6, 1)), dec!(100)),
            paid("BO-1", Some(date(2023, 6, 1)), dec!(100)),
            paid("PY-1", Some(date(2020, 1, 1)), dec!(500)),
            paid("UR-1", None, dec!(5)),
        ];
        (stages, disbursements)
    }

    #[test]
    fn test_recency_frequency_monetary_per_stage() {
        let (stages, disbursements) = portfolio();
        let analysis = rfm_analysis(
            &stages,
            &disbursements,
            date(2024, 1, 1),
            default_completion_tolerance(),
        )
        .unwrap();

        assert_eq!(
            analysis
                .records
                .iter()
                .map(|r| r.stage_id.as_str())
                .collect::<Vec<_>>(),
            vec!["AR-1", "BO-1", "PY-1", "UR-1"]
        );

        let ar1 = analysis.record("AR-1").unwrap();
        assert_eq!(ar1.recency_days, Some(31));
        assert_eq!(ar1.frequency, 3);
        assert_eq!(ar1.monetary, dec!(100));
        assert_eq!(ar1.country, Country::Argentina);
        assert_eq!(ar1.disbursed_percent, Some(dec!(100)));
        assert_eq!(ar1.status, StageStatus::Finished);
        assert_eq!(ar1.scores, scores(1, 1, 3));
        assert_eq!(ar1.segment, Segment::Champions);

        let bo1 = analysis.record("BO-1").unwrap();
        assert_eq!(bo1.recency_days, Some(214));
        assert_eq!(bo1.disbursed_percent, Some(dec!(20)));
        assert_eq!(bo1.status, StageStatus::Active);
        assert_eq!(bo1.scores, scores(2, 2, 2));
        assert_eq!(bo1.segment, Segment::Champions);

        let py1 = analysis.record("PY-1").unwrap();
        assert_eq!(py1.scores, scores(4, 4, 1));
        assert_eq!(py1.segment, Segment::Hibernating);
        assert_eq!(py1.status, StageStatus::Finished);

        // No dated disbursement and no ceiling.
        let ur1 = analysis.record("UR-1").unwrap();
        assert_eq!(ur1.recency_days, None);
        assert_eq!(ur1.scores.recency, 4);
        assert_eq!(ur1.disbursed_percent, None);
        assert_eq!(ur1.status, StageStatus::Active);
        assert_eq!(ur1.segment, Segment::Hibernating);
    }

    #[test]
    fn test_finished_uses_the_completion_window() {
        let stages = vec![stage("AR-1", Some(dec!(1000000)), "Transporte")];
        let disbursements = vec![paid("AR-1", Some(date(2023, 1, 1)), dec!(999960))];

        let loose = rfm_analysis(&stages, &disbursements, date(2024, 1, 1), dec!(0.005)).unwrap();
        assert_eq!(loose.records[0].disbursed_percent, Some(dec!(99.996)));
        assert_eq!(loose.records[0].status, StageStatus::Finished);

        let exact = rfm_analysis(&stages, &disbursements, date(2024, 1, 1), Decimal::ZERO).unwrap();
        assert_eq!(exact.records[0].status, StageStatus::Active);

        assert!(matches!(
            rfm_analysis(&stages, &disbursements, date(2024, 1, 1), dec!(-1)),
            Err(DisbursementError::InvalidTolerance(_))
        ));
    }

    #[test]
    fn test_filters_and_segment_stats() {
        let (stages, disbursements) = portfolio();
        let analysis = RfmAnalyzer::new(date(2024, 1, 1))
            .analyze(&stages, &disbursements)
            .unwrap();

        assert_eq!(analysis.with_status(StageStatus::Finished).len(), 2);
        assert_eq!(analysis.in_country(Country::Bolivia).len(), 1);
        assert_eq!(analysis.in_sector("Transporte").len(), 2);

        let stats = analysis.segment_stats();
        assert_eq!(stats.len(), Segment::ALL.len());

        let champions = &stats[&Segment::Champions];
        assert_eq!(champions.count, 2);
        assert_eq!(champions.mean_recency, Some(dec!(122)));
        assert_eq!(champions.mean_frequency, Some(dec!(2)));
        assert_eq!(champions.mean_monetary, Some(dec!(150)));

        let hibernating = &stats[&Segment::Hibernating];
        assert_eq!(hibernating.count, 2);
        assert_eq!(hibernating.mean_recency, Some(dec!(1461)));

        let at_risk = &stats[&Segment::AtRisk];
        assert_eq!(at_risk.count, 0);
        assert_eq!(at_risk.mean_monetary, None);
    }

    #[test]
    fn test_no_disbursements() {
        let analysis = rfm_analysis(&[], &[], date(2024, 1, 1), dec!(0.005)).unwrap();
        assert!(analysis.records.is_empty());
        assert_eq!(analysis.quartiles.monetary, None);
        assert!(segment_stats(&analysis.records)
            .values()
            .all(|s| s.count == 0));
    }

    #[test]
    fn test_blank_stage_ids_are_skipped() {
        let disbursements = vec![
            paid("", Some(date(2023, 1, 1)), dec!(10)),
            paid("AR-1", Some(date(2023, 1, 1)), dec!(10)),
        ];
        let analysis = rfm_analysis(&[], &disbursements, date(2024, 1, 1), dec!(0.005)).unwrap();
        assert_eq!(analysis.records.len(), 1);
        assert_eq!(analysis.records[0].stage_id, "AR-1");
    }

    #[test]
    fn test_monetary_overflow_is_an_error() {
        let disbursements = vec![
            paid("AR-1", Some(date(2023, 1, 1)), Decimal::MAX),
            paid("AR-1", Some(date(2023, 2, 1)), Decimal::MAX),
        ];
        let err = rfm_analysis(&[], &disbursements, date(2024, 1, 1), dec!(0.005)).unwrap_err();
        assert!(matches!(
            err,
            DisbursementError::AmountOverflow { ref unit } if unit == "AR-1"
        ));
    }
}
