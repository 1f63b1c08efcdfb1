use crate::normalize::resolve_country;
use crate::schema::{Country, DisbursementRecord, GroupingKey, OperationStage, Project};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A disbursement with every stage and project attribute attached.
///
/// Attributes of an unmatched stage or project are `None`; the row itself is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRow {
    pub disbursement_id: String,
    pub stage_id: String,
    pub disbursement_date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    pub country: Country,

    pub stage_matched: bool,
    pub project_id: Option<String>,
    pub effective_start: Option<NaiveDate>,
    pub ceiling: Option<Decimal>,
    pub sector: Option<String>,
    pub sub_sector: Option<String>,
    pub nickname: Option<String>,

    pub project_matched: bool,
    pub priority_area: Option<String>,
    pub intervention_area: Option<String>,
    pub project_country: Option<String>,
    pub project_alias: Option<String>,
}

impl JoinedRow {
    fn new(
        disbursement: &DisbursementRecord,
        stage: Option<&OperationStage>,
        project: Option<&Project>,
    ) -> Self {
        Self {
            disbursement_id: disbursement.disbursement_id.clone(),
            stage_id: disbursement.stage_id.clone(),
            disbursement_date: disbursement.disbursement_date.as_date(),
            amount: disbursement.amount,
            country: resolve_country(&disbursement.stage_id),

            stage_matched: stage.is_some(),
            project_id: stage.and_then(|s| s.project_id.clone()),
            effective_start: stage.and_then(|s| s.effective_start.as_date()),
            ceiling: stage.and_then(|s| s.ceiling),
            sector: stage.and_then(|s| s.sector.clone()),
            sub_sector: stage.and_then(|s| s.sub_sector.clone()),
            nickname: stage.and_then(|s| s.nickname.clone()),

            project_matched: project.is_some(),
            priority_area: project.and_then(|p| p.sector.clone()),
            intervention_area: project.and_then(|p| p.sub_sector.clone()),
            project_country: project.and_then(|p| p.country.clone()),
            project_alias: project.and_then(|p| p.alias.clone()),
        }
    }

    /// The reporting unit this row belongs to, or `None` when the grouping attribute
    /// is missing. Sector falls back to the project's priority area.
    pub fn unit(&self, key: GroupingKey) -> Option<String> {
        match key {
            GroupingKey::Stage => non_blank(Some(&self.stage_id)),
            GroupingKey::Sector => {
                non_blank(self.sector.as_ref()).or_else(|| non_blank(self.priority_area.as_ref()))
            }
            GroupingKey::Country => Some(self.country.to_string()),
            GroupingKey::Project => non_blank(self.project_id.as_ref()),
        }
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

fn stage_unit(stage: &OperationStage, project: Option<&Project>, key: GroupingKey) -> Option<String> {
    match key {
        GroupingKey::Stage => non_blank(Some(&stage.stage_id)),
        GroupingKey::Sector => non_blank(stage.sector.as_ref())
            .or_else(|| non_blank(project.and_then(|p| p.sector.as_ref()))),
        GroupingKey::Country => Some(resolve_country(&stage.stage_id).to_string()),
        GroupingKey::Project => non_blank(stage.project_id.as_ref()),
    }
}

/// A row of every matrix: one per unit the stage table implies, disbursed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingUnit {
    pub id: String,
    /// Display label; `"IDEtapa (Alias)"` for stage units with a known project alias.
    pub label: String,
    /// Stage ceiling, or the sum over distinct member stages. `None` if any member
    /// stage has no ceiling.
    pub ceiling: Option<Decimal>,
    pub stage_ids: Vec<String>,
}

/// Lists the reporting units implied by `stages`, sorted by id.
///
/// A stage id that appears more than once contributes its first ceiling only.
pub fn reporting_units(
    projects: &[Project],
    stages: &[OperationStage],
    key: GroupingKey,
) -> Vec<ReportingUnit> {
    let project_index = index_projects(projects);
    let mut units: BTreeMap<String, ReportingUnit> = BTreeMap::new();

    for stage in stages {
        let project = stage
            .project_id
            .as_deref()
            .and_then(|id| project_index.get(id))
            .and_then(|found| found.first().copied());

        let Some(id) = stage_unit(stage, project, key) else {
            continue;
        };

        let unit = units.entry(id.clone()).or_insert_with(|| ReportingUnit {
            label: match (key, project.and_then(|p| p.alias.as_deref())) {
                (GroupingKey::Stage, Some(alias)) if !alias.trim().is_empty() => {
                    format!("{} ({})", id, alias.trim())
                }
                _ => id.clone(),
            },
            id,
            ceiling: Some(Decimal::ZERO),
            stage_ids: Vec::new(),
        });

        if unit.stage_ids.contains(&stage.stage_id) {
            continue;
        }
        unit.stage_ids.push(stage.stage_id.clone());
        unit.ceiling = match (unit.ceiling, stage.ceiling) {
            (Some(sum), Some(ceiling)) => sum.checked_add(ceiling),
            _ => None,
        };
    }

    debug!("Stage table implies {} reporting units for {:?}", units.len(), key);
    units.into_values().collect()
}

pub(crate) fn index_projects(projects: &[Project]) -> HashMap<&str, Vec<&Project>> {
    let mut index: HashMap<&str, Vec<&Project>> = HashMap::new();
    for project in projects {
        index.entry(project.project_id.as_str()).or_default().push(project);
    }
    index
}

pub(crate) fn index_stages(stages: &[OperationStage]) -> HashMap<&str, Vec<&OperationStage>> {
    let mut index: HashMap<&str, Vec<&OperationStage>> = HashMap::new();
    for stage in stages {
        index.entry(stage.stage_id.as_str()).or_default().push(stage);
    }
    index
}

/// Disbursement ⟕ OperationStage ⟕ Project.
///
/// Duplicate keys fan out: a disbursement whose stage id appears twice produces two
/// rows. Output order follows the disbursement input order.
pub fn join(
    projects: &[Project],
    stages: &[OperationStage],
    disbursements: &[DisbursementRecord],
) -> Vec<JoinedRow> {
    let stage_index = index_stages(stages);
    let project_index = index_projects(projects);

    let mut rows = Vec::with_capacity(disbursements.len());
    let mut unmatched_stages = 0usize;

    for disbursement in disbursements {
        let matches = stage_index.get(disbursement.stage_id.as_str());
        let Some(matches) = matches else {
            unmatched_stages += 1;
            rows.push(JoinedRow::new(disbursement, None, None));
            continue;
        };

        for stage in matches {
            let project_matches = stage
                .project_id
                .as_deref()
                .and_then(|id| project_index.get(id));

            match project_matches {
                Some(found) => {
                    for project in found {
                        rows.push(JoinedRow::new(disbursement, Some(*stage), Some(*project)));
                    }
                }
                None => rows.push(JoinedRow::new(disbursement, Some(*stage), None)),
            }
        }
    }

    debug!(
        "Joined {} disbursements into {} rows ({} without a matching stage)",
        disbursements.len(),
        rows.len(),
        unmatched_stages
    );

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NormalizedDate;
    use rust_decimal_macros::dec;

    fn project(id: &str, alias: &str) -> Project {
        Project {
            project_id: id.to_string(),
            sector: Some("INF".to_string()),
            sub_sector: None,
            country: None,
            alias: Some(alias.to_string()),
        }
    }

    fn stage(id: &str, project_id: Option<&str>, ceiling: Decimal) -> OperationStage {
        OperationStage {
            stage_id: id.to_string(),
            project_id: project_id.map(str::to_string),
            effective_start: NormalizedDate::Parsed(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
            ceiling: Some(ceiling),
            sector: Some("Transporte".to_string()),
            sub_sector: None,
            nickname: None,
        }
    }

    fn disbursement(id: &str, stage_id: &str) -> DisbursementRecord {
        DisbursementRecord {
            disbursement_id: id.to_string(),
            stage_id: stage_id.to_string(),
            disbursement_date: NormalizedDate::Parsed(
                NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
            ),
            amount: Some(dec!(10)),
        }
    }

    #[test]
    fn test_full_match_carries_all_attributes() {
        let rows = join(
            &[project("P1", "Ruta 1")],
            &[stage("PY-1", Some("P1"), dec!(100))],
            &[disbursement("D1", "PY-1")],
        );

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.stage_matched && row.project_matched);
        assert_eq!(row.ceiling, Some(dec!(100)));
        assert_eq!(row.project_alias.as_deref(), Some("Ruta 1"));
        assert_eq!(row.country, Country::Paraguay);
    }

    #[test]
    fn test_left_join_keeps_unmatched_disbursements() {
        let rows = join(
            &[],
            &[stage("AR-1", Some("P404"), dec!(100))],
            &[disbursement("D1", "AR-1"), disbursement("D2", "XX-9")],
        );

        assert_eq!(rows.len(), 2);
        assert!(rows[0].stage_matched);
        assert!(!rows[0].project_matched);
        assert_eq!(rows[0].project_alias, None);

        assert!(!rows[1].stage_matched);
        assert_eq!(rows[1].ceiling, None);
        assert_eq!(rows[1].effective_start, None);
        assert_eq!(rows[1].country, Country::Unknown);
    }

    #[test]
    fn test_duplicate_stage_ids_fan_out() {
        let rows = join(
            &[project("P1", "A"), project("P2", "B")],
            &[
                stage("BO-1", Some("P1"), dec!(100)),
                stage("BO-1", Some("P2"), dec!(200)),
            ],
            &[disbursement("D1", "BO-1")],
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ceiling, Some(dec!(100)));
        assert_eq!(rows[1].ceiling, Some(dec!(200)));
        assert!(rows.iter().all(|r| r.disbursement_id == "D1"));
    }

    #[test]
    fn test_duplicate_project_ids_fan_out() {
        let rows = join(
            &[project("P1", "A"), project("P1", "B")],
            &[stage("UR-1", Some("P1"), dec!(100))],
            &[disbursement("D1", "UR-1")],
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_row_unit_keys() {
        let rows = join(
            &[project("P1", "Ruta 1")],
            &[stage("PY-1", Some("P1"), dec!(100))],
            &[disbursement("D1", "PY-1"), disbursement("D2", "ZZ-1")],
        );

        assert_eq!(rows[0].unit(GroupingKey::Stage).as_deref(), Some("PY-1"));
        assert_eq!(rows[0].unit(GroupingKey::Sector).as_deref(), Some("Transporte"));
        assert_eq!(rows[0].unit(GroupingKey::Country).as_deref(), Some("Paraguay"));
        assert_eq!(rows[0].unit(GroupingKey::Project).as_deref(), Some("P1"));

        assert_eq!(rows[1].unit(GroupingKey::Sector), None);
        assert_eq!(rows[1].unit(GroupingKey::Project), None);
        assert_eq!(rows[1].unit(GroupingKey::Country).as_deref(), Some("Unknown"));
    }

    #[test]
    fn test_sector_falls_back_to_priority_area() {
        let mut s = stage("AR-1", Some("P1"), dec!(100));
        s.sector = None;
        let rows = join(&[project("P1", "A")], &[s], &[disbursement("D1", "AR-1")]);
        assert_eq!(rows[0].unit(GroupingKey::Sector).as_deref(), Some("INF"));
    }

    #[test]
    fn test_reporting_units_include_undisbursed_stages() {
        let units = reporting_units(
            &[project("P1", "Ruta 1")],
            &[
                stage("PY-2", None, dec!(50)),
                stage("PY-1", Some("P1"), dec!(100)),
            ],
            GroupingKey::Stage,
        );

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "PY-1");
        assert_eq!(units[0].label, "PY-1 (Ruta 1)");
        assert_eq!(units[1].label, "PY-2");
        assert_eq!(units[1].ceiling, Some(dec!(50)));
    }

    #[test]
    fn test_grouped_ceiling_sums_distinct_stages() {
        let stages = [
            stage("AR-1", None, dec!(100)),
            stage("AR-1", None, dec!(999)),
            stage("AR-2", None, dec!(50)),
        ];
        let units = reporting_units(&[], &stages, GroupingKey::Country);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "Argentina");
        assert_eq!(units[0].ceiling, Some(dec!(150)));
        assert_eq!(units[0].stage_ids, vec!["AR-1", "AR-2"]);
    }

    #[test]
    fn test_grouped_ceiling_is_undefined_when_a_member_lacks_one() {
        let mut missing = stage("BO-2", None, dec!(0));
        missing.ceiling = None;
        let units = reporting_units(
            &[],
            &[stage("BO-1", None, dec!(100)), missing],
            GroupingKey::Sector,
        );
        assert_eq!(units[0].id, "Transporte");
        assert_eq!(units[0].ceiling, None);
    }
}
