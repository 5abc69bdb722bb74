//! The dedupe batch: companies first, then facilities. Every group decision
//! is written as one audit line to the supplied writer.

use std::collections::HashSet;
use std::io::Write;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SiteMergeConfig;
use crate::error::{ExitCode, Result};
use crate::grouping::{GroupingEngine, ParentAliases, dedupe_first_seen, exact_key_groups, group_companies, reconcile};
use crate::merge::{MergeExecutor, MergeReport, MergeStatus};
use crate::models::{Company, DuplicateGroup, EntityId, EntityKind, Facility, Row};
use crate::proposal::{Mergeable, ProposalBuilder};
use crate::review::{Decision, GroupReview, Reviewer};
use crate::storage::repositories::{
    CompanyRepository, FacilityRepository, Repository, SqliteCompanyRepository, SqliteFacilityRepository,
};
use crate::storage::spatial::SqlDistance;
use crate::storage::{ConnectionPool, SchemaGraph};

#[derive(Debug, Clone)]
pub struct DedupeOptions {
    /// Off means dry run.
    pub apply: bool,
    pub max_distance_m: f64,
    /// 0 = unlimited.
    pub limit_companies: usize,
    /// 0 = unlimited.
    pub limit_facilities: usize,
    pub company_filter: Option<String>,
    pub facility_filter: Option<String>,
    pub proximity_pass: bool,
    pub schema: String,
}

impl DedupeOptions {
    pub fn from_config(config: &SiteMergeConfig) -> Self {
        Self {
            apply: false,
            max_distance_m: config.merge.max_distance_m,
            limit_companies: config.merge.limit_companies,
            limit_facilities: config.merge.limit_facilities,
            company_filter: None,
            facility_filter: None,
            proximity_pass: config.merge.proximity_pass,
            schema: config.database.schema.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub found: usize,
    pub applied: usize,
    pub previewed: usize,
    pub retained: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl KindSummary {
    fn record(&mut self, status: MergeStatus) {
        match status {
            MergeStatus::Applied => self.applied += 1,
            MergeStatus::Previewed => self.previewed += 1,
            MergeStatus::Retained => self.retained += 1,
            MergeStatus::Skipped => self.skipped += 1,
            MergeStatus::Failed => self.failed += 1,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.applied + self.previewed + self.retained
    }

    pub fn attempted(&self) -> usize {
        self.succeeded() + self.failed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub companies: KindSummary,
    pub facilities: KindSummary,
}

impl RunSummary {
    /// Non-zero only when groups were attempted and every one of them failed.
    pub fn exit_code(&self) -> ExitCode {
        let attempted = self.companies.attempted() + self.facilities.attempted();
        let succeeded = self.companies.succeeded() + self.facilities.succeeded();
        if attempted > 0 && succeeded == 0 {
            ExitCode::GeneralError
        } else {
            ExitCode::Success
        }
    }

    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindSummary {
        match kind {
            EntityKind::Company => &mut self.companies,
            EntityKind::Facility => &mut self.facilities,
        }
    }
}

fn limit(mut groups: Vec<DuplicateGroup>, n: usize) -> Vec<DuplicateGroup> {
    if n > 0 {
        groups.truncate(n);
    }
    groups
}

pub struct Driver<'a> {
    pool: &'a ConnectionPool,
    options: DedupeOptions,
    reviewer: &'a mut dyn Reviewer,
    out: &'a mut dyn Write,
    aliases: ParentAliases,
    handled_facilities: HashSet<EntityId>,
    summary: RunSummary,
}

impl<'a> Driver<'a> {
    pub fn new(
        pool: &'a ConnectionPool,
        options: DedupeOptions,
        reviewer: &'a mut dyn Reviewer,
        out: &'a mut dyn Write,
    ) -> Self {
        let summary = RunSummary {
            dry_run: !options.apply,
            ..Default::default()
        };
        Self {
            pool,
            options,
            reviewer,
            out,
            aliases: ParentAliases::new(),
            handled_facilities: HashSet::new(),
            summary,
        }
    }

    pub fn run(mut self) -> Result<RunSummary> {
        info!(dry_run = !self.options.apply, "dedupe run starting");
        self.company_pass()?;
        self.facility_pass()?;

        let s = self.summary.clone();
        for (label, k) in [("companies", s.companies), ("facilities", s.facilities)] {
            writeln!(
                self.out,
                "summary {label}: found={} applied={} previewed={} retained={} skipped={} failed={}",
                k.found, k.applied, k.previewed, k.retained, k.skipped, k.failed
            )?;
        }
        Ok(s)
    }

    // ─── Parent kind ───────────────────────────────────────────

    fn company_pass(&mut self) -> Result<()> {
        let (mut groups, builder) = {
            let conn = self.pool.get_connection();
            let rows = SqliteCompanyRepository::new(&conn, &self.options.schema)
                .list(self.options.company_filter.as_deref())?;
            let graph = SchemaGraph::new(&conn, &self.options.schema);
            (group_companies(&rows), ProposalBuilder::for_entity::<Company>(&graph)?)
        };
        // Largest first; ties go to the group whose first member is newest.
        groups.sort_by(|a, b| b.len().cmp(&a.len()).then(b.first().cmp(&a.first())));
        let groups = limit(groups, self.options.limit_companies);
        self.summary.companies.found += groups.len();
        debug!(groups = groups.len(), "company groups");

        for group in groups {
            let rows = {
                let conn = self.pool.get_connection();
                SqliteCompanyRepository::new(&conn, &self.options.schema).find_by_ids(group.members())?
            };
            let present: Vec<EntityId> = group
                .members()
                .iter()
                .copied()
                .filter(|id| rows.iter().any(|r| r.id == *id))
                .collect();
            let Some(group) = DuplicateGroup::new(group.kind, present, group.strategy) else {
                continue;
            };

            let (report, base_id) = self.process(&group, &rows, &builder)?;
            if !report.status.is_success() {
                continue;
            }
            let canonical = report.target_id.unwrap_or(base_id);
            for &id in group.members() {
                if id != canonical {
                    self.aliases.insert(id, canonical);
                }
            }
            self.dependents_of(canonical, group.members())?;
        }
        Ok(())
    }

    /// Re-group the facilities of a freshly merged parent, with every other
    /// member of the parent group tagged as the canonical parent.
    fn dependents_of(&mut self, canonical: EntityId, parents: &[EntityId]) -> Result<()> {
        let (rows, groups, builder) = {
            let conn = self.pool.get_connection();
            let mut owners = parents.to_vec();
            if !owners.contains(&canonical) {
                owners.push(canonical);
            }
            let mut rows = SqliteFacilityRepository::new(&conn, &self.options.schema).list_by_company_ids(&owners)?;
            let foreign = rows.iter().any(|r| r.record.company_id != Some(canonical));
            self.aliases.apply(&mut rows);

            let oracle = SqlDistance::new(&conn, &self.options.schema);
            let engine = GroupingEngine::new(&oracle, self.options.max_distance_m);
            let mut groups = engine.group_facilities(&rows)?;
            if foreign {
                groups = reconcile(groups, exact_key_groups(&rows));
            }
            let graph = SchemaGraph::new(&conn, &self.options.schema);
            (rows, groups, ProposalBuilder::for_entity::<Facility>(&graph)?)
        };
        debug!(parent = canonical, groups = groups.len(), "per-parent facility groups");
        self.summary.facilities.found += groups.len();
        for group in groups {
            self.handled_facilities.extend(group.members().iter().copied());
            self.process(&group, &rows, &builder)?;
        }
        Ok(())
    }

    // ─── Dependent kind ────────────────────────────────────────

    fn facility_pass(&mut self) -> Result<()> {
        let (rows, groups, builder) = {
            let conn = self.pool.get_connection();
            let mut rows = SqliteFacilityRepository::new(&conn, &self.options.schema)
                .list_active(self.options.facility_filter.as_deref())?;
            self.aliases.apply(&mut rows);

            let oracle = SqlDistance::new(&conn, &self.options.schema);
            let engine = GroupingEngine::new(&oracle, self.options.max_distance_m);
            let mut groups = reconcile(engine.group_facilities(&rows)?, exact_key_groups(&rows));
            if self.options.proximity_pass {
                groups = reconcile(groups, engine.proximity_groups(&rows)?);
            }
            let graph = SchemaGraph::new(&conn, &self.options.schema);
            (rows, groups, ProposalBuilder::for_entity::<Facility>(&graph)?)
        };

        let fresh: Vec<DuplicateGroup> = groups
            .into_iter()
            .filter_map(|g| {
                let free: Vec<EntityId> = g
                    .members()
                    .iter()
                    .copied()
                    .filter(|id| !self.handled_facilities.contains(id))
                    .collect();
                DuplicateGroup::new(g.kind, free, g.strategy)
            })
            .collect();
        let groups = limit(dedupe_first_seen(fresh), self.options.limit_facilities);
        debug!(groups = groups.len(), "global facility groups");
        self.summary.facilities.found += groups.len();

        for group in groups {
            self.process(&group, &rows, &builder)?;
        }
        Ok(())
    }

    // ─── One group ─────────────────────────────────────────────

    /// Propose, review, execute, log. Returns the report and the proposal's base id.
    fn process<E: Mergeable>(
        &mut self,
        group: &DuplicateGroup,
        rows: &[Row<E>],
        builder: &ProposalBuilder,
    ) -> Result<(MergeReport, EntityId)> {
        let head = format!("{} group {:?} strategy={}", group.kind, group.members(), group.strategy);

        let proposal = match builder.propose(group, rows) {
            Ok(p) => p,
            Err(e) => {
                let report = MergeReport::failed(group, e.to_string());
                writeln!(self.out, "{head} {}", report.summary())?;
                self.summary.kind_mut(group.kind).record(report.status);
                return Ok((report, group.first()));
            }
        };

        let review = GroupReview::build(&proposal, rows);
        let (decision, how) = if review.auto_accept {
            (Decision::Accept, "auto")
        } else {
            match self.reviewer.decide(&review) {
                Decision::Accept => (Decision::Accept, "accepted"),
                Decision::Reject => (Decision::Reject, "rejected"),
            }
        };

        let report = match decision {
            Decision::Accept => MergeExecutor::new(self.pool, &self.options.schema, !self.options.apply).execute(&proposal),
            Decision::Reject => MergeReport::skipped(group),
        };

        writeln!(
            self.out,
            "{head} matches=[{}] differences=[{}] decision={how} {}",
            review.match_fields().join(","),
            review.difference_fields().join(","),
            report.summary()
        )?;
        self.summary.kind_mut(group.kind).record(report.status);
        Ok((report, proposal.base_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{AlwaysAccept, AutoOnly, ScriptedReviewer};
    use crate::storage::open_in_memory;

    fn options(apply: bool) -> DedupeOptions {
        DedupeOptions {
            apply,
            ..DedupeOptions::from_config(&SiteMergeConfig::default())
        }
    }

    fn seed(pool: &ConnectionPool) {
        pool.get_connection()
            .execute_batch(
                "
                INSERT INTO company(company_id, name, notes) VALUES
                    (1, 'Acme LLC', 'east gate'),
                    (2, 'ACME, L.L.C.', 'east gate'),
                    (3, 'Beta Grain', NULL);
                INSERT INTO facility(facility_id, company_id, name, address_line1, city, state, postal_code, latitude, longitude) VALUES
                    (10, 1, 'Elevator', '123 C.R. 10', 'Topeka', 'KS', '66601', 39.0500, -95.6800),
                    (11, 2, 'Elevator', '123 County Road 10', 'Topeka', 'KS', '66601', 39.0501, -95.6800),
                    (12, 3, 'Terminal', '9 River Rd', 'Salina', 'KS', '67401', 38.8400, -97.6100),
                    (13, 3, 'Terminal East', '9 river rd', 'Salina', 'KS', '67401', 38.8401, -97.6100),
                    (14, 3, 'Terminal North', '9 River Rd', 'Salina', 'KS', '67401', 38.9500, -97.6100);
                ",
            )
            .unwrap();
    }

    fn count(pool: &ConnectionPool, sql: &str) -> i64 {
        pool.get_connection().query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn end_to_end_apply() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        let mut reviewer = AlwaysAccept;
        let mut out = Vec::new();

        let summary = Driver::new(&pool, options(true), &mut reviewer, &mut out).run().unwrap();
        let log = String::from_utf8(out).unwrap();

        assert_eq!(summary.companies.found, 1);
        assert_eq!(summary.companies.applied, 1);
        assert_eq!(summary.exit_code(), ExitCode::Success);
        assert!(log.contains("company group [1, 2] strategy=normalized-name"), "{log}");
        assert!(log.contains("decision=auto"), "{log}");

        // Company 1's Elevator collided with company 2's, so company 1 is retained;
        // the per-parent pass then merges the two elevators.
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM company"), 3);
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM facility WHERE name = 'Elevator' AND status = 'ACTIVE'"),
            1
        );
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM deactivated_facilities"), 2);

        // 12 and 13 merge; 14 is ~12 km away and stays.
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM facility WHERE company_id = 3 AND status = 'ACTIVE'"),
            2
        );
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM facility WHERE facility_id = 14 AND status = 'ACTIVE'"),
            1
        );
        assert_eq!(summary.facilities.found, 2);
    }

    #[test]
    fn second_apply_reports_the_settled_parent_as_retained() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        let mut reviewer = AlwaysAccept;
        Driver::new(&pool, options(true), &mut reviewer, &mut Vec::new()).run().unwrap();
        let archived = count(&pool, "SELECT COUNT(*) FROM deactivated_facilities");

        let mut out = Vec::new();
        let summary = Driver::new(&pool, options(true), &mut reviewer, &mut out).run().unwrap();
        let log = String::from_utf8(out).unwrap();

        assert_eq!(summary.companies.found, 1);
        assert_eq!(summary.companies.applied, 0);
        assert_eq!(summary.companies.retained, 1);
        assert_eq!(summary.exit_code(), ExitCode::Success);
        assert!(log.contains("action=RETAINED"), "{log}");
        assert!(log.contains("summary companies: found=1 applied=0 previewed=0 retained=1"), "{log}");
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM deactivated_facilities"), archived);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        let mut reviewer = AlwaysAccept;
        let mut out = Vec::new();

        let summary = Driver::new(&pool, options(false), &mut reviewer, &mut out).run().unwrap();
        assert!(summary.dry_run);
        assert!(summary.companies.previewed >= 1);
        assert!(summary.facilities.previewed >= 1);
        assert_eq!(summary.companies.applied + summary.facilities.applied, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM company"), 3);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM facility WHERE status = 'ACTIVE'"), 5);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM deactivated_facilities"), 0);
        assert!(String::from_utf8(out).unwrap().contains("action=PREVIEWED"));
    }

    #[test]
    fn rejected_groups_are_skipped_and_exit_success() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        let mut reviewer = ScriptedReviewer::new([]);
        let mut out = Vec::new();

        let summary = Driver::new(&pool, options(true), &mut reviewer, &mut out).run().unwrap();
        // The company group is auto-accepted; facility groups with coordinate
        // differences go to the reviewer, who declines.
        assert_eq!(summary.companies.applied, 1);
        assert!(summary.facilities.skipped >= 1);
        assert!(!reviewer.asked.is_empty());
        assert_eq!(summary.exit_code(), ExitCode::Success);
    }

    #[test]
    fn all_attempts_failing_exits_non_zero() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        pool.get_connection()
            .execute_batch("DROP TABLE deactivated_companies; DROP TABLE deactivated_facilities;")
            .unwrap();
        let mut reviewer = AlwaysAccept;
        let mut out = Vec::new();

        let summary = Driver::new(&pool, options(true), &mut reviewer, &mut out).run().unwrap();
        assert!(summary.companies.failed + summary.facilities.failed > 0);
        assert_eq!(summary.exit_code(), ExitCode::GeneralError);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM company"), 3);
    }

    #[test]
    fn nothing_to_do_is_success() {
        let pool = open_in_memory().unwrap();
        let mut reviewer = AutoOnly;
        let mut out = Vec::new();
        let summary = Driver::new(&pool, options(true), &mut reviewer, &mut out).run().unwrap();
        assert_eq!(summary.exit_code(), ExitCode::Success);
        assert_eq!(summary.companies.found + summary.facilities.found, 0);
    }

    #[test]
    fn limits_cap_groups_per_kind() {
        let pool = open_in_memory().unwrap();
        seed(&pool);
        let mut reviewer = AlwaysAccept;
        let mut out = Vec::new();
        let opts = DedupeOptions {
            limit_companies: 1,
            limit_facilities: 1,
            company_filter: Some("name LIKE 'Beta%'".to_string()),
            ..options(false)
        };
        let summary = Driver::new(&pool, opts, &mut reviewer, &mut out).run().unwrap();
        assert_eq!(summary.companies.found, 0);
        assert_eq!(summary.facilities.found, 1);
    }
}
