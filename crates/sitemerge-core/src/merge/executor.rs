use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::report::{ExcludedConflict, MergeReport, MergeStatus, RepointCount};
use crate::error::{Result, SiteMergeError};
use crate::models::{Entity, EntityId, MERGE_REASON, MergeProposal, STATUS_INACTIVE};
use crate::storage::database::check_connection;
use crate::storage::repositories::{ArchiveRepository, EntityStore, SqliteArchiveRepository};
use crate::storage::{ConnectionPool, SchemaGraph};

/// Runs one group per transaction: resolve target, insert or update it, move
/// dependents, archive and retire the losers, commit. In dry-run mode the same
/// reads happen and nothing is written.
pub struct MergeExecutor<'a> {
    pool: &'a ConnectionPool,
    schema: String,
    dry_run: bool,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(pool: &'a ConnectionPool, schema: &str, dry_run: bool) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Never returns an error: a failing group is rolled back, the connection
    /// is checked, and the report says `Failed`.
    pub fn execute<E: Entity>(&self, proposal: &MergeProposal<E>) -> MergeReport {
        let mut conn = self.pool.get_connection();
        match self.run(&mut conn, proposal) {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    kind = %E::KIND,
                    members = ?proposal.group.members(),
                    error = %e,
                    "merge rolled back"
                );
                if let Err(health) = check_connection(&conn) {
                    warn!(error = %health, "connection health check failed after rollback");
                } else {
                    debug!("connection healthy after rollback");
                }
                MergeReport::failed(&proposal.group, e.to_string())
            }
        }
    }

    fn run<E: Entity>(&self, conn: &mut Connection, proposal: &MergeProposal<E>) -> Result<MergeReport> {
        let tx = conn.transaction()?;
        let report = self.merge_in(&tx, proposal)?;
        if self.dry_run || report.status == MergeStatus::Retained {
            tx.rollback()?;
        } else {
            tx.commit()?;
            info!(
                kind = %E::KIND,
                members = ?proposal.group.members(),
                target = ?report.target_id,
                "merge committed"
            );
        }
        Ok(report)
    }

    fn merge_in<E: Entity>(&self, conn: &Connection, proposal: &MergeProposal<E>) -> Result<MergeReport> {
        let kind = E::KIND;
        let group = &proposal.group;
        let graph = SchemaGraph::new(conn, &self.schema);
        let store = EntityStore::new(conn, &self.schema);
        let archives = SqliteArchiveRepository::new(conn, &self.schema);

        if !graph.table_exists(kind.archive_table())? {
            return Err(SiteMergeError::MissingArchiveTable(kind.archive_table().to_string()));
        }

        let status = if self.dry_run {
            MergeStatus::Previewed
        } else {
            MergeStatus::Applied
        };
        let mut report = MergeReport::new(group, status);

        // 1. Discover
        let refs = graph.references_to(kind.table())?;
        debug!(table = kind.table(), references = refs.len(), "discovered dependents");
        let soft_delete = graph.has_column(kind.table(), "status")?;

        // 2-3. Resolve target, then insert or update it
        let existing = store.find_by_natural_key(&proposal.record, group.members())?;
        let target_current = match existing {
            Some(id) => store.matches_attributes(id, &proposal.record)?,
            None => false,
        };
        let target = match existing {
            Some(id) => {
                if !group.members().contains(&id) && store.is_inactive(kind, id)? {
                    warn!(%kind, id, "natural key matches a retired row; it becomes the target and is reactivated");
                    report.revived = Some(id);
                }
                if !self.dry_run {
                    store.update_attributes(id, &proposal.record)?;
                }
                Some(id)
            }
            None if self.dry_run => None,
            None => Some(store.insert(&proposal.record)?),
        };
        report.target_id = target;
        report.created = existing.is_none();

        let losers: Vec<EntityId> = group
            .members()
            .iter()
            .copied()
            .filter(|id| Some(*id) != existing)
            .collect();

        // 4. Conflict-aware repoint
        let mut left_behind: BTreeMap<EntityId, usize> = BTreeMap::new();
        for r in &refs {
            let dependents = graph.count_dependents(r, &losers)?;
            let conflicts = graph.find_repoint_conflicts(r, &losers, target)?;
            for c in &conflicts {
                warn!(
                    reference = %r,
                    rowid = c.rowid,
                    from = c.from_id,
                    target = ?target,
                    "dependent row would duplicate a unique key on the target; left in place"
                );
                *left_behind.entry(c.from_id).or_default() += 1;
                report.excluded.push(ExcludedConflict {
                    reference: r.to_string(),
                    rowid: c.rowid,
                    from_id: c.from_id,
                });
            }

            let moved = match target {
                Some(t) if !self.dry_run => {
                    let excluded: Vec<i64> = conflicts.iter().map(|c| c.rowid).collect();
                    graph.repoint_dependents(r, &losers, t, &excluded)?
                }
                _ => dependents - conflicts.len(),
            };
            if dependents > 0 {
                debug!(reference = %r, dependents, moved, "repointed");
            }
            report.repointed.push(RepointCount {
                reference: r.to_string(),
                dependents,
                moved,
            });
        }

        // 5. Archive, then retire each loser
        let detail = format!(
            "{} group {:?} ({}) merged into {}",
            kind,
            group.members(),
            group.strategy,
            target.map_or_else(|| "new record".to_string(), |t| t.to_string())
        );
        for &loser in &losers {
            if !soft_delete {
                let remaining = if self.dry_run {
                    left_behind.get(&loser).copied().unwrap_or(0)
                } else {
                    let mut n = 0;
                    for r in &refs {
                        n += graph.count_dependents(r, &[loser])?;
                    }
                    n
                };
                if remaining > 0 {
                    warn!(%kind, id = loser, remaining, "still referenced; kept live");
                    report.retained.push(loser);
                    continue;
                }
            }

            if !self.dry_run {
                let snapshot = store.snapshot(kind, loser)?;
                archives.insert(kind, loser, MERGE_REASON, target, Some(&detail), &snapshot)?;
                if soft_delete {
                    store.set_status(kind, loser, STATUS_INACTIVE)?;
                } else {
                    store.delete(kind, loser)?;
                }
            }
            report.archived.push(loser);
            if soft_delete {
                report.deactivated.push(loser);
            } else {
                report.deleted.push(loser);
            }
        }

        let settled = report.archived.is_empty() && !report.retained.is_empty();
        if target_current && settled && report.moved_total() == 0 {
            debug!(%kind, members = ?group.members(), "group already merged; nothing left to move");
            report.status = MergeStatus::Retained;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, DuplicateGroup, EntityKind, Facility, GroupStrategy, Row};
    use crate::proposal::ProposalBuilder;
    use crate::storage::open_in_memory;
    use crate::storage::repositories::{
        CompanyRepository, FacilityRepository, Repository, SqliteCompanyRepository, SqliteFacilityRepository,
    };

    fn company_group(ids: &[EntityId]) -> DuplicateGroup {
        DuplicateGroup::new(EntityKind::Company, ids.to_vec(), GroupStrategy::NormalizedName).unwrap()
    }

    fn propose_companies(pool: &ConnectionPool, ids: &[EntityId]) -> MergeProposal<Company> {
        let conn = pool.get_connection();
        let rows = SqliteCompanyRepository::new(&conn, "main").find_by_ids(ids).unwrap();
        let graph = SchemaGraph::new(&conn, "main");
        ProposalBuilder::for_entity::<Company>(&graph)
            .unwrap()
            .propose(&company_group(ids), &rows)
            .unwrap()
    }

    fn seed_acme(pool: &ConnectionPool) -> (EntityId, EntityId) {
        let conn = pool.get_connection();
        let companies = SqliteCompanyRepository::new(&conn, "main");
        let facilities = SqliteFacilityRepository::new(&conn, "main");

        let mut a = Company::new("Acme LLC");
        a.notes = Some("east gate".to_string());
        let mut b = Company::new("ACME, L.L.C.");
        b.notes = Some("east gate".to_string());
        let a = companies.insert(&a).unwrap();
        let b = companies.insert(&b).unwrap();

        facilities
            .insert(&Facility::new("Elevator").with_company(a).with_place("Topeka", "KS"))
            .unwrap();
        facilities
            .insert(&Facility::new("Mill").with_company(a).with_place("Topeka", "KS"))
            .unwrap();
        facilities
            .insert(&Facility::new("Elevator").with_company(b).with_place("Topeka", "KS"))
            .unwrap();
        (a, b)
    }

    fn table_count(pool: &ConnectionPool, sql: &str) -> i64 {
        pool.get_connection().query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn parent_merge_repoints_excludes_conflicts_and_retains() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let proposal = propose_companies(&pool, &[a, b]);
        assert_eq!(proposal.record.name, "ACME, L.L.C.");

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Applied, "{:?}", report.error);
        assert_eq!(report.target_id, Some(b));
        assert!(!report.created);

        // "Mill" moves; a's "Elevator" would duplicate b's and stays behind.
        assert_eq!(report.moved_total(), 1);
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].from_id, a);
        assert_eq!(report.retained, vec![a]);
        assert!(report.archived.is_empty());

        let conn = pool.get_connection();
        let on_b = SqliteFacilityRepository::new(&conn, "main").list_by_company_ids(&[b]).unwrap();
        assert_eq!(on_b.len(), 2);
    }

    #[test]
    fn parent_without_dependents_is_archived_then_deleted() {
        let pool = open_in_memory().unwrap();
        let (a, b) = {
            let conn = pool.get_connection();
            let repo = SqliteCompanyRepository::new(&conn, "main");
            let mut a = Company::new("Acme LLC");
            a.notes = Some("east gate".to_string());
            let mut b = Company::new("ACME, L.L.C.");
            b.notes = Some("east gate".to_string());
            (repo.insert(&a).unwrap(), repo.insert(&b).unwrap())
        };
        let proposal = propose_companies(&pool, &[a, b]);

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Applied);
        assert_eq!(report.target_id, Some(b));
        assert_eq!(report.archived, vec![a]);
        assert_eq!(report.deleted, vec![a]);

        let conn = pool.get_connection();
        let records = SqliteArchiveRepository::new(&conn, "main")
            .list_for(EntityKind::Company, a)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merged_to_id, Some(b));
        assert_eq!(records[0].snapshot["name"], "Acme LLC");
        assert!(SqliteCompanyRepository::new(&conn, "main").find_by_id(a).unwrap().is_none());
        let remaining = SqliteCompanyRepository::new(&conn, "main").list(None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record.notes.as_deref(), Some("east gate"));
    }

    #[test]
    fn dependent_merge_soft_deletes_and_moves_children() {
        let pool = open_in_memory().unwrap();
        let (x, y) = {
            let conn = pool.get_connection();
            let company = SqliteCompanyRepository::new(&conn, "main")
                .insert(&Company::new("Beta Grain"))
                .unwrap();
            let repo = SqliteFacilityRepository::new(&conn, "main");
            let mut x = Facility::new("Elevator").with_company(company).with_place("Salina", "KS");
            x.address_line1 = Some("100 Main".to_string());
            let mut y = Facility::new("Elevator Annex").with_company(company).with_place("Salina", "KS");
            y.address_line1 = Some("100 Main".to_string());
            y.notes = Some("rail spur".to_string());
            let (x, y) = (repo.insert(&x).unwrap(), repo.insert(&y).unwrap());
            conn.execute_batch(&format!(
                "INSERT INTO service_type(service_type_id, name) VALUES (1, 'Drying'), (2, 'Storage');
                 INSERT INTO facility_service(facility_id, service_type_id) VALUES ({x}, 1), ({y}, 1), ({y}, 2);
                 INSERT INTO facility_contact(facility_id, name) VALUES ({x}, 'Pat');"
            ))
            .unwrap();
            (x, y)
        };

        let rows = {
            let conn = pool.get_connection();
            SqliteFacilityRepository::new(&conn, "main").find_by_ids(&[x, y]).unwrap()
        };
        let group = DuplicateGroup::new(EntityKind::Facility, [x, y], GroupStrategy::Address).unwrap();
        let proposal = ProposalBuilder::default().propose(&group, &rows).unwrap();
        assert_eq!(proposal.record.name, "Elevator Annex");

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Applied, "{:?}", report.error);
        assert_eq!(report.target_id, Some(y));
        assert_eq!(report.deactivated, vec![x]);
        assert_eq!(report.archived, vec![x]);

        // x's contact moves; x's Drying row collides with y's and stays.
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].reference, "facility_service.facility_id");
        assert_eq!(table_count(&pool, &format!("SELECT COUNT(*) FROM facility_contact WHERE facility_id = {y}")), 1);
        assert_eq!(table_count(&pool, &format!("SELECT COUNT(*) FROM facility_service WHERE facility_id = {x}")), 1);
        assert_eq!(table_count(&pool, &format!("SELECT COUNT(*) FROM facility WHERE facility_id = {x} AND status = 'INACTIVE'")), 1);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM deactivated_facilities"), 1);
    }

    #[test]
    fn dry_run_writes_nothing_and_predicts_outcome() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let proposal = propose_companies(&pool, &[a, b]);

        let preview = MergeExecutor::new(&pool, "main", true).execute(&proposal);
        assert_eq!(preview.status, MergeStatus::Previewed);
        assert_eq!(preview.moved_total(), 1);
        assert_eq!(preview.retained, vec![a]);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM facility WHERE company_id = 1"), 2);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM company"), 2);

        let applied = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(applied.moved_total(), preview.moved_total());
        assert_eq!(applied.excluded, preview.excluded);
        assert_eq!(applied.retained, preview.retained);
    }

    #[test]
    fn dry_run_with_new_target_reports_creation() {
        let pool = open_in_memory().unwrap();
        let (a, b) = {
            let conn = pool.get_connection();
            let repo = SqliteCompanyRepository::new(&conn, "main");
            let mut a = Company::new("Acme");
            a.phone_main = Some("555".to_string());
            (repo.insert(&a).unwrap(), repo.insert(&Company::new("Acme Co")).unwrap())
        };
        let mut proposal = propose_companies(&pool, &[a, b]);
        proposal.record.name = "Acme Company".to_string();

        let report = MergeExecutor::new(&pool, "main", true).execute(&proposal);
        assert!(report.created);
        assert_eq!(report.target_id, None);
        assert_eq!(report.deleted, vec![a, b]);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM company"), 2);

        let applied = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert!(applied.created);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM company"), 1);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM deactivated_companies"), 2);
    }

    #[test]
    fn rerun_on_settled_parent_is_retained_not_applied() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let first = MergeExecutor::new(&pool, "main", false).execute(&propose_companies(&pool, &[a, b]));
        assert_eq!(first.status, MergeStatus::Applied, "{:?}", first.error);

        // The elevator left on `a` gets merged away by the facility pass.
        {
            let conn = pool.get_connection();
            let left: EntityId = conn
                .query_row("SELECT facility_id FROM facility WHERE company_id = ?1", [a], |r| r.get(0))
                .unwrap();
            EntityStore::new(&conn, "main")
                .set_status(EntityKind::Facility, left, STATUS_INACTIVE)
                .unwrap();
        }

        let proposal = propose_companies(&pool, &[a, b]);
        let preview = MergeExecutor::new(&pool, "main", true).execute(&proposal);
        assert_eq!(preview.status, MergeStatus::Retained, "{:?}", preview.error);

        let again = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(again.status, MergeStatus::Retained, "{:?}", again.error);
        assert!(again.status.is_success());
        assert_eq!(again.target_id, Some(b));
        assert_eq!(again.moved_total(), 0);
        assert_eq!(again.retained, vec![a]);
        assert_eq!(again.summary(), format!("action=RETAINED target={b} retained=[{a}]"));
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM company"), 2);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM deactivated_companies"), 0);
    }

    #[test]
    fn retired_row_on_the_natural_key_is_revived_as_target() {
        let pool = open_in_memory().unwrap();
        let (retired, x, y) = {
            let conn = pool.get_connection();
            let company = SqliteCompanyRepository::new(&conn, "main")
                .insert(&Company::new("Beta Grain"))
                .unwrap();
            let repo = SqliteFacilityRepository::new(&conn, "main");
            let retired = repo
                .insert(&Facility::new("Elevator").with_company(company).with_place("Salina", "KS"))
                .unwrap();
            EntityStore::new(&conn, "main")
                .set_status(EntityKind::Facility, retired, STATUS_INACTIVE)
                .unwrap();
            let x = repo
                .insert(&Facility::new("Elevator East").with_company(company).with_place("Salina", "KS"))
                .unwrap();
            let y = repo
                .insert(&Facility::new("Elevator West").with_company(company).with_place("Salina", "KS"))
                .unwrap();
            (retired, x, y)
        };
        let rows = {
            let conn = pool.get_connection();
            SqliteFacilityRepository::new(&conn, "main").find_by_ids(&[x, y]).unwrap()
        };
        let group = DuplicateGroup::new(EntityKind::Facility, [x, y], GroupStrategy::Address).unwrap();
        let mut proposal = ProposalBuilder::default().propose(&group, &rows).unwrap();
        proposal.record.name = "Elevator".to_string();

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Applied, "{:?}", report.error);
        assert_eq!(report.target_id, Some(retired));
        assert_eq!(report.revived, Some(retired));
        assert!(report.summary().contains(&format!("revived={retired}")));
        assert_eq!(report.deactivated, vec![x, y]);
        assert_eq!(
            table_count(&pool, &format!("SELECT COUNT(*) FROM facility WHERE facility_id = {retired} AND status = 'ACTIVE'")),
            1
        );
    }

    #[test]
    fn missing_archive_table_fails_and_rolls_back() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let proposal = propose_companies(&pool, &[a, b]);
        pool.get_connection()
            .execute_batch("DROP TABLE deactivated_companies")
            .unwrap();

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Failed);
        assert!(report.error.unwrap().contains("deactivated_companies"));
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM facility WHERE company_id = 1"), 2);
        pool.health_check().unwrap();
    }

    #[test]
    fn failure_midway_leaves_no_partial_repoint() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let proposal = propose_companies(&pool, &[a, b]);
        // Make the archive insert fail after dependents have already moved.
        pool.get_connection()
            .execute_batch(
                "CREATE TRIGGER no_archive BEFORE INSERT ON deactivated_companies
                 BEGIN SELECT RAISE(ABORT, 'archive refused'); END;
                 DELETE FROM facility WHERE company_id = 1 AND name = 'Elevator';",
            )
            .unwrap();

        let report = MergeExecutor::new(&pool, "main", false).execute(&proposal);
        assert_eq!(report.status, MergeStatus::Failed);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM facility WHERE company_id = 1"), 1);
        assert_eq!(table_count(&pool, "SELECT COUNT(*) FROM company"), 2);
        pool.health_check().unwrap();
    }

    #[test]
    fn no_two_active_rows_share_a_unique_key_after_merge() {
        let pool = open_in_memory().unwrap();
        let (a, b) = seed_acme(&pool);
        let proposal = propose_companies(&pool, &[a, b]);
        MergeExecutor::new(&pool, "main", false).execute(&proposal);

        let dupes = table_count(
            &pool,
            "SELECT COUNT(*) FROM (SELECT company_id, name, city, state FROM facility
             WHERE status IS NOT 'INACTIVE' GROUP BY 1, 2, 3, 4 HAVING COUNT(*) > 1)",
        );
        assert_eq!(dupes, 0);
        let rows: Vec<Row<Company>> = {
            let conn = pool.get_connection();
            SqliteCompanyRepository::new(&conn, "main").list(None).unwrap()
        };
        assert_eq!(rows.len(), 2);
    }
}
