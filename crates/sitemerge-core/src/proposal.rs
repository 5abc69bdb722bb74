//! Canonical-record synthesis: one record per group, built field by field from
//! the members, then checked against the table's NOT NULL columns.

use std::collections::BTreeSet;

use rusqlite::types::Value;

use crate::error::{Result, SiteMergeError};
use crate::models::{Company, DuplicateGroup, Entity, Facility, MergeProposal, Row, STATUS_ACTIVE};
use crate::normalize::{capitalize_street, combine, normalize_street, normalize_value};
use crate::storage::SchemaGraph;

/// Per-kind merge heuristics.
pub trait Mergeable: Entity {
    /// Data-completeness score; the highest-scoring member anchors the merge.
    fn completeness(&self) -> u32;

    /// Canonical values for `members` (group order), anchored on `base`.
    fn synthesize(base: &Self, members: &[&Self]) -> Self;
}

fn present(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.trim().is_empty())
}

fn weight(v: &Option<String>, w: u32) -> u32 {
    if present(v) { w } else { 0 }
}

/// Base's value when it has one, else the first non-empty value in group order.
fn base_or_first<T>(base: &T, members: &[&T], field: impl Fn(&T) -> &Option<String>) -> Option<String> {
    if present(field(base)) {
        return field(base).clone();
    }
    members.iter().map(|m| field(*m)).find(|v| present(v)).cloned().flatten()
}

/// Longest non-empty name; the base keeps ties.
fn longest_name<'a>(base: &'a str, names: impl Iterator<Item = &'a str>) -> String {
    let mut best = base.trim();
    for name in names {
        let name = name.trim();
        if name.chars().count() > best.chars().count() {
            best = name;
        }
    }
    best.to_string()
}

/// `combine` across the group, longest text first so it anchors the result.
fn fold_text<T>(members: &[&T], field: impl Fn(&T) -> &Option<String>) -> Option<String> {
    let mut texts: Vec<&str> = members
        .iter()
        .filter_map(|m| field(*m).as_deref())
        .filter(|s| !s.trim().is_empty())
        .collect();
    texts.sort_by_key(|s| std::cmp::Reverse(s.trim().chars().count()));
    texts
        .into_iter()
        .fold(None, |acc, text| combine(acc.as_deref(), Some(text)))
}

fn canonical_street(line: Option<String>) -> Option<String> {
    let street = capitalize_street(&normalize_street(line.as_deref()?));
    if street.is_empty() { None } else { Some(street) }
}

impl Mergeable for Company {
    fn completeness(&self) -> u32 {
        let name = if self.name.trim().is_empty() { 0 } else { 3 };
        name + weight(&self.website_url, 2) + weight(&self.phone_main, 2) + weight(&self.notes, 2)
    }

    fn synthesize(base: &Self, members: &[&Self]) -> Self {
        Company {
            name: longest_name(&base.name, members.iter().map(|m| m.name.as_str())),
            website_url: base_or_first(base, members, |c| &c.website_url),
            phone_main: base_or_first(base, members, |c| &c.phone_main),
            notes: fold_text(members, |c| &c.notes),
        }
    }
}

impl Mergeable for Facility {
    fn completeness(&self) -> u32 {
        let mut score = weight(&self.description, 5)
            + weight(&self.notes, 4)
            + weight(&self.website_url, 2)
            + weight(&self.phone_main, 2)
            + weight(&self.email_main, 2)
            + weight(&self.address_line1, 3)
            + weight(&self.city, 2)
            + weight(&self.state, 2)
            + weight(&self.postal_code, 2);
        if self.latitude.is_some() && self.longitude.is_some() {
            score += 2;
        }
        if self.status.as_deref() == Some(STATUS_ACTIVE) {
            score += 2;
        }
        if self.geom_from_address {
            score += 1;
        }
        score
    }

    fn synthesize(base: &Self, members: &[&Self]) -> Self {
        let coordinates = |f: &Facility| Some((f.latitude?, f.longitude?));
        let (latitude, longitude) = coordinates(base)
            .or_else(|| members.iter().filter(|m| m.geom_from_address).find_map(|&m| coordinates(m)))
            .or_else(|| members.iter().find_map(|&m| coordinates(m)))
            .map_or((None, None), |(lat, lon)| (Some(lat), Some(lon)));

        Facility {
            company_id: base.company_id,
            facility_type_id: base.facility_type_id,
            name: longest_name(&base.name, members.iter().map(|m| m.name.as_str())),
            description: fold_text(members, |f| &f.description),
            address_line1: canonical_street(base_or_first(base, members, |f| &f.address_line1)),
            address_line2: base_or_first(base, members, |f| &f.address_line2),
            city: base_or_first(base, members, |f| &f.city),
            county: base_or_first(base, members, |f| &f.county),
            state: base_or_first(base, members, |f| &f.state),
            postal_code: base_or_first(base, members, |f| &f.postal_code),
            latitude,
            longitude,
            status: Some(STATUS_ACTIVE.to_string()),
            website_url: base_or_first(base, members, |f| &f.website_url),
            phone_main: base_or_first(base, members, |f| &f.phone_main),
            email_main: base_or_first(base, members, |f| &f.email_main),
            notes: fold_text(members, |f| &f.notes),
            geom_from_address: members.iter().any(|m| m.geom_from_address),
            imported_source: fold_text(members, |f| &f.imported_source),
        }
    }
}

/// Builds proposals and rejects any that would leave a NOT NULL column empty.
#[derive(Debug, Clone, Default)]
pub struct ProposalBuilder {
    required: BTreeSet<String>,
}

impl ProposalBuilder {
    pub fn new(required: BTreeSet<String>) -> Self {
        Self { required }
    }

    /// Required columns read from the live table definition.
    pub fn for_entity<E: Entity>(graph: &SchemaGraph<'_>) -> Result<Self> {
        Ok(Self::new(graph.required_columns(E::KIND.table())?))
    }

    pub fn propose<E: Mergeable>(&self, group: &DuplicateGroup, rows: &[Row<E>]) -> Result<MergeProposal<E>> {
        let mut members: Vec<&Row<E>> = Vec::with_capacity(group.len());
        for id in group.members() {
            let row = rows
                .iter()
                .find(|r| r.id == *id)
                .ok_or_else(|| SiteMergeError::NotFound(format!("{} {id}", E::KIND)))?;
            members.push(row);
        }

        // First member with the top score; `max_by_key` would keep the last.
        let mut base = members[0];
        for &row in &members[1..] {
            if row.record.completeness() > base.record.completeness() {
                base = row;
            }
        }

        let records: Vec<&E> = members.iter().map(|r| &r.record).collect();
        let record = E::synthesize(&base.record, &records);
        self.validate(group, &record)?;

        Ok(MergeProposal {
            group: group.clone(),
            base_id: base.id,
            record,
        })
    }

    pub fn validate<E: Entity>(&self, group: &DuplicateGroup, record: &E) -> Result<()> {
        let missing: Vec<&str> = record
            .column_values()
            .into_iter()
            .filter(|(col, _)| self.required.contains(*col))
            .filter(|(_, v)| match v {
                Value::Null => true,
                Value::Text(s) => normalize_value(Some(s.as_str())).is_none(),
                _ => false,
            })
            .map(|(col, _)| col)
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        Err(SiteMergeError::ValidationError(format!(
            "{} proposal for {:?} leaves required field(s) empty: {}",
            E::KIND,
            group.members(),
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, GroupStrategy};

    fn group(kind: EntityKind, ids: &[i64]) -> DuplicateGroup {
        DuplicateGroup::new(kind, ids.to_vec(), GroupStrategy::Address).unwrap()
    }

    fn builder(required: &[&str]) -> ProposalBuilder {
        ProposalBuilder::new(required.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn acme_names_pick_longer_and_keep_identical_notes() {
        let mut a = Company::new("Acme LLC");
        a.notes = Some("east gate".to_string());
        let mut b = Company::new("ACME, L.L.C.");
        b.notes = Some("east gate".to_string());
        let rows = vec![Row::new(1, a), Row::new(2, b)];

        let p = builder(&["name"])
            .propose(&group(EntityKind::Company, &[1, 2]), &rows)
            .unwrap();
        assert_eq!(p.base_id, 1);
        assert_eq!(p.record.name, "ACME, L.L.C.");
        assert_eq!(p.record.notes.as_deref(), Some("east gate"));
    }

    #[test]
    fn most_complete_member_is_base() {
        let sparse = Facility::new("Elevator").with_company(10).with_place("Salina", "KS");
        let mut rich = sparse.clone();
        rich.description = Some("Concrete elevator".to_string());
        rich.phone_main = Some("785-555-0100".to_string());
        let rows = vec![Row::new(1, sparse), Row::new(2, rich)];

        let p = builder(&[])
            .propose(&group(EntityKind::Facility, &[1, 2]), &rows)
            .unwrap();
        assert_eq!(p.base_id, 2);
        assert_eq!(p.record.phone_main.as_deref(), Some("785-555-0100"));
    }

    #[test]
    fn fields_fill_from_members_and_text_folds() {
        let mut a = Facility::new("Elevator").with_company(10).with_place("Salina", "KS");
        a.address_line1 = Some("123 c.r. 10".to_string());
        a.notes = Some("Use the east gate after 5pm".to_string());
        a.latitude = Some(38.84);
        a.longitude = Some(-97.61);
        let mut b = Facility::new("Salina Elevator").with_company(10).with_place("Salina", "KS");
        b.postal_code = Some("67401".to_string());
        b.notes = Some("east gate".to_string());
        b.description = Some("Scale house on north side".to_string());
        b.geom_from_address = true;
        b.status = Some("INACTIVE".to_string());
        let rows = vec![Row::new(1, a), Row::new(2, b)];

        let p = builder(&["name", "state"])
            .propose(&group(EntityKind::Facility, &[1, 2]), &rows)
            .unwrap();
        let r = &p.record;
        assert_eq!(r.name, "Salina Elevator");
        assert_eq!(r.address_line1.as_deref(), Some("123 County Road 10"));
        assert_eq!(r.postal_code.as_deref(), Some("67401"));
        assert_eq!(r.notes.as_deref(), Some("Use the east gate after 5pm"));
        assert_eq!(r.description.as_deref(), Some("Scale house on north side"));
        assert!(r.geom_from_address);
        assert_eq!(r.status.as_deref(), Some(STATUS_ACTIVE));
        assert_eq!((r.latitude, r.longitude), (Some(38.84), Some(-97.61)));
    }

    #[test]
    fn coordinates_prefer_flagged_member_when_base_has_none() {
        let mut base = Facility::new("Elevator").with_company(10).with_place("Salina", "KS");
        base.description = Some("main site".to_string());
        let plain = Facility::new("Elevator").with_coordinates(38.0, -97.0);
        let mut flagged = Facility::new("Elevator").with_coordinates(38.5, -97.5);
        flagged.geom_from_address = true;

        let merged = Facility::synthesize(&base, &[&base, &plain, &flagged]);
        assert_eq!((merged.latitude, merged.longitude), (Some(38.5), Some(-97.5)));
    }

    #[test]
    fn distinct_notes_are_all_kept() {
        let mut a = Company::new("Acme");
        a.notes = Some("north scale".to_string());
        let mut b = Company::new("Acme");
        b.notes = Some("rail spur".to_string());
        let mut c = Company::new("Acme");
        c.notes = Some("bulk only".to_string());

        let merged = Company::synthesize(&a, &[&a, &b, &c]);
        let notes = merged.notes.unwrap();
        assert!(notes.contains("north scale"));
        assert!(notes.contains("rail spur"));
        assert!(notes.contains("bulk only"));
        assert_eq!(notes.matches("\n\n---\n\n").count(), 2);
    }

    #[test]
    fn import_sources_of_every_member_survive() {
        let mut a = Facility::new("Elevator").with_company(10).with_place("Salina", "KS");
        a.imported_source = Some("kgfa-2023".to_string());
        let mut b = a.clone();
        b.imported_source = Some("ethanol-plants.csv".to_string());

        let merged = Facility::synthesize(&a, &[&a, &b]);
        let sources = merged.imported_source.unwrap();
        assert!(sources.contains("kgfa-2023"));
        assert!(sources.contains("ethanol-plants.csv"));
    }

    #[test]
    fn missing_required_field_is_validation_error() {
        let a = Facility::new("Elevator").with_company(10);
        let b = Facility::new("Elevator").with_company(10);
        let rows = vec![Row::new(1, a), Row::new(2, b)];

        let err = builder(&["name", "state"])
            .propose(&group(EntityKind::Facility, &[1, 2]), &rows)
            .unwrap_err();
        match err {
            SiteMergeError::ValidationError(msg) => assert!(msg.contains("state")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn applied_proposal_is_a_fixed_point() {
        let mut a = Facility::new("Elevator").with_company(10).with_place("Salina", "KS");
        a.address_line1 = Some("500 main st".to_string());
        a.notes = Some("north scale".to_string());
        let mut b = Facility::new("Elevator #2").with_company(10).with_place("Salina", "KS");
        b.notes = Some("rail spur".to_string());
        b.latitude = Some(38.84);
        b.longitude = Some(-97.61);

        let merged = Facility::synthesize(&a, &[&a, &b]);
        let again = Facility::synthesize(&merged, &[&merged]);
        assert_eq!(again, merged);
    }

    #[test]
    fn member_missing_from_rows_is_not_found() {
        let rows = vec![Row::new(1, Company::new("Acme"))];
        let err = builder(&[])
            .propose(&group(EntityKind::Company, &[1, 2]), &rows)
            .unwrap_err();
        assert!(matches!(err, SiteMergeError::NotFound(_)));
    }
}
