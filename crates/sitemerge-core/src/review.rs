//! What a reviewer sees for a group, and who decides.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;

use serde::Serialize;

use crate::models::{Entity, EntityId, EntityKind, GroupStrategy, MergeProposal, Row};
use crate::normalize::{norm_ws, normalize_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Accept,
    Reject,
}

/// One displayed field across the group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldReview {
    pub field: &'static str,
    pub values: Vec<(EntityId, Option<String>)>,
    pub merged: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReview {
    pub kind: EntityKind,
    pub strategy: GroupStrategy,
    pub members: Vec<EntityId>,
    pub base_id: EntityId,
    pub matches: Vec<FieldReview>,
    pub differences: Vec<FieldReview>,
    /// Only a naming variant separates the members.
    pub auto_accept: bool,
}

impl GroupReview {
    pub fn build<E: Entity>(proposal: &MergeProposal<E>, rows: &[Row<E>]) -> Self {
        let members: Vec<&Row<E>> = proposal
            .group
            .members()
            .iter()
            .filter_map(|id| rows.iter().find(|r| r.id == *id))
            .collect();
        let displayed: Vec<(EntityId, Vec<(&'static str, Option<String>)>)> = members
            .iter()
            .map(|r| (r.id, r.record.display_fields()))
            .collect();
        let merged = proposal.record.display_fields();

        let mut matches = Vec::new();
        let mut differences = Vec::new();
        let mut name_variant = false;

        for (i, (field, merged_value)) in merged.into_iter().enumerate() {
            let values: Vec<(EntityId, Option<String>)> = displayed
                .iter()
                .map(|(id, fields)| (*id, fields.get(i).and_then(|(_, v)| v.clone())))
                .collect();

            let raw: BTreeSet<String> = values
                .iter()
                .filter_map(|(_, v)| v.as_deref())
                .map(norm_ws)
                .filter(|v| !v.is_empty())
                .collect();
            if raw.is_empty() {
                continue;
            }

            let distinct = if field == "name" {
                let canonical: BTreeSet<String> = raw.iter().map(|v| normalize_name(v)).collect();
                if raw.len() > 1 && canonical.len() == 1 {
                    name_variant = true;
                }
                canonical.len()
            } else {
                raw.len()
            };

            let review = FieldReview {
                field,
                values,
                merged: merged_value,
            };
            if distinct <= 1 {
                matches.push(review);
            } else {
                differences.push(review);
            }
        }

        Self {
            kind: proposal.group.kind,
            strategy: proposal.group.strategy,
            members: proposal.group.members().to_vec(),
            base_id: proposal.base_id,
            auto_accept: name_variant && differences.is_empty(),
            matches,
            differences,
        }
    }

    /// Multi-line diff for an interactive reviewer.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} group {:?} ({}), most complete: {}",
            self.kind, self.members, self.strategy, self.base_id
        );
        if !self.matches.is_empty() {
            let names: Vec<&str> = self.matches.iter().map(|f| f.field).collect();
            let _ = writeln!(out, "  same: {}", names.join(", "));
        }
        for diff in &self.differences {
            let _ = writeln!(out, "  {}:", diff.field);
            for (id, value) in &diff.values {
                let _ = writeln!(out, "    {id:>8}  {}", value.as_deref().unwrap_or("(empty)"));
            }
            let _ = writeln!(out, "    {:>8}  {}", "merged", diff.merged.as_deref().unwrap_or("(empty)"));
        }
        out
    }

    pub fn match_fields(&self) -> Vec<&'static str> {
        self.matches.iter().map(|f| f.field).collect()
    }

    pub fn difference_fields(&self) -> Vec<&'static str> {
        self.differences.iter().map(|f| f.field).collect()
    }
}

pub trait Reviewer {
    fn decide(&mut self, review: &GroupReview) -> Decision;
}

/// Accepts everything; for tests and fully trusted runs.
#[derive(Debug, Default)]
pub struct AlwaysAccept;

impl Reviewer for AlwaysAccept {
    fn decide(&mut self, _review: &GroupReview) -> Decision {
        Decision::Accept
    }
}

/// Headless batch mode: only groups that qualify for auto-accept go through.
#[derive(Debug, Default)]
pub struct AutoOnly;

impl Reviewer for AutoOnly {
    fn decide(&mut self, review: &GroupReview) -> Decision {
        if review.auto_accept {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }
}

/// Replays a fixed list of answers, then rejects. Records every group it was asked about.
#[derive(Debug, Default)]
pub struct ScriptedReviewer {
    answers: VecDeque<Decision>,
    pub asked: Vec<Vec<EntityId>>,
}

impl ScriptedReviewer {
    pub fn new(answers: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            asked: Vec::new(),
        }
    }
}

impl Reviewer for ScriptedReviewer {
    fn decide(&mut self, review: &GroupReview) -> Decision {
        self.asked.push(review.members.clone());
        self.answers.pop_front().unwrap_or(Decision::Reject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, DuplicateGroup, Facility};
    use crate::proposal::{Mergeable, ProposalBuilder};

    fn review_of<E: Mergeable>(rows: Vec<Row<E>>) -> GroupReview {
        let ids: Vec<EntityId> = rows.iter().map(|r| r.id).collect();
        let group = DuplicateGroup::new(E::KIND, ids, GroupStrategy::NormalizedName).unwrap();
        let proposal = ProposalBuilder::default().propose(&group, &rows).unwrap();
        GroupReview::build(&proposal, &rows)
    }

    #[test]
    fn naming_variant_alone_is_auto_accepted() {
        let mut a = Company::new("Acme LLC");
        a.notes = Some("east gate".to_string());
        let mut b = Company::new("ACME, L.L.C.");
        b.notes = Some("east gate".to_string());

        let review = review_of(vec![Row::new(1, a), Row::new(2, b)]);
        assert!(review.auto_accept);
        assert!(review.differences.is_empty());
        assert_eq!(review.match_fields(), vec!["name", "notes"]);
    }

    #[test]
    fn other_difference_requires_confirmation() {
        let a = Company::new("Acme LLC");
        let mut b = Company::new("Acme Inc");
        b.phone_main = Some("555-0100".to_string());
        let mut c = b.clone();
        c.phone_main = Some("555-0199".to_string());

        let review = review_of(vec![Row::new(1, a), Row::new(2, b), Row::new(3, c)]);
        assert!(!review.auto_accept);
        assert_eq!(review.difference_fields(), vec!["phone_main"]);
        assert!(review.render().contains("phone_main"));
    }

    #[test]
    fn identical_rows_are_not_auto_accepted() {
        let f = Facility::new("Elevator").with_company(1).with_place("Salina", "KS");
        let review = review_of(vec![Row::new(1, f.clone()), Row::new(2, f)]);
        assert!(review.differences.is_empty());
        assert!(!review.auto_accept);
    }

    #[test]
    fn scripted_reviewer_replays_then_rejects() {
        let review = review_of(vec![Row::new(1, Company::new("A Co")), Row::new(2, Company::new("A"))]);
        let mut reviewer = ScriptedReviewer::new([Decision::Accept]);
        assert_eq!(reviewer.decide(&review), Decision::Accept);
        assert_eq!(reviewer.decide(&review), Decision::Reject);
        assert_eq!(reviewer.asked.len(), 2);
        assert_eq!(AutoOnly.decide(&review), Decision::Accept);
    }
}
