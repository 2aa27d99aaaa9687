//! Heterogeneous subject sets with provenance, used by expand and the
//! development tooling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::caveats::{caveat_and, CaveatExpression};
use crate::subjectset::{BaseSubjectSet, SetElement};
use crate::tuple::{Relationship, Subject, ELLIPSIS, WILDCARD_OBJECT_ID};

/// A subject found by the evaluator: its identity, the subjects carved
/// out of it when it is a wildcard, the condition under which it is a
/// member, and the relationships that contributed to its presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundSubject {
    subject: Subject,
    excluded: Vec<FoundSubject>,
    caveat_expression: Option<CaveatExpression>,
    relationships: Vec<Relationship>,
}

impl FoundSubject {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            excluded: Vec::new(),
            caveat_expression: None,
            relationships: Vec::new(),
        }
    }

    /// A found subject sourced from a stored relationship; a caveat
    /// reference on the relationship becomes conditional membership.
    pub fn from_relationship(relationship: &Relationship) -> Self {
        Self {
            subject: relationship.subject.clone(),
            excluded: Vec::new(),
            caveat_expression: relationship
                .caveat
                .clone()
                .map(CaveatExpression::caveat),
            relationships: vec![relationship.clone()],
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn excluded_subjects(&self) -> &[FoundSubject] {
        &self.excluded
    }

    pub fn caveat_expression(&self) -> Option<&CaveatExpression> {
        self.caveat_expression.as_ref()
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn is_wildcard(&self) -> bool {
        self.subject.is_wildcard()
    }

    /// Conjoins the membership condition with a parent expression.
    pub fn conjoin_caveat(&mut self, expression: &CaveatExpression) {
        self.caveat_expression = caveat_and(
            Some(expression.clone()),
            self.caveat_expression.take(),
        );
    }

    /// Provenance merge: append-only, deduplicated by relationship key.
    fn record_relationships(&mut self, source: &FoundSubject) {
        for relationship in &source.relationships {
            if !self
                .relationships
                .iter()
                .any(|existing| existing.key() == relationship.key())
            {
                self.relationships.push(relationship.clone());
            }
        }
    }
}

impl SetElement for FoundSubject {
    fn subject_id(&self) -> &str {
        match &self.subject {
            Subject::Object(onr) => &onr.object_id,
            Subject::Wildcard { .. } => WILDCARD_OBJECT_ID,
        }
    }

    fn caveat_expression(&self) -> Option<&CaveatExpression> {
        self.caveat_expression.as_ref()
    }

    fn excluded_subjects(&self) -> &[Self] {
        &self.excluded
    }
}

/// A set of found subjects spanning multiple subject types, keyed by
/// `namespace#relation`.
#[derive(Debug, Clone)]
pub struct TrackingSubjectSet {
    set_by_type: BTreeMap<String, BaseSubjectSet<FoundSubject>>,
}

impl TrackingSubjectSet {
    pub fn new() -> Self {
        Self {
            set_by_type: BTreeMap::new(),
        }
    }

    pub fn with_subjects(subjects: impl IntoIterator<Item = FoundSubject>) -> Self {
        let mut set = Self::new();
        for subject in subjects {
            set.add(subject);
        }
        set
    }

    pub fn add(&mut self, subject: FoundSubject) {
        let key = subject.subject.type_key();
        self.set_for_key(&key).add(subject);
    }

    /// Adds all subjects from the other set to this one.
    pub fn add_from(&mut self, other: &TrackingSubjectSet) {
        for (key, other_set) in &other.set_by_type {
            self.set_for_key(key).union_with(other_set);
        }
    }

    /// A new set holding the members of this set minus the other's.
    pub fn exclude(&self, other: &TrackingSubjectSet) -> TrackingSubjectSet {
        let mut out = TrackingSubjectSet::new();
        for (key, set) in &self.set_by_type {
            let mut cloned = set.clone();
            if let Some(other_set) = other.set_by_type.get(key) {
                cloned.subtract(other_set);
            }
            out.set_by_type.insert(key.clone(), cloned);
        }
        out
    }

    /// A new set holding the members present in both sets. A wildcard
    /// found on both sides is returned along with the concrete
    /// intersections.
    pub fn intersect(&self, other: &TrackingSubjectSet) -> TrackingSubjectSet {
        let mut out = TrackingSubjectSet::new();
        for (key, set) in &self.set_by_type {
            if let Some(other_set) = other.set_by_type.get(key) {
                let mut cloned = set.clone();
                cloned.intersection_difference(other_set);
                out.set_by_type.insert(key.clone(), cloned);
            }
        }
        out
    }

    /// Conjoins every member's condition with the given expression.
    pub fn apply_parent_caveat_expression(&mut self, expression: &CaveatExpression) {
        for set in self.set_by_type.values_mut() {
            *set = set.with_parent_caveat_expression(expression);
        }
    }

    pub fn get(&self, subject: &Subject) -> Option<&FoundSubject> {
        self.set_by_type
            .get(&subject.type_key())?
            .get(subject.object_id())
    }

    pub fn contains(&self, subject: &Subject) -> bool {
        self.get(subject).is_some()
    }

    pub fn to_slice(&self) -> Vec<FoundSubject> {
        self.set_by_type
            .values()
            .flat_map(|set| set.as_slice())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.set_by_type.values().all(|set| set.is_empty())
    }

    fn set_for_key(&mut self, key: &str) -> &mut BaseSubjectSet<FoundSubject> {
        self.set_by_type.entry(key.to_string()).or_insert_with(|| {
            let (namespace, relation) = key.split_once('#').unwrap_or((key, ELLIPSIS));
            let namespace = namespace.to_string();
            let relation = relation.to_string();
            BaseSubjectSet::new(Arc::new(move |subject_id, caveat, excluded, sources| {
                let subject = if subject_id == WILDCARD_OBJECT_ID {
                    Subject::wildcard(&namespace)
                } else if relation == ELLIPSIS {
                    Subject::terminal(&namespace, subject_id)
                } else {
                    Subject::userset(&namespace, subject_id, &relation)
                };
                let mut found = FoundSubject::new(subject);
                found.caveat_expression = caveat;
                found.excluded = excluded;
                for source in sources {
                    found.record_relationships(source);
                }
                found
            }))
        })
    }
}

impl Default for TrackingSubjectSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::ObjectAndRelation;

    fn found(namespace: &str, object_id: &str) -> FoundSubject {
        FoundSubject::new(Subject::terminal(namespace, object_id))
    }

    #[test]
    fn test_types_are_tracked_separately() {
        let mut set = TrackingSubjectSet::new();
        set.add(found("user", "tom"));
        set.add(FoundSubject::new(Subject::userset(
            "folder", "auditors", "viewer",
        )));

        assert_eq!(set.to_slice().len(), 2);
        assert!(set.contains(&Subject::terminal("user", "tom")));
        assert!(set.contains(&Subject::userset("folder", "auditors", "viewer")));
        assert!(!set.contains(&Subject::terminal("user", "sarah")));
    }

    #[test]
    fn test_add_from_and_exclude() {
        let mut set = TrackingSubjectSet::with_subjects([found("user", "tom")]);
        let other = TrackingSubjectSet::with_subjects([found("user", "sarah")]);
        set.add_from(&other);
        assert_eq!(set.to_slice().len(), 2);

        let removed = set.exclude(&other);
        assert!(removed.contains(&Subject::terminal("user", "tom")));
        assert!(!removed.contains(&Subject::terminal("user", "sarah")));
    }

    #[test]
    fn test_intersect_only_keeps_shared_types() {
        let left = TrackingSubjectSet::with_subjects([
            found("user", "tom"),
            FoundSubject::new(Subject::userset("group", "eng", "member")),
        ]);
        let right = TrackingSubjectSet::with_subjects([found("user", "tom")]);

        let intersection = left.intersect(&right);
        assert_eq!(intersection.to_slice().len(), 1);
        assert!(intersection.contains(&Subject::terminal("user", "tom")));
    }

    #[test]
    fn test_wildcard_resolves_through_type_key() {
        let mut set = TrackingSubjectSet::new();
        set.add(FoundSubject::new(Subject::wildcard("user")));
        set.add(found("user", "tom"));

        // both live under user#... and the wildcard absorbs on union
        let merged = set.exclude(&TrackingSubjectSet::new());
        assert!(merged.get(&Subject::wildcard("user")).is_some());
    }

    #[test]
    fn test_provenance_merges_on_union() {
        let first = Relationship::parse("document:plan#viewer@user:tom").unwrap();
        let second = Relationship::parse("document:plan2#viewer@user:tom").unwrap();

        let mut set = TrackingSubjectSet::new();
        set.add(FoundSubject::from_relationship(&first));
        set.add(FoundSubject::from_relationship(&second));

        let merged = set.get(&Subject::terminal("user", "tom")).unwrap();
        assert_eq!(merged.relationships().len(), 2);
    }

    #[test]
    fn test_found_subject_from_caveated_relationship() {
        let relationship = Relationship::parse("document:plan#viewer@user:tom[tagged]").unwrap();
        let found = FoundSubject::from_relationship(&relationship);
        assert!(found.caveat_expression().is_some());
        assert_eq!(
            found.subject(),
            &Subject::Object(ObjectAndRelation::terminal("user", "tom"))
        );
    }
}
