//! Generic subject-set algebra over a single subject type key.
//!
//! A set holds concrete members plus at most one public wildcard, each
//! optionally conditional on a caveat expression. Union, intersection and
//! subtraction combine conditions rather than discarding members whose
//! membership merely became conditional.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::caveats::{caveat_and, caveat_or, CaveatExpression};
use crate::tuple::WILDCARD_OBJECT_ID;

/// An element storable in a [`BaseSubjectSet`].
pub trait SetElement: Clone {
    /// The element's object ID; the wildcard uses `*`.
    fn subject_id(&self) -> &str;

    /// Condition under which the element is a member; `None` means
    /// unconditional.
    fn caveat_expression(&self) -> Option<&CaveatExpression>;

    /// Subjects carved out of a wildcard element. Empty for concrete
    /// members.
    fn excluded_subjects(&self) -> &[Self];
}

/// Builds a replacement element from an ID, membership condition,
/// exclusions, and the source elements whose provenance it inherits.
pub type SubjectFactory<S> =
    Arc<dyn Fn(&str, Option<CaveatExpression>, Vec<S>, &[&S]) -> S + Send + Sync>;

pub struct BaseSubjectSet<S: SetElement> {
    factory: SubjectFactory<S>,
    concrete: BTreeMap<String, S>,
    wildcard: Option<S>,
}

impl<S: SetElement> BaseSubjectSet<S> {
    pub fn new(factory: SubjectFactory<S>) -> Self {
        Self {
            factory,
            concrete: BTreeMap::new(),
            wildcard: None,
        }
    }

    fn rebuild(
        &self,
        subject_id: &str,
        caveat: Option<CaveatExpression>,
        excluded: Vec<S>,
        sources: &[&S],
    ) -> S {
        (self.factory)(subject_id, caveat, excluded, sources)
    }

    /// Inserts a subject, merging conditions with any existing member of
    /// the same ID: membership on either side suffices, so conditions
    /// disjoin and an unconditional side absorbs.
    pub fn add(&mut self, subject: S) {
        if subject.subject_id() == WILDCARD_OBJECT_ID {
            self.add_wildcard(subject);
        } else {
            self.add_concrete(subject);
        }
    }

    fn add_concrete(&mut self, subject: S) {
        let id = subject.subject_id().to_string();
        match self.concrete.remove(&id) {
            None => {
                self.concrete.insert(id, subject);
            }
            Some(existing) => {
                let caveat = caveat_or(
                    existing.caveat_expression().cloned(),
                    subject.caveat_expression().cloned(),
                );
                let merged = self.rebuild(&id, caveat, Vec::new(), &[&existing, &subject]);
                self.concrete.insert(id, merged);
            }
        }
    }

    fn add_wildcard(&mut self, subject: S) {
        match self.wildcard.take() {
            None => self.wildcard = Some(subject),
            Some(existing) => {
                let caveat = caveat_or(
                    existing.caveat_expression().cloned(),
                    subject.caveat_expression().cloned(),
                );
                // an exclusion survives the union only when excluded on
                // both sides
                let mut excluded = Vec::new();
                for entry in existing.excluded_subjects() {
                    if let Some(other) = find_excluded(&subject, entry.subject_id()) {
                        let exclusion = caveat_and(
                            entry.caveat_expression().cloned(),
                            other.caveat_expression().cloned(),
                        );
                        excluded.push(self.rebuild(
                            entry.subject_id(),
                            exclusion,
                            Vec::new(),
                            &[entry, other],
                        ));
                    }
                }
                let merged =
                    self.rebuild(WILDCARD_OBJECT_ID, caveat, excluded, &[&existing, &subject]);
                self.wildcard = Some(merged);
            }
        }
    }

    /// In-place union with another set.
    pub fn union_with(&mut self, other: &Self) {
        for subject in other.concrete.values() {
            self.add_concrete(subject.clone());
        }
        if let Some(wildcard) = &other.wildcard {
            self.add_wildcard(wildcard.clone());
        }
    }

    /// In-place subtraction of another set.
    pub fn subtract(&mut self, other: &Self) {
        // named subtrahends against named members
        for (id, removed) in &other.concrete {
            if let Some(existing) = self.concrete.remove(id) {
                let keep = Condition::from_caveat(existing.caveat_expression())
                    .and(Condition::from_caveat(removed.caveat_expression()).invert());
                if let Some(caveat) = keep.into_caveat() {
                    let survivor = self.rebuild(id, caveat, Vec::new(), &[&existing]);
                    self.concrete.insert(id.clone(), survivor);
                }
            }
        }

        // named subtrahends punch holes in our wildcard
        if !other.concrete.is_empty() {
            if let Some(wildcard) = self.wildcard.take() {
                let mut excluded: Vec<S> = wildcard.excluded_subjects().to_vec();
                for (id, removed) in &other.concrete {
                    match excluded.iter().position(|e| e.subject_id() == id.as_str()) {
                        Some(position) => {
                            let prior = excluded[position].clone();
                            let exclusion = caveat_or(
                                prior.caveat_expression().cloned(),
                                removed.caveat_expression().cloned(),
                            );
                            excluded[position] =
                                self.rebuild(id, exclusion, Vec::new(), &[&prior, removed]);
                        }
                        None => {
                            let exclusion = removed.caveat_expression().cloned();
                            excluded.push(self.rebuild(id, exclusion, Vec::new(), &[removed]));
                        }
                    }
                }
                self.wildcard = Some(self.rebuild(
                    WILDCARD_OBJECT_ID,
                    wildcard.caveat_expression().cloned(),
                    excluded,
                    &[&wildcard],
                ));
            }
        }

        // a wildcard subtrahend removes every member it covers
        if let Some(other_wildcard) = &other.wildcard {
            let other_cond = Condition::from_caveat(other_wildcard.caveat_expression());

            let members = std::mem::take(&mut self.concrete);
            for (id, existing) in members {
                let removal = other_cond
                    .clone()
                    .and(exclusion_condition(other_wildcard, &id).invert());
                let keep =
                    Condition::from_caveat(existing.caveat_expression()).and(removal.invert());
                if let Some(caveat) = keep.into_caveat() {
                    let survivor = self.rebuild(&id, caveat, Vec::new(), &[&existing]);
                    self.concrete.insert(id, survivor);
                }
            }

            if let Some(wildcard) = self.wildcard.take() {
                // subjects excluded from the subtrahend wildcard but still
                // covered by ours come back as concrete members
                let covering = Condition::from_caveat(wildcard.caveat_expression());
                for entry in other_wildcard.excluded_subjects() {
                    let id = entry.subject_id();
                    let member_of_self =
                        covering.clone().and(exclusion_condition(&wildcard, id).invert());
                    let removal = other_cond
                        .clone()
                        .and(Condition::from_exclusion(entry).invert());
                    let keep = member_of_self.and(removal.invert());
                    if let Some(caveat) = keep.into_caveat() {
                        let resurrected = self.rebuild(id, caveat, Vec::new(), &[entry]);
                        self.add_concrete(resurrected);
                    }
                }

                let keep = covering.and(other_cond.invert());
                if let Some(caveat) = keep.into_caveat() {
                    self.wildcard = Some(self.rebuild(
                        WILDCARD_OBJECT_ID,
                        caveat,
                        wildcard.excluded_subjects().to_vec(),
                        &[&wildcard],
                    ));
                }
            }
        }
    }

    /// In-place intersection with another set. Membership on each side is
    /// the disjunction of the named entry and wildcard coverage; the
    /// intersection conjoins the sides. When both sets hold a wildcard it
    /// is kept alongside the concrete intersections.
    pub fn intersection_difference(&mut self, other: &Self) {
        let self_wildcard = self.wildcard.take();
        let members = std::mem::take(&mut self.concrete);

        let mut ids: Vec<String> = members.keys().cloned().collect();
        for id in other.concrete.keys() {
            if !members.contains_key(id) {
                ids.push(id.clone());
            }
        }

        for id in ids {
            let ours = members.get(&id);
            let theirs = other.concrete.get(&id);
            let in_self = membership_condition(ours, self_wildcard.as_ref(), &id);
            let in_other = membership_condition(theirs, other.wildcard.as_ref(), &id);
            if let Some(caveat) = in_self.and(in_other).into_caveat() {
                let mut sources: Vec<&S> = Vec::new();
                sources.extend(ours);
                sources.extend(theirs);
                let merged = self.rebuild(&id, caveat, Vec::new(), &sources);
                self.concrete.insert(id, merged);
            }
        }

        self.wildcard = match (self_wildcard, &other.wildcard) {
            (Some(ours), Some(theirs)) => {
                let caveat = caveat_and(
                    ours.caveat_expression().cloned(),
                    theirs.caveat_expression().cloned(),
                );
                // excluded from the intersection when excluded from either
                // side
                let mut excluded: Vec<S> = ours.excluded_subjects().to_vec();
                for entry in theirs.excluded_subjects() {
                    match excluded
                        .iter()
                        .position(|e| e.subject_id() == entry.subject_id())
                    {
                        Some(position) => {
                            let prior = excluded[position].clone();
                            let exclusion = caveat_or(
                                prior.caveat_expression().cloned(),
                                entry.caveat_expression().cloned(),
                            );
                            excluded[position] = self.rebuild(
                                entry.subject_id(),
                                exclusion,
                                Vec::new(),
                                &[&prior, entry],
                            );
                        }
                        None => excluded.push(entry.clone()),
                    }
                }
                Some(self.rebuild(WILDCARD_OBJECT_ID, caveat, excluded, &[&ours, theirs]))
            }
            _ => None,
        };
    }

    /// Returns a copy of the set with every member's condition conjoined
    /// with the given parent expression.
    pub fn with_parent_caveat_expression(&self, expression: &CaveatExpression) -> Self {
        let mut out = Self::new(self.factory.clone());
        for (id, subject) in &self.concrete {
            let caveat = caveat_and(
                Some(expression.clone()),
                subject.caveat_expression().cloned(),
            );
            let rebuilt = out.rebuild(id, caveat, subject.excluded_subjects().to_vec(), &[subject]);
            out.concrete.insert(id.clone(), rebuilt);
        }
        if let Some(wildcard) = &self.wildcard {
            let caveat = caveat_and(
                Some(expression.clone()),
                wildcard.caveat_expression().cloned(),
            );
            out.wildcard = Some(out.rebuild(
                WILDCARD_OBJECT_ID,
                caveat,
                wildcard.excluded_subjects().to_vec(),
                &[wildcard],
            ));
        }
        out
    }

    pub fn get(&self, subject_id: &str) -> Option<&S> {
        if subject_id == WILDCARD_OBJECT_ID {
            self.wildcard.as_ref()
        } else {
            self.concrete.get(subject_id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.concrete.is_empty() && self.wildcard.is_none()
    }

    /// All members, concrete first in ID order, wildcard last.
    pub fn as_slice(&self) -> Vec<S> {
        let mut out: Vec<S> = self.concrete.values().cloned().collect();
        out.extend(self.wildcard.clone());
        out
    }
}

impl<S: SetElement> Clone for BaseSubjectSet<S> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            concrete: self.concrete.clone(),
            wildcard: self.wildcard.clone(),
        }
    }
}

impl<S: SetElement + fmt::Debug> fmt::Debug for BaseSubjectSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseSubjectSet")
            .field("concrete", &self.concrete)
            .field("wildcard", &self.wildcard)
            .finish()
    }
}

fn find_excluded<'a, S: SetElement>(wildcard: &'a S, subject_id: &str) -> Option<&'a S> {
    wildcard
        .excluded_subjects()
        .iter()
        .find(|e| e.subject_id() == subject_id)
}

fn exclusion_condition<S: SetElement>(wildcard: &S, subject_id: &str) -> Condition {
    match find_excluded(wildcard, subject_id) {
        Some(entry) => Condition::from_exclusion(entry),
        None => Condition::Never,
    }
}

fn membership_condition<S: SetElement>(
    entry: Option<&S>,
    wildcard: Option<&S>,
    subject_id: &str,
) -> Condition {
    let named = match entry {
        Some(subject) => Condition::from_caveat(subject.caveat_expression()),
        None => Condition::Never,
    };
    let covered = match wildcard {
        Some(w) => Condition::from_caveat(w.caveat_expression())
            .and(exclusion_condition(w, subject_id).invert()),
        None => Condition::Never,
    };
    named.or(covered)
}

/// Three-valued membership condition used to fold the algebra without
/// materializing trivially true or false caveat expressions.
#[derive(Clone)]
enum Condition {
    Always,
    Never,
    When(CaveatExpression),
}

impl Condition {
    fn from_caveat(caveat: Option<&CaveatExpression>) -> Self {
        match caveat {
            None => Condition::Always,
            Some(expression) => Condition::When(expression.clone()),
        }
    }

    fn from_exclusion<S: SetElement>(entry: &S) -> Self {
        Self::from_caveat(entry.caveat_expression())
    }

    fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Never, _) | (_, Condition::Never) => Condition::Never,
            (Condition::Always, other) => other,
            (this, Condition::Always) => this,
            (Condition::When(a), Condition::When(b)) => Condition::When(CaveatExpression::and(a, b)),
        }
    }

    fn or(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Always, _) | (_, Condition::Always) => Condition::Always,
            (Condition::Never, other) => other,
            (this, Condition::Never) => this,
            (Condition::When(a), Condition::When(b)) => Condition::When(CaveatExpression::or(a, b)),
        }
    }

    fn invert(self) -> Condition {
        match self {
            Condition::Always => Condition::Never,
            Condition::Never => Condition::Always,
            Condition::When(expression) => Condition::When(CaveatExpression::negate(expression)),
        }
    }

    /// `None` when membership can never hold; otherwise the caveat to
    /// store on the member (`None` inside for unconditional).
    fn into_caveat(self) -> Option<Option<CaveatExpression>> {
        match self {
            Condition::Never => None,
            Condition::Always => Some(None),
            Condition::When(expression) => Some(Some(expression)),
        }
    }
}
