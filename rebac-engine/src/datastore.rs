//! The narrow storage contract the evaluator and facade consume, plus
//! the in-memory implementation and the read-only policy proxy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::schema::{CaveatDefinition, NamespaceDefinition};
use crate::tuple::{validate_identifier, Relationship, RelationshipUpdate, Subject};

pub mod memory;
pub mod readonly;

/// An opaque, totally ordered snapshot token issued by a datastore. The
/// engine relies only on ordering and the datastore's GC-window checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Revision(u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn from_raw(raw: u64) -> Self {
        Revision(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Token form suitable for the wire.
    pub fn to_token(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_token(token: &str) -> Result<Self> {
        u64::from_str_radix(token, 16)
            .map(Revision)
            .map_err(|_| EngineError::InvalidArgument(format!("malformed revision token `{token}`")))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

/// The batch of relationship changes committed at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionChanges {
    pub revision: Revision,
    pub changes: Vec<RelationshipUpdate>,
}

/// Fields of a [`RelationshipFilter`] that participate in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterField {
    ObjectId,
    Relation,
    Userset,
}

/// A relationship query filter. The namespace is mandatory; the optional
/// criteria apply only when their marker is present in `active`, so an
/// unset field and an unused field stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub namespace: String,
    pub object_id: Option<String>,
    pub relation: Option<String>,
    pub userset: Option<Subject>,
    pub active: Vec<FilterField>,
}

impl RelationshipFilter {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: None,
            relation: None,
            userset: None,
            active: Vec::new(),
        }
    }

    pub fn with_object_id(mut self, object_id: &str) -> Self {
        self.object_id = Some(object_id.to_string());
        self.active.push(FilterField::ObjectId);
        self
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self.active.push(FilterField::Relation);
        self
    }

    pub fn with_userset(mut self, userset: Subject) -> Self {
        self.userset = Some(userset);
        self.active.push(FilterField::Userset);
        self
    }

    pub fn is_active(&self, field: FilterField) -> bool {
        self.active.contains(&field)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("namespace", &self.namespace)?;

        for field in &self.active {
            match field {
                FilterField::ObjectId => match &self.object_id {
                    Some(object_id) => crate::tuple::validate_object_id(object_id)?,
                    None => {
                        return Err(EngineError::InvalidArgument(
                            "filter marks object ID active but carries none".to_string(),
                        ))
                    }
                },
                FilterField::Relation => match &self.relation {
                    Some(relation) => validate_identifier("relation", relation)?,
                    None => {
                        return Err(EngineError::InvalidArgument(
                            "filter marks relation active but carries none".to_string(),
                        ))
                    }
                },
                FilterField::Userset => match &self.userset {
                    Some(userset) => userset.validate()?,
                    None => {
                        return Err(EngineError::InvalidArgument(
                            "filter marks userset active but carries none".to_string(),
                        ))
                    }
                },
            }
        }

        if self.userset.is_some() && !self.is_active(FilterField::Userset) {
            return Err(EngineError::InvalidArgument(
                "filter carries a userset without marking it active".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a relationship matches the namespace and every active
    /// criterion.
    pub fn matches(&self, relationship: &Relationship) -> bool {
        if relationship.resource.namespace != self.namespace {
            return false;
        }
        if self.is_active(FilterField::ObjectId)
            && self.object_id.as_deref() != Some(relationship.resource.object_id.as_str())
        {
            return false;
        }
        if self.is_active(FilterField::Relation)
            && self.relation.as_deref() != Some(relationship.resource.relation.as_str())
        {
            return false;
        }
        if self.is_active(FilterField::Userset) && self.userset.as_ref() != Some(&relationship.subject)
        {
            return false;
        }
        true
    }
}

/// Streams returned by [`Datastore::watch`]: committed changes and
/// terminal errors.
pub type WatchStreams = (
    mpsc::UnboundedReceiver<RevisionChanges>,
    mpsc::UnboundedReceiver<EngineError>,
);

/// The storage surface the core consumes. Implementations must provide
/// snapshot reads at any revision within the GC window and atomic,
/// precondition-checked writes.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// A revision safe to hand out for reads.
    async fn revision(&self) -> Result<Revision>;

    /// The latest revision observed by the datastore.
    async fn sync_revision(&self) -> Result<Revision>;

    /// Ok when the revision is readable: not newer than the head and not
    /// older than the GC window.
    async fn check_revision(&self, revision: Revision) -> Result<()>;

    async fn read_namespace(&self, name: &str, revision: Revision) -> Result<NamespaceDefinition>;

    async fn write_namespace(&self, definition: NamespaceDefinition) -> Result<Revision>;

    async fn delete_namespace(&self, name: &str) -> Result<Revision>;

    async fn list_namespaces(&self, revision: Revision) -> Result<Vec<NamespaceDefinition>>;

    async fn read_caveat(&self, name: &str, revision: Revision) -> Result<CaveatDefinition>;

    async fn write_caveat(&self, definition: CaveatDefinition) -> Result<Revision>;

    /// Relationships live at the revision and matching the filter.
    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> Result<Vec<Relationship>>;

    /// Relationships whose subject equals the given subject.
    async fn reverse_query_from_subject(
        &self,
        subject: &Subject,
        revision: Revision,
    ) -> Result<Vec<Relationship>>;

    /// Relationships whose subject is any object under the given
    /// namespace and relation.
    async fn reverse_query_from_subject_relation(
        &self,
        namespace: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<Vec<Relationship>>;

    /// Atomically applies the mutations, provided every precondition
    /// relationship exists at the pre-write snapshot. On failure no
    /// mutation is applied.
    async fn write_relationships(
        &self,
        preconditions: &[Relationship],
        mutations: &[RelationshipUpdate],
    ) -> Result<Revision>;

    /// Streams changes committed after the given revision.
    async fn watch(&self, after_revision: Revision) -> Result<WatchStreams>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Subject;

    #[test]
    fn test_filter_requires_marked_fields_present() {
        let mut filter = RelationshipFilter::namespace("document");
        filter.active.push(FilterField::ObjectId);
        assert!(filter.validate().is_err());

        let filter = RelationshipFilter::namespace("document").with_object_id("healthplan");
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_unmarked_userset_is_invalid() {
        let mut filter = RelationshipFilter::namespace("document");
        filter.userset = Some(Subject::terminal("folder", "plans"));
        assert!(filter.validate().is_err());

        let filter = RelationshipFilter::namespace("document")
            .with_userset(Subject::terminal("folder", "plans"));
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_only_active_fields_participate_in_matching() {
        let relationship = Relationship::parse("document:masterplan#parent@folder:plans").unwrap();

        let mut filter = RelationshipFilter::namespace("document");
        // present but unmarked: ignored for matching
        filter.object_id = Some("healthplan".to_string());
        assert!(filter.matches(&relationship));

        let filter = RelationshipFilter::namespace("document").with_object_id("healthplan");
        assert!(!filter.matches(&relationship));

        let filter = RelationshipFilter::namespace("document")
            .with_object_id("masterplan")
            .with_userset(Subject::terminal("folder", "plans"));
        assert!(filter.matches(&relationship));
    }

    #[test]
    fn test_revision_token_round_trip() {
        let revision = Revision::from_raw(42);
        assert_eq!(Revision::from_token(&revision.to_token()).unwrap(), revision);
        assert!(Revision::from_token("not-a-token").is_err());
    }
}
