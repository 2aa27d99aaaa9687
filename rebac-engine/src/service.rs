//! The ACL service facade: validates wire-shaped arguments, resolves
//! revisions, enforces the schema on writes, and delegates to the
//! dispatchers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::check::{DispatchConfig, Membership, PermissionChecker};
use crate::datastore::{Datastore, FilterField, RelationshipFilter, Revision};
use crate::error::{EngineError, Result};
use crate::expand::{ExpandTree, SubjectExpander};
use crate::tuple::{ObjectAndRelation, Relationship, RelationshipUpdate, UpdateOperation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub tuplesets: Vec<RelationshipFilter>,
    pub at_revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub tuplesets: Vec<Vec<Relationship>>,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub preconditions: Vec<Relationship>,
    pub updates: Vec<RelationshipUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub at_revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChangeCheckRequest {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub membership: Membership,
    pub revision: Revision,
}

impl CheckResponse {
    pub fn is_member(&self) -> bool {
        self.membership == Membership::Member
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub resource: ObjectAndRelation,
    pub at_revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandResponse {
    pub tree: ExpandTree,
    pub revision: Revision,
}

/// Read / Write / Check / ContentChangeCheck / Expand entry points over a
/// shared datastore handle.
pub struct AclService {
    datastore: Arc<dyn Datastore>,
    checker: PermissionChecker,
    expander: SubjectExpander,
}

impl AclService {
    pub fn new(datastore: Arc<dyn Datastore>, config: DispatchConfig) -> Self {
        let checker = PermissionChecker::new(datastore.clone(), config.clone());
        let expander = SubjectExpander::new(datastore.clone(), config);
        Self {
            datastore,
            checker,
            expander,
        }
    }

    /// Reads the relationships matching each filter at the requested
    /// revision.
    pub async fn read(&self, request: &ReadRequest) -> Result<ReadResponse> {
        self.datastore.check_revision(request.at_revision).await?;

        let mut tuplesets = Vec::with_capacity(request.tuplesets.len());
        for filter in &request.tuplesets {
            filter.validate()?;

            let namespace = self
                .datastore
                .read_namespace(&filter.namespace, request.at_revision)
                .await?;
            if filter.is_active(FilterField::Relation) {
                let relation = filter.relation.as_deref().unwrap_or_default();
                if namespace.relation(relation).is_none() {
                    return Err(EngineError::RelationNotFound {
                        namespace: filter.namespace.clone(),
                        relation: relation.to_string(),
                    });
                }
            }

            let matched = self
                .datastore
                .query_relationships(filter, request.at_revision)
                .await?;
            tuplesets.push(matched);
        }

        debug!(tuplesets = tuplesets.len(), "read completed");
        Ok(ReadResponse {
            tuplesets,
            revision: request.at_revision,
        })
    }

    /// Applies the updates atomically, provided the precondition
    /// relationships exist at the pre-write snapshot.
    pub async fn write(&self, request: &WriteRequest) -> Result<WriteResponse> {
        for precondition in &request.preconditions {
            precondition.validate()?;
        }
        for update in &request.updates {
            update.relationship.validate()?;
        }

        let head = self.datastore.revision().await?;
        for update in &request.updates {
            if update.operation != UpdateOperation::Delete {
                self.validate_against_schema(&update.relationship, head)
                    .await?;
            }
        }

        let revision = self
            .datastore
            .write_relationships(&request.preconditions, &request.updates)
            .await?;
        info!(updates = request.updates.len(), revision = %revision, "write committed");
        Ok(WriteResponse { revision })
    }

    /// Membership of the subject at the requested revision.
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        self.datastore.check_revision(request.at_revision).await?;
        let membership = self
            .checker
            .check(&request.resource, &request.subject, request.at_revision)
            .await?;
        Ok(CheckResponse {
            membership,
            revision: request.at_revision,
        })
    }

    /// Membership at the head revision, for content-change admission; no
    /// caller-supplied token is involved.
    pub async fn content_change_check(
        &self,
        request: &ContentChangeCheckRequest,
    ) -> Result<CheckResponse> {
        let head = self.datastore.sync_revision().await?;
        let membership = self
            .checker
            .check(&request.resource, &request.subject, head)
            .await?;
        Ok(CheckResponse {
            membership,
            revision: head,
        })
    }

    /// The full subject tree of the resource's relation or permission.
    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandResponse> {
        self.datastore.check_revision(request.at_revision).await?;
        let tree = self
            .expander
            .expand(&request.resource, request.at_revision)
            .await?;
        Ok(ExpandResponse {
            tree,
            revision: request.at_revision,
        })
    }

    /// Schema enforcement for one mutation: the resource relation must
    /// exist, must not be a permission, and must admit the subject's type
    /// and caveat.
    async fn validate_against_schema(
        &self,
        relationship: &Relationship,
        revision: Revision,
    ) -> Result<()> {
        let namespace = self
            .datastore
            .read_namespace(&relationship.resource.namespace, revision)
            .await?;
        let relation = namespace
            .relation(&relationship.resource.relation)
            .ok_or_else(|| EngineError::RelationNotFound {
                namespace: relationship.resource.namespace.clone(),
                relation: relationship.resource.relation.clone(),
            })?;

        if relation.is_permission() {
            return Err(EngineError::PreconditionFailed(format!(
                "cannot write relationship `{relationship}`: `{}` is a permission",
                relationship.resource.relation
            )));
        }

        let caveat_name = relationship
            .caveat
            .as_ref()
            .map(|reference| reference.caveat_name.as_str());
        let admitted = relation
            .allowed_direct_relations()
            .iter()
            .any(|allowed| {
                allowed.allows(&relationship.subject)
                    && allowed.required_caveat.as_deref() == caveat_name
            });
        if !admitted {
            return Err(EngineError::PreconditionFailed(format!(
                "subject of `{relationship}` is not an allowed type for `{}#{}`",
                relationship.resource.namespace, relationship.resource.relation
            )));
        }

        if let Some(reference) = &relationship.caveat {
            let definition = self
                .datastore
                .read_caveat(&reference.caveat_name, revision)
                .await?;
            for (name, value) in &reference.context {
                if let Some(parameter_type) = definition.parameter_types.get(name) {
                    if !parameter_type.matches(value) {
                        return Err(EngineError::InvalidArgument(format!(
                            "caveat context value for `{name}` is not a {parameter_type}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
