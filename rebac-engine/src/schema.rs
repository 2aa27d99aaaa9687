use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::caveats::{ParameterType, Predicate};
use crate::error::{EngineError, Result};
use crate::tuple::{validate_identifier, Subject, ELLIPSIS};

/// Comments and other source-derived annotations attached to a definition
/// or relation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub comments: Vec<String>,
}

impl Metadata {
    pub fn with_comment(comment: &str) -> Self {
        Self {
            comments: vec![comment.to_string()],
        }
    }
}

/// A schema entry: an object definition or a caveat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaDefinition {
    Namespace(NamespaceDefinition),
    Caveat(CaveatDefinition),
}

/// A named, parameterized conditional predicate. The expression body is
/// opaque serialized bytes interpreted by the caveat module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaveatDefinition {
    pub name: String,
    pub parameter_types: BTreeMap<String, ParameterType>,
    pub serialized_expression: Vec<u8>,
    pub metadata: Metadata,
}

impl CaveatDefinition {
    pub fn new(
        name: &str,
        parameter_types: BTreeMap<String, ParameterType>,
        expression: &Predicate,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            parameter_types,
            serialized_expression: expression.serialize()?,
            metadata: Metadata::default(),
        })
    }
}

/// An object definition: a named, ordered list of relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    pub relations: Vec<RelationDef>,
    pub metadata: Metadata,
}

impl NamespaceDefinition {
    pub fn new(name: &str, relations: Vec<RelationDef>) -> Self {
        Self {
            name: name.to_string(),
            relations,
            metadata: Metadata::default(),
        }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Structural validation: identifier rules, unique relation names,
    /// type information present wherever direct relationships may land,
    /// and computed userset targets that resolve within the definition.
    pub fn validate(&self) -> Result<()> {
        validate_identifier("namespace", &self.name)?;

        let mut seen = HashSet::new();
        for relation in &self.relations {
            validate_identifier("relation", &relation.name)?;
            if !seen.insert(relation.name.as_str()) {
                return Err(EngineError::PreconditionFailed(format!(
                    "duplicate relation `{}` in definition `{}`",
                    relation.name, self.name
                )));
            }

            if !relation.is_permission() && relation.allowed_direct_relations().is_empty() {
                return Err(EngineError::PreconditionFailed(format!(
                    "relation `{}` in definition `{}` has no allowed direct relations",
                    relation.name, self.name
                )));
            }

            if let Some(rewrite) = &relation.userset_rewrite {
                self.validate_rewrite_targets(&relation.name, rewrite)?;
            }
        }
        Ok(())
    }

    fn validate_rewrite_targets(&self, relation: &str, rewrite: &UsersetRewrite) -> Result<()> {
        for child in rewrite.children() {
            match child {
                SetOperationChild::ComputedUserset { relation: target }
                | SetOperationChild::TupleToUserset {
                    tupleset_relation: target,
                    ..
                } => {
                    if self.relation(target).is_none() {
                        return Err(EngineError::PreconditionFailed(format!(
                            "relation `{relation}` in definition `{}` references unknown relation `{target}`",
                            self.name
                        )));
                    }
                }
                SetOperationChild::Rewrite(nested) => {
                    self.validate_rewrite_targets(relation, nested)?
                }
                SetOperationChild::This | SetOperationChild::Nil => {}
            }
        }
        Ok(())
    }
}

/// A relation or permission within a definition.
///
/// A relation is a permission iff it carries a rewrite and that rewrite
/// never reaches a `this` leaf; every other relation must declare the
/// subject types allowed to relate directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub type_information: Option<TypeInformation>,
    pub userset_rewrite: Option<UsersetRewrite>,
    pub metadata: Metadata,
}

impl RelationDef {
    pub fn relation(name: &str, allowed: Vec<AllowedRelation>) -> Self {
        Self {
            name: name.to_string(),
            type_information: Some(TypeInformation {
                allowed_direct_relations: allowed,
            }),
            userset_rewrite: None,
            metadata: Metadata::default(),
        }
    }

    pub fn permission(name: &str, rewrite: UsersetRewrite) -> Self {
        Self {
            name: name.to_string(),
            type_information: None,
            userset_rewrite: Some(rewrite),
            metadata: Metadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_permission(&self) -> bool {
        self.userset_rewrite
            .as_ref()
            .map(|rewrite| !rewrite.has_this())
            .unwrap_or(false)
    }

    pub fn allowed_direct_relations(&self) -> &[AllowedRelation] {
        self.type_information
            .as_ref()
            .map(|ti| ti.allowed_direct_relations.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInformation {
    pub allowed_direct_relations: Vec<AllowedRelation>,
}

/// A subject type admitted for direct relationships on a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowedRelation {
    pub namespace: String,
    pub target: AllowedTarget,
    pub required_caveat: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AllowedTarget {
    /// Terminal subjects of the namespace, e.g. `user`.
    Ellipsis,
    /// Subjects reached through a relation, e.g. `folder#viewer`.
    Relation(String),
    /// The public wildcard, e.g. `user:*`.
    PublicWildcard,
}

impl AllowedRelation {
    pub fn terminal(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            target: AllowedTarget::Ellipsis,
            required_caveat: None,
        }
    }

    pub fn with_relation(namespace: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            target: AllowedTarget::Relation(relation.to_string()),
            required_caveat: None,
        }
    }

    pub fn wildcard(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            target: AllowedTarget::PublicWildcard,
            required_caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat_name: &str) -> Self {
        self.required_caveat = Some(caveat_name.to_string());
        self
    }

    /// Whether a concrete subject matches this allowance, caveat aside.
    pub fn allows(&self, subject: &Subject) -> bool {
        if subject.namespace() != self.namespace {
            return false;
        }
        match (&self.target, subject) {
            (AllowedTarget::Ellipsis, Subject::Object(onr)) => onr.relation == ELLIPSIS,
            (AllowedTarget::Relation(relation), Subject::Object(onr)) => onr.relation == *relation,
            (AllowedTarget::PublicWildcard, Subject::Wildcard { .. }) => true,
            _ => false,
        }
    }
}

/// An algebraic description of how a relation's subject set is computed.
/// Child order is preserved for canonical emission; exclusion is
/// left-associative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UsersetRewrite {
    Union(Vec<SetOperationChild>),
    Intersection(Vec<SetOperationChild>),
    Exclusion(Vec<SetOperationChild>),
}

impl UsersetRewrite {
    pub fn union(children: Vec<SetOperationChild>) -> Self {
        UsersetRewrite::Union(children)
    }

    pub fn intersection(children: Vec<SetOperationChild>) -> Self {
        UsersetRewrite::Intersection(children)
    }

    pub fn exclusion(children: Vec<SetOperationChild>) -> Self {
        UsersetRewrite::Exclusion(children)
    }

    pub fn children(&self) -> &[SetOperationChild] {
        match self {
            UsersetRewrite::Union(children)
            | UsersetRewrite::Intersection(children)
            | UsersetRewrite::Exclusion(children) => children,
        }
    }

    /// True when any leaf of the rewrite is a direct-relationship lookup.
    pub fn has_this(&self) -> bool {
        self.children().iter().any(|child| match child {
            SetOperationChild::This => true,
            SetOperationChild::Rewrite(nested) => nested.has_this(),
            _ => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetOperationChild {
    /// Direct relationship lookup on the evaluated relation.
    This,
    /// The empty set.
    Nil,
    /// Same object, different relation.
    ComputedUserset { relation: String },
    /// Walk a tupleset relation, then evaluate a relation on each walked
    /// object.
    TupleToUserset {
        tupleset_relation: String,
        computed_relation: String,
    },
    Rewrite(UsersetRewrite),
}

impl SetOperationChild {
    pub fn computed(relation: &str) -> Self {
        SetOperationChild::ComputedUserset {
            relation: relation.to_string(),
        }
    }

    pub fn arrow(tupleset_relation: &str, computed_relation: &str) -> Self {
        SetOperationChild::TupleToUserset {
            tupleset_relation: tupleset_relation.to_string(),
            computed_relation: computed_relation.to_string(),
        }
    }
}
