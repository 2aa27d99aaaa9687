//! Expansion of a relation or permission into the full tree of subject
//! sets, mirroring the rewrite structure, plus the bottom-up
//! simplification into a single tracking set.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::check::{DispatchConfig, TraversalPath};
use crate::datastore::{Datastore, RelationshipFilter, Revision};
use crate::error::{EngineError, Result};
use crate::membership::{FoundSubject, TrackingSubjectSet};
use crate::schema::{SetOperationChild, UsersetRewrite};
use crate::tuple::{ObjectAndRelation, Subject};

/// A node in the expansion result. Internal nodes mirror the set
/// operators of the rewrite; leaves hold the subjects found by direct
/// lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandTree {
    /// The object and relation this subtree expands.
    pub expanded: ObjectAndRelation,
    pub node: ExpandNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpandNode {
    Leaf { subjects: Vec<FoundSubject> },
    Union(Vec<ExpandTree>),
    Intersection(Vec<ExpandTree>),
    Exclusion(Vec<ExpandTree>),
}

/// Applies the subject-set algebra bottom-up, producing the reachable
/// subject set of the tree.
pub fn simplify(tree: &ExpandTree) -> TrackingSubjectSet {
    match &tree.node {
        ExpandNode::Leaf { subjects } => TrackingSubjectSet::with_subjects(subjects.iter().cloned()),
        ExpandNode::Union(children) => {
            let mut set = TrackingSubjectSet::new();
            for child in children {
                set.add_from(&simplify(child));
            }
            set
        }
        ExpandNode::Intersection(children) => {
            let mut children = children.iter();
            let Some(first) = children.next() else {
                return TrackingSubjectSet::new();
            };
            let mut set = simplify(first);
            for child in children {
                set = set.intersect(&simplify(child));
            }
            set
        }
        ExpandNode::Exclusion(children) => {
            let mut children = children.iter();
            let Some(first) = children.next() else {
                return TrackingSubjectSet::new();
            };
            let mut set = simplify(first);
            for child in children {
                set = set.exclude(&simplify(child));
            }
            set
        }
    }
}

pub struct SubjectExpander {
    datastore: Arc<dyn Datastore>,
    config: DispatchConfig,
}

struct ExpandContext {
    datastore: Arc<dyn Datastore>,
    revision: Revision,
    config: DispatchConfig,
}

impl SubjectExpander {
    pub fn new(datastore: Arc<dyn Datastore>, config: DispatchConfig) -> Self {
        Self { datastore, config }
    }

    /// Expands the resource's relation or permission at the revision.
    pub async fn expand(
        &self,
        resource: &ObjectAndRelation,
        revision: Revision,
    ) -> Result<ExpandTree> {
        resource.validate_as_resource()?;
        let ctx = Arc::new(ExpandContext {
            datastore: self.datastore.clone(),
            revision,
            config: self.config.clone(),
        });
        expand_internal(ctx, resource.clone(), TraversalPath::root()).await
    }
}

fn expand_internal(
    ctx: Arc<ExpandContext>,
    resource: ObjectAndRelation,
    path: TraversalPath,
) -> BoxFuture<'static, Result<ExpandTree>> {
    Box::pin(async move {
        let key = resource.to_string();
        if path.contains(&key) {
            debug!(resource = %resource, "cycle encountered, pruning expansion");
            return Ok(ExpandTree {
                expanded: resource,
                node: ExpandNode::Leaf {
                    subjects: Vec::new(),
                },
            });
        }
        if path.depth() >= ctx.config.max_depth {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "maximum dispatch depth {} exceeded expanding {resource}",
                ctx.config.max_depth
            )));
        }
        let path = path.push(key);

        let namespace = ctx
            .datastore
            .read_namespace(&resource.namespace, ctx.revision)
            .await?;
        let relation = namespace.relation(&resource.relation).ok_or_else(|| {
            EngineError::RelationNotFound {
                namespace: resource.namespace.clone(),
                relation: resource.relation.clone(),
            }
        })?;

        let node = match relation.userset_rewrite.clone() {
            Some(rewrite) => expand_rewrite(&ctx, &resource, rewrite, &path).await?,
            None => expand_this(&ctx, &resource).await?,
        };
        Ok(ExpandTree {
            expanded: resource,
            node,
        })
    })
}

async fn expand_rewrite(
    ctx: &Arc<ExpandContext>,
    resource: &ObjectAndRelation,
    rewrite: UsersetRewrite,
    path: &TraversalPath,
) -> Result<ExpandNode> {
    match rewrite {
        UsersetRewrite::Union(children) => Ok(ExpandNode::Union(
            expand_children(ctx, resource, children, path).await?,
        )),
        UsersetRewrite::Intersection(children) => Ok(ExpandNode::Intersection(
            expand_children(ctx, resource, children, path).await?,
        )),
        UsersetRewrite::Exclusion(children) => Ok(ExpandNode::Exclusion(
            expand_children(ctx, resource, children, path).await?,
        )),
    }
}

/// Expands the operator's children concurrently, preserving child order.
async fn expand_children(
    ctx: &Arc<ExpandContext>,
    resource: &ObjectAndRelation,
    children: Vec<SetOperationChild>,
    path: &TraversalPath,
) -> Result<Vec<ExpandTree>> {
    let branches: Vec<BoxFuture<'static, Result<ExpandTree>>> = children
        .into_iter()
        .map(|child| expand_child(ctx.clone(), resource.clone(), child, path.clone()))
        .collect();
    stream::iter(branches)
        .buffered(ctx.config.concurrency_limit.max(1))
        .try_collect()
        .await
}

fn expand_child(
    ctx: Arc<ExpandContext>,
    resource: ObjectAndRelation,
    child: SetOperationChild,
    path: TraversalPath,
) -> BoxFuture<'static, Result<ExpandTree>> {
    Box::pin(async move {
        match child {
            SetOperationChild::This => {
                let node = expand_this(&ctx, &resource).await?;
                Ok(ExpandTree {
                    expanded: resource,
                    node,
                })
            }
            SetOperationChild::Nil => Ok(ExpandTree {
                expanded: resource,
                node: ExpandNode::Leaf {
                    subjects: Vec::new(),
                },
            }),
            SetOperationChild::ComputedUserset { relation } => {
                let computed =
                    ObjectAndRelation::new(&resource.namespace, &resource.object_id, &relation);
                expand_internal(ctx, computed, path).await
            }
            SetOperationChild::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => {
                let filter = RelationshipFilter::namespace(&resource.namespace)
                    .with_object_id(&resource.object_id)
                    .with_relation(&tupleset_relation);
                let relationships = ctx
                    .datastore
                    .query_relationships(&filter, ctx.revision)
                    .await?;

                let mut branches: Vec<BoxFuture<'static, Result<ExpandTree>>> = Vec::new();
                for relationship in relationships {
                    // wildcards cannot be walked
                    let Subject::Object(walked) = &relationship.subject else {
                        continue;
                    };
                    let target = ObjectAndRelation::new(
                        &walked.namespace,
                        &walked.object_id,
                        &computed_relation,
                    );
                    let parent_caveat = relationship
                        .caveat
                        .clone()
                        .map(crate::caveats::CaveatExpression::caveat);
                    let ctx = ctx.clone();
                    let path = path.clone();
                    branches.push(Box::pin(async move {
                        let mut subtree = expand_internal(ctx, target, path).await?;
                        // a caveat on the walked relationship conditions
                        // everything found through it
                        if let Some(expression) = parent_caveat {
                            conjoin_tree_caveat(&mut subtree, &expression);
                        }
                        Ok(subtree)
                    }));
                }
                let subtrees: Vec<ExpandTree> = stream::iter(branches)
                    .buffered(ctx.config.concurrency_limit.max(1))
                    .try_collect()
                    .await?;
                Ok(ExpandTree {
                    expanded: ObjectAndRelation::new(
                        &resource.namespace,
                        &resource.object_id,
                        &tupleset_relation,
                    ),
                    node: ExpandNode::Union(subtrees),
                })
            }
            SetOperationChild::Rewrite(rewrite) => {
                let node = expand_rewrite(&ctx, &resource, rewrite, &path).await?;
                Ok(ExpandTree {
                    expanded: resource,
                    node,
                })
            }
        }
    })
}

/// Direct lookup leaf: every stored subject becomes a found subject,
/// caveat references carried as conditional membership. Userset subjects
/// stay as subjects; checks recurse into them, expansion does not.
async fn expand_this(ctx: &Arc<ExpandContext>, resource: &ObjectAndRelation) -> Result<ExpandNode> {
    let filter = RelationshipFilter::namespace(&resource.namespace)
        .with_object_id(&resource.object_id)
        .with_relation(&resource.relation);
    let relationships = ctx
        .datastore
        .query_relationships(&filter, ctx.revision)
        .await?;

    let subjects = relationships
        .iter()
        .map(FoundSubject::from_relationship)
        .collect();
    Ok(ExpandNode::Leaf { subjects })
}

fn conjoin_tree_caveat(tree: &mut ExpandTree, expression: &crate::caveats::CaveatExpression) {
    match &mut tree.node {
        ExpandNode::Leaf { subjects } => {
            for subject in subjects {
                subject.conjoin_caveat(expression);
            }
        }
        ExpandNode::Union(children)
        | ExpandNode::Intersection(children)
        | ExpandNode::Exclusion(children) => {
            for child in children {
                conjoin_tree_caveat(child, expression);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::InMemoryDatastore;
    use crate::schema::{AllowedRelation, NamespaceDefinition, RelationDef};
    use crate::tuple::{Relationship, RelationshipUpdate};

    async fn store_with(
        definitions: Vec<NamespaceDefinition>,
        relationships: &[&str],
    ) -> (Arc<InMemoryDatastore>, Revision) {
        let store = Arc::new(InMemoryDatastore::with_unbounded_gc());
        for definition in definitions {
            store.write_namespace(definition).await.unwrap();
        }
        let updates: Vec<RelationshipUpdate> = relationships
            .iter()
            .map(|text| RelationshipUpdate::touch(Relationship::parse(text).unwrap()))
            .collect();
        let revision = store.write_relationships(&[], &updates).await.unwrap();
        (store, revision)
    }

    fn fixture_definitions() -> Vec<NamespaceDefinition> {
        vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "folder",
                vec![
                    RelationDef::relation("banned", vec![AllowedRelation::terminal("user")]),
                    RelationDef::relation("viewer", vec![AllowedRelation::terminal("user")]),
                    RelationDef::permission(
                        "allowed",
                        UsersetRewrite::exclusion(vec![
                            SetOperationChild::computed("viewer"),
                            SetOperationChild::computed("banned"),
                        ]),
                    ),
                ],
            ),
            NamespaceDefinition::new(
                "document",
                vec![
                    RelationDef::relation("parent", vec![AllowedRelation::terminal("folder")]),
                    RelationDef::relation("viewer", vec![AllowedRelation::terminal("user")]),
                    RelationDef::permission(
                        "view",
                        UsersetRewrite::union(vec![
                            SetOperationChild::computed("viewer"),
                            SetOperationChild::arrow("parent", "allowed"),
                        ]),
                    ),
                ],
            ),
        ]
    }

    #[tokio::test]
    async fn test_expand_mirrors_rewrite_shape() {
        let (store, revision) = store_with(
            fixture_definitions(),
            &[
                "document:plan#viewer@user:tom",
                "document:plan#parent@folder:shared",
                "folder:shared#viewer@user:sarah",
                "folder:shared#viewer@user:blake",
                "folder:shared#banned@user:blake",
            ],
        )
        .await;
        let expander = SubjectExpander::new(store, DispatchConfig::default());

        let tree = expander
            .expand(&ObjectAndRelation::new("document", "plan", "view"), revision)
            .await
            .unwrap();

        let ExpandNode::Union(children) = &tree.node else {
            panic!("expected union at the root");
        };
        assert_eq!(children.len(), 2);

        let set = simplify(&tree);
        assert!(set.contains(&Subject::terminal("user", "tom")));
        assert!(set.contains(&Subject::terminal("user", "sarah")));
        // banned inside the folder's exclusion never reaches the union
        assert!(!set.contains(&Subject::terminal("user", "blake")));
        assert_eq!(set.to_slice().len(), 2);
    }

    #[tokio::test]
    async fn test_expand_pure_relation_is_a_leaf() {
        let (store, revision) = store_with(
            fixture_definitions(),
            &["document:plan#viewer@user:tom"],
        )
        .await;
        let expander = SubjectExpander::new(store, DispatchConfig::default());

        let tree = expander
            .expand(
                &ObjectAndRelation::new("document", "plan", "viewer"),
                revision,
            )
            .await
            .unwrap();
        let ExpandNode::Leaf { subjects } = &tree.node else {
            panic!("expected leaf for a pure relation");
        };
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].subject(), &Subject::terminal("user", "tom"));
        assert_eq!(subjects[0].relationships().len(), 1);
    }

    #[tokio::test]
    async fn test_expand_unknown_relation_fails_precondition() {
        let (store, revision) = store_with(fixture_definitions(), &[]).await;
        let expander = SubjectExpander::new(store, DispatchConfig::default());

        let result = expander
            .expand(
                &ObjectAndRelation::new("document", "plan", "fakerelation"),
                revision,
            )
            .await;
        assert!(matches!(result, Err(EngineError::RelationNotFound { .. })));
    }

    #[tokio::test]
    async fn test_caveated_walk_conditions_subtree() {
        let (store, revision) = store_with(
            fixture_definitions(),
            &[
                "document:plan#parent@folder:shared[during_business_hours]",
                "folder:shared#viewer@user:sarah",
            ],
        )
        .await;
        let expander = SubjectExpander::new(store, DispatchConfig::default());

        let tree = expander
            .expand(&ObjectAndRelation::new("document", "plan", "view"), revision)
            .await
            .unwrap();
        let set = simplify(&tree);
        let sarah = set.get(&Subject::terminal("user", "sarah")).unwrap();
        assert!(sarah.caveat_expression().is_some());
    }
}
