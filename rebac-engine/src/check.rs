//! Recursive permission check over the rewrite tree.
//!
//! Sibling branches evaluate concurrently under a bounded fan-out and are
//! dropped (cancelled) as soon as the surrounding operator short-circuits.
//! Cycles are broken per traversal path: re-entering an in-progress
//! (resource, relation, subject) evaluates to NOT_MEMBER on that path.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::caveats::{Evaluation, Predicate};
use crate::datastore::{Datastore, RelationshipFilter, Revision};
use crate::error::{EngineError, Result};
use crate::schema::{SetOperationChild, UsersetRewrite};
use crate::tuple::{ObjectAndRelation, Relationship, Subject, ELLIPSIS};

/// Verdict of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Member,
    NotMember,
}

/// Tunables shared by the check and expand dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrently evaluating sibling branches.
    pub concurrency_limit: usize,
    /// Maximum dispatch depth before the evaluation is abandoned.
    pub max_depth: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 50,
            max_depth: 50,
        }
    }
}

/// The set of (resource, relation, subject) keys on the current traversal
/// path, shared structurally between sibling branches.
#[derive(Clone)]
pub(crate) struct TraversalPath(Option<Arc<PathNode>>);

pub(crate) struct PathNode {
    key: String,
    depth: u32,
    parent: TraversalPath,
}

impl TraversalPath {
    pub(crate) fn root() -> Self {
        TraversalPath(None)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        let mut current = &self.0;
        while let Some(node) = current {
            if node.key == key {
                return true;
            }
            current = &node.parent.0;
        }
        false
    }

    pub(crate) fn depth(&self) -> u32 {
        self.0.as_ref().map(|node| node.depth).unwrap_or(0)
    }

    pub(crate) fn push(&self, key: String) -> Self {
        TraversalPath(Some(Arc::new(PathNode {
            key,
            depth: self.depth() + 1,
            parent: self.clone(),
        })))
    }
}

pub struct PermissionChecker {
    datastore: Arc<dyn Datastore>,
    config: DispatchConfig,
}

struct CheckContext {
    datastore: Arc<dyn Datastore>,
    revision: Revision,
    config: DispatchConfig,
    completed: DashMap<String, Membership>,
    cycle_epoch: AtomicU64,
}

impl PermissionChecker {
    pub fn new(datastore: Arc<dyn Datastore>, config: DispatchConfig) -> Self {
        Self { datastore, config }
    }

    /// Computes whether the subject is a member of the resource's
    /// relation or permission at the given revision.
    pub async fn check(
        &self,
        resource: &ObjectAndRelation,
        subject: &ObjectAndRelation,
        revision: Revision,
    ) -> Result<Membership> {
        resource.validate_as_resource()?;
        subject.validate_as_subject()?;

        let ctx = Arc::new(CheckContext {
            datastore: self.datastore.clone(),
            revision,
            config: self.config.clone(),
            completed: DashMap::new(),
            cycle_epoch: AtomicU64::new(0),
        });
        check_internal(ctx, resource.clone(), subject.clone(), TraversalPath::root()).await
    }
}

fn check_internal(
    ctx: Arc<CheckContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    path: TraversalPath,
) -> BoxFuture<'static, Result<Membership>> {
    Box::pin(async move {
        let key = format!("{resource}@{subject}");
        if let Some(done) = ctx.completed.get(&key) {
            return Ok(*done);
        }
        if path.contains(&key) {
            debug!(resource = %resource, "cycle encountered, pruning branch");
            ctx.cycle_epoch.fetch_add(1, Ordering::Relaxed);
            return Ok(Membership::NotMember);
        }
        if path.depth() >= ctx.config.max_depth {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "maximum dispatch depth {} exceeded checking {resource}",
                ctx.config.max_depth
            )));
        }
        let path = path.push(key.clone());

        debug!(resource = %resource, subject = %subject, "dispatching check");

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

        let epoch_before = ctx.cycle_epoch.load(Ordering::Relaxed);
        let membership = match relation.userset_rewrite.clone() {
            Some(rewrite) => {
                eval_rewrite(ctx.clone(), resource.clone(), subject.clone(), rewrite, path).await?
            }
            None => check_this(ctx.clone(), resource.clone(), subject.clone(), path).await?,
        };

        // results computed below a pruned cycle hold only for their path
        if ctx.cycle_epoch.load(Ordering::Relaxed) == epoch_before {
            ctx.completed.insert(key, membership);
        }
        Ok(membership)
    })
}

fn eval_rewrite(
    ctx: Arc<CheckContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    rewrite: UsersetRewrite,
    path: TraversalPath,
) -> BoxFuture<'static, Result<Membership>> {
    Box::pin(async move {
        let limit = ctx.config.concurrency_limit.max(1);
        match rewrite {
            UsersetRewrite::Union(children) => {
                let branches = child_branches(&ctx, &resource, &subject, children, &path);
                any_member(branches, limit).await
            }
            UsersetRewrite::Intersection(children) => {
                let branches = child_branches(&ctx, &resource, &subject, children, &path);
                all_members(branches, limit).await
            }
            UsersetRewrite::Exclusion(children) => {
                let mut children = children.into_iter();
                let Some(first) = children.next() else {
                    return Ok(Membership::NotMember);
                };
                let base = eval_child(
                    ctx.clone(),
                    resource.clone(),
                    subject.clone(),
                    first,
                    path.clone(),
                )
                .await?;
                if base == Membership::NotMember {
                    return Ok(Membership::NotMember);
                }
                let removed =
                    child_branches(&ctx, &resource, &subject, children.collect(), &path);
                match any_member(removed, limit).await? {
                    Membership::Member => Ok(Membership::NotMember),
                    Membership::NotMember => Ok(Membership::Member),
                }
            }
        }
    })
}

fn child_branches(
    ctx: &Arc<CheckContext>,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    children: Vec<SetOperationChild>,
    path: &TraversalPath,
) -> Vec<BoxFuture<'static, Result<Membership>>> {
    children
        .into_iter()
        .map(|child| {
            eval_child(
                ctx.clone(),
                resource.clone(),
                subject.clone(),
                child,
                path.clone(),
            )
        })
        .collect()
}

fn eval_child(
    ctx: Arc<CheckContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    child: SetOperationChild,
    path: TraversalPath,
) -> BoxFuture<'static, Result<Membership>> {
    Box::pin(async move {
        match child {
            SetOperationChild::This => check_this(ctx, resource, subject, path).await,
            SetOperationChild::Nil => Ok(Membership::NotMember),
            SetOperationChild::ComputedUserset { relation } => {
                let computed =
                    ObjectAndRelation::new(&resource.namespace, &resource.object_id, &relation);
                check_internal(ctx, computed, subject, path).await
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

                let mut branches = Vec::new();
                for relationship in relationships {
                    if !admit_relationship(&ctx, &relationship).await? {
                        continue;
                    }
                    // wildcards cannot be walked
                    if let Subject::Object(walked) = relationship.subject {
                        let target = ObjectAndRelation::new(
                            &walked.namespace,
                            &walked.object_id,
                            &computed_relation,
                        );
                        branches.push(check_internal(
                            ctx.clone(),
                            target,
                            subject.clone(),
                            path.clone(),
                        ));
                    }
                }
                any_member(branches, ctx.config.concurrency_limit.max(1)).await
            }
            SetOperationChild::Rewrite(rewrite) => {
                eval_rewrite(ctx, resource, subject, rewrite, path).await
            }
        }
    })
}

/// Direct relationship lookup: an exact subject match or a covering
/// wildcard is a hit; userset subjects recurse.
fn check_this(
    ctx: Arc<CheckContext>,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    path: TraversalPath,
) -> BoxFuture<'static, Result<Membership>> {
    Box::pin(async move {
        let filter = RelationshipFilter::namespace(&resource.namespace)
            .with_object_id(&resource.object_id)
            .with_relation(&resource.relation);
        let relationships = ctx
            .datastore
            .query_relationships(&filter, ctx.revision)
            .await?;

        let mut branches = Vec::new();
        for relationship in relationships {
            if !admit_relationship(&ctx, &relationship).await? {
                continue;
            }
            match &relationship.subject {
                Subject::Object(onr) if *onr == subject => return Ok(Membership::Member),
                Subject::Wildcard { namespace }
                    if subject.relation == ELLIPSIS && subject.namespace == *namespace =>
                {
                    return Ok(Membership::Member);
                }
                Subject::Object(onr) if !onr.is_terminal() => {
                    branches.push(check_internal(
                        ctx.clone(),
                        onr.clone(),
                        subject.clone(),
                        path.clone(),
                    ));
                }
                _ => {}
            }
        }
        any_member(branches, ctx.config.concurrency_limit.max(1)).await
    })
}

/// Whether a stored relationship participates in this check. Caveated
/// relationships are admitted only when their caveat evaluates true
/// against the stored context; a partial evaluation rejects the
/// relationship for this path.
async fn admit_relationship(ctx: &Arc<CheckContext>, relationship: &Relationship) -> Result<bool> {
    let Some(reference) = &relationship.caveat else {
        return Ok(true);
    };
    let definition = ctx
        .datastore
        .read_caveat(&reference.caveat_name, ctx.revision)
        .await?;
    let predicate = Predicate::deserialize(&definition.serialized_expression)?;
    match predicate.evaluate(&reference.context)? {
        Evaluation::True => Ok(true),
        Evaluation::False | Evaluation::Partial(_) => {
            debug!(relationship = %relationship, "caveat did not hold, skipping relationship");
            Ok(false)
        }
    }
}

/// First member wins; remaining branches are cancelled by drop.
async fn any_member(
    branches: Vec<BoxFuture<'static, Result<Membership>>>,
    limit: usize,
) -> Result<Membership> {
    let mut stream = stream::iter(branches).buffer_unordered(limit);
    while let Some(result) = stream.next().await {
        if result? == Membership::Member {
            return Ok(Membership::Member);
        }
    }
    Ok(Membership::NotMember)
}

/// First non-member loses; remaining branches are cancelled by drop.
async fn all_members(
    branches: Vec<BoxFuture<'static, Result<Membership>>>,
    limit: usize,
) -> Result<Membership> {
    if branches.is_empty() {
        return Ok(Membership::NotMember);
    }
    let mut stream = stream::iter(branches).buffer_unordered(limit);
    while let Some(result) = stream.next().await {
        if result? == Membership::NotMember {
            return Ok(Membership::NotMember);
        }
    }
    Ok(Membership::Member)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::InMemoryDatastore;
    use crate::schema::{AllowedRelation, NamespaceDefinition, RelationDef};
    use crate::tuple::RelationshipUpdate;

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

    fn document_namespace() -> NamespaceDefinition {
        NamespaceDefinition::new(
            "document",
            vec![
                RelationDef::relation("banned", vec![AllowedRelation::terminal("user")]),
                RelationDef::relation("editor", vec![AllowedRelation::terminal("user")]),
                RelationDef::relation(
                    "viewer",
                    vec![
                        AllowedRelation::terminal("user"),
                        AllowedRelation::wildcard("user"),
                    ],
                ),
                RelationDef::permission(
                    "view",
                    UsersetRewrite::union(vec![
                        SetOperationChild::computed("viewer"),
                        SetOperationChild::computed("editor"),
                    ]),
                ),
                RelationDef::permission(
                    "edit_and_view",
                    UsersetRewrite::intersection(vec![
                        SetOperationChild::computed("editor"),
                        SetOperationChild::computed("viewer"),
                    ]),
                ),
                RelationDef::permission(
                    "allowed",
                    UsersetRewrite::exclusion(vec![
                        SetOperationChild::computed("viewer"),
                        SetOperationChild::computed("banned"),
                    ]),
                ),
            ],
        )
    }

    fn checker(store: Arc<InMemoryDatastore>) -> PermissionChecker {
        PermissionChecker::new(store, DispatchConfig::default())
    }

    #[tokio::test]
    async fn test_direct_membership() {
        let (store, revision) = store_with(
            vec![document_namespace()],
            &["document:plan#viewer@user:tom"],
        )
        .await;
        let checker = checker(store);

        let resource = ObjectAndRelation::new("document", "plan", "viewer");
        assert_eq!(
            checker
                .check(&resource, &ObjectAndRelation::terminal("user", "tom"), revision)
                .await
                .unwrap(),
            Membership::Member
        );
        assert_eq!(
            checker
                .check(&resource, &ObjectAndRelation::terminal("user", "sarah"), revision)
                .await
                .unwrap(),
            Membership::NotMember
        );
    }

    #[tokio::test]
    async fn test_union_and_intersection() {
        let (store, revision) = store_with(
            vec![document_namespace()],
            &[
                "document:plan#viewer@user:tom",
                "document:plan#editor@user:sarah",
            ],
        )
        .await;
        let checker = checker(store);

        let view = ObjectAndRelation::new("document", "plan", "view");
        let both = ObjectAndRelation::new("document", "plan", "edit_and_view");
        let tom = ObjectAndRelation::terminal("user", "tom");
        let sarah = ObjectAndRelation::terminal("user", "sarah");

        assert_eq!(
            checker.check(&view, &tom, revision).await.unwrap(),
            Membership::Member
        );
        assert_eq!(
            checker.check(&view, &sarah, revision).await.unwrap(),
            Membership::Member
        );
        assert_eq!(
            checker.check(&both, &tom, revision).await.unwrap(),
            Membership::NotMember
        );
    }

    #[tokio::test]
    async fn test_exclusion() {
        let (store, revision) = store_with(
            vec![document_namespace()],
            &[
                "document:plan#viewer@user:tom",
                "document:plan#viewer@user:sarah",
                "document:plan#banned@user:sarah",
            ],
        )
        .await;
        let checker = checker(store);

        let allowed = ObjectAndRelation::new("document", "plan", "allowed");
        assert_eq!(
            checker
                .check(&allowed, &ObjectAndRelation::terminal("user", "tom"), revision)
                .await
                .unwrap(),
            Membership::Member
        );
        assert_eq!(
            checker
                .check(&allowed, &ObjectAndRelation::terminal("user", "sarah"), revision)
                .await
                .unwrap(),
            Membership::NotMember
        );
    }

    #[tokio::test]
    async fn test_wildcard_covers_concrete_subjects() {
        let (store, revision) = store_with(
            vec![document_namespace()],
            &["document:plan#viewer@user:*"],
        )
        .await;
        let checker = checker(store);

        let resource = ObjectAndRelation::new("document", "plan", "viewer");
        assert_eq!(
            checker
                .check(&resource, &ObjectAndRelation::terminal("user", "anyone"), revision)
                .await
                .unwrap(),
            Membership::Member
        );
        // a wildcard covers terminal subjects of its namespace only
        assert_eq!(
            checker
                .check(
                    &resource,
                    &ObjectAndRelation::terminal("service", "deploys"),
                    revision
                )
                .await
                .unwrap(),
            Membership::NotMember
        );
    }

    #[tokio::test]
    async fn test_userset_subjects_recurse() {
        let group = NamespaceDefinition::new(
            "group",
            vec![RelationDef::relation(
                "member",
                vec![
                    AllowedRelation::terminal("user"),
                    AllowedRelation::with_relation("group", "member"),
                ],
            )],
        );
        let document = NamespaceDefinition::new(
            "document",
            vec![RelationDef::relation(
                "viewer",
                vec![
                    AllowedRelation::terminal("user"),
                    AllowedRelation::with_relation("group", "member"),
                ],
            )],
        );
        let (store, revision) = store_with(
            vec![group, document],
            &[
                "document:plan#viewer@group:eng#member",
                "group:eng#member@group:leads#member",
                "group:leads#member@user:ann",
            ],
        )
        .await;
        let checker = checker(store);

        let resource = ObjectAndRelation::new("document", "plan", "viewer");
        assert_eq!(
            checker
                .check(&resource, &ObjectAndRelation::terminal("user", "ann"), revision)
                .await
                .unwrap(),
            Membership::Member
        );
    }

    #[tokio::test]
    async fn test_cycles_resolve_to_not_member() {
        let group = NamespaceDefinition::new(
            "group",
            vec![RelationDef::relation(
                "member",
                vec![
                    AllowedRelation::terminal("user"),
                    AllowedRelation::with_relation("group", "member"),
                ],
            )],
        );
        let (store, revision) = store_with(
            vec![group],
            &[
                "group:first#member@group:second#member",
                "group:second#member@group:first#member",
            ],
        )
        .await;
        let checker = checker(store);

        let resource = ObjectAndRelation::new("group", "first", "member");
        assert_eq!(
            checker
                .check(&resource, &ObjectAndRelation::terminal("user", "ann"), revision)
                .await
                .unwrap(),
            Membership::NotMember
        );
    }

    #[tokio::test]
    async fn test_unknown_relation_is_precondition_failure() {
        let (store, revision) = store_with(vec![document_namespace()], &[]).await;
        let checker = checker(store);

        let result = checker
            .check(
                &ObjectAndRelation::new("document", "plan", "fakerelation"),
                &ObjectAndRelation::terminal("user", "tom"),
                revision,
            )
            .await;
        assert!(matches!(result, Err(EngineError::RelationNotFound { .. })));

        let result = checker
            .check(
                &ObjectAndRelation::new("docs", "plan", "viewer"),
                &ObjectAndRelation::terminal("user", "tom"),
                revision,
            )
            .await;
        assert!(matches!(result, Err(EngineError::NamespaceNotFound(_))));
    }
}
