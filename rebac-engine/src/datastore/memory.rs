//! In-memory datastore with revisioned reads, a GC window, and change
//! watching. The backing store for tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::datastore::{
    Datastore, RelationshipFilter, Revision, RevisionChanges, WatchStreams,
};
use crate::error::{EngineError, Result};
use crate::schema::{CaveatDefinition, NamespaceDefinition};
use crate::tuple::{Relationship, RelationshipUpdate, Subject, UpdateOperation};

/// Marker for entries not yet deleted.
const LIVE_TXN: u64 = u64::MAX;

struct TupleEntry {
    relationship: Relationship,
    created: u64,
    deleted: u64,
}

struct DefinitionEntry<T> {
    name: String,
    definition: T,
    created: u64,
    deleted: u64,
}

impl<T> DefinitionEntry<T> {
    fn live_at(&self, revision: u64) -> bool {
        self.created <= revision && self.deleted > revision
    }
}

impl TupleEntry {
    fn live_at(&self, revision: u64) -> bool {
        self.created <= revision && self.deleted > revision
    }
}

#[derive(Default)]
struct Inner {
    tuples: Vec<TupleEntry>,
    namespaces: Vec<DefinitionEntry<NamespaceDefinition>>,
    caveats: Vec<DefinitionEntry<CaveatDefinition>>,
    head: u64,
    revision_times: HashMap<u64, DateTime<Utc>>,
    change_log: Vec<RevisionChanges>,
    watchers: Vec<mpsc::UnboundedSender<RevisionChanges>>,
}

impl Inner {
    fn advance(&mut self) -> u64 {
        self.head += 1;
        self.revision_times.insert(self.head, Utc::now());
        self.head
    }

    fn live_tuple_index(&self, relationship: &Relationship) -> Option<usize> {
        let key = relationship.key();
        self.tuples
            .iter()
            .position(|entry| entry.deleted == LIVE_TXN && entry.relationship.key() == key)
    }

    fn commit_changes(&mut self, revision: u64, changes: Vec<RelationshipUpdate>) {
        let committed = RevisionChanges {
            revision: Revision::from_raw(revision),
            changes,
        };
        self.change_log.push(committed.clone());
        self.watchers
            .retain(|watcher| watcher.send(committed.clone()).is_ok());
    }
}

pub struct InMemoryDatastore {
    inner: RwLock<Inner>,
    gc_window: Duration,
}

impl InMemoryDatastore {
    pub fn new(gc_window: Duration) -> Self {
        let mut inner = Inner::default();
        inner.revision_times.insert(0, Utc::now());
        Self {
            inner: RwLock::new(inner),
            gc_window,
        }
    }

    /// A datastore whose GC window never expires in practice.
    pub fn with_unbounded_gc() -> Self {
        Self::new(Duration::days(3650))
    }

    fn check_revision_inner(&self, inner: &Inner, revision: Revision) -> Result<()> {
        let raw = revision.raw();
        if raw > inner.head {
            return Err(EngineError::OutOfRange(format!(
                "revision {revision} is newer than the head"
            )));
        }
        // the head itself stays readable regardless of age
        if raw == inner.head {
            return Ok(());
        }
        let stamped = inner.revision_times.get(&raw).copied().ok_or_else(|| {
            EngineError::OutOfRange(format!("revision {revision} is unknown"))
        })?;
        if Utc::now() - stamped > self.gc_window {
            return Err(EngineError::OutOfRange(format!(
                "revision {revision} is outside the garbage collection window"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn revision(&self) -> Result<Revision> {
        let inner = self.inner.read().await;
        Ok(Revision::from_raw(inner.head))
    }

    async fn sync_revision(&self) -> Result<Revision> {
        let inner = self.inner.read().await;
        Ok(Revision::from_raw(inner.head))
    }

    async fn check_revision(&self, revision: Revision) -> Result<()> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)
    }

    async fn read_namespace(&self, name: &str, revision: Revision) -> Result<NamespaceDefinition> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        inner
            .namespaces
            .iter()
            .find(|entry| entry.name == name && entry.live_at(revision.raw()))
            .map(|entry| entry.definition.clone())
            .ok_or_else(|| EngineError::NamespaceNotFound(name.to_string()))
    }

    async fn write_namespace(&self, definition: NamespaceDefinition) -> Result<Revision> {
        definition.validate()?;
        let mut inner = self.inner.write().await;
        let revision = inner.advance();
        if let Some(entry) = inner
            .namespaces
            .iter_mut()
            .find(|entry| entry.name == definition.name && entry.deleted == LIVE_TXN)
        {
            entry.deleted = revision;
        }
        info!(namespace = %definition.name, revision = %revision, "writing namespace definition");
        inner.namespaces.push(DefinitionEntry {
            name: definition.name.clone(),
            definition,
            created: revision,
            deleted: LIVE_TXN,
        });
        Ok(Revision::from_raw(revision))
    }

    async fn delete_namespace(&self, name: &str) -> Result<Revision> {
        let mut inner = self.inner.write().await;
        let head = inner.head;
        let entry_index = inner
            .namespaces
            .iter()
            .position(|entry| entry.name == name && entry.live_at(head))
            .ok_or_else(|| EngineError::NamespaceNotFound(name.to_string()))?;
        let revision = inner.advance();
        inner.namespaces[entry_index].deleted = revision;

        // relationships under the namespace go with it
        let mut removed = 0usize;
        for entry in &mut inner.tuples {
            if entry.deleted == LIVE_TXN && entry.relationship.resource.namespace == name {
                entry.deleted = revision;
                removed += 1;
            }
        }
        info!(namespace = name, removed, revision, "deleted namespace");
        Ok(Revision::from_raw(revision))
    }

    async fn list_namespaces(&self, revision: Revision) -> Result<Vec<NamespaceDefinition>> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        Ok(inner
            .namespaces
            .iter()
            .filter(|entry| entry.live_at(revision.raw()))
            .map(|entry| entry.definition.clone())
            .collect())
    }

    async fn read_caveat(&self, name: &str, revision: Revision) -> Result<CaveatDefinition> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        inner
            .caveats
            .iter()
            .find(|entry| entry.name == name && entry.live_at(revision.raw()))
            .map(|entry| entry.definition.clone())
            .ok_or_else(|| EngineError::CaveatNotFound(name.to_string()))
    }

    async fn write_caveat(&self, definition: CaveatDefinition) -> Result<Revision> {
        let mut inner = self.inner.write().await;
        let revision = inner.advance();
        if let Some(entry) = inner
            .caveats
            .iter_mut()
            .find(|entry| entry.name == definition.name && entry.deleted == LIVE_TXN)
        {
            entry.deleted = revision;
        }
        inner.caveats.push(DefinitionEntry {
            name: definition.name.clone(),
            definition,
            created: revision,
            deleted: LIVE_TXN,
        });
        Ok(Revision::from_raw(revision))
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        let matched: Vec<Relationship> = inner
            .tuples
            .iter()
            .filter(|entry| entry.live_at(revision.raw()) && filter.matches(&entry.relationship))
            .map(|entry| entry.relationship.clone())
            .collect();
        debug!(
            namespace = %filter.namespace,
            count = matched.len(),
            "queried relationships"
        );
        Ok(matched)
    }

    async fn reverse_query_from_subject(
        &self,
        subject: &Subject,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        Ok(inner
            .tuples
            .iter()
            .filter(|entry| {
                entry.live_at(revision.raw()) && entry.relationship.subject == *subject
            })
            .map(|entry| entry.relationship.clone())
            .collect())
    }

    async fn reverse_query_from_subject_relation(
        &self,
        namespace: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        let inner = self.inner.read().await;
        self.check_revision_inner(&inner, revision)?;
        Ok(inner
            .tuples
            .iter()
            .filter(|entry| {
                entry.live_at(revision.raw())
                    && entry.relationship.subject.namespace() == namespace
                    && entry.relationship.subject.relation() == relation
            })
            .map(|entry| entry.relationship.clone())
            .collect())
    }

    async fn write_relationships(
        &self,
        preconditions: &[Relationship],
        mutations: &[RelationshipUpdate],
    ) -> Result<Revision> {
        let mut inner = self.inner.write().await;

        for precondition in preconditions {
            if inner.live_tuple_index(precondition).is_none() {
                return Err(EngineError::PreconditionFailed(format!(
                    "precondition relationship `{precondition}` not found"
                )));
            }
        }

        // reject before mutating so a failure applies nothing
        for update in mutations {
            if update.operation == UpdateOperation::Create
                && inner.live_tuple_index(&update.relationship).is_some()
            {
                return Err(EngineError::PreconditionFailed(format!(
                    "relationship `{}` already exists",
                    update.relationship
                )));
            }
        }

        let revision = inner.advance();
        for update in mutations {
            match update.operation {
                UpdateOperation::Create => {
                    inner.tuples.push(TupleEntry {
                        relationship: update.relationship.clone(),
                        created: revision,
                        deleted: LIVE_TXN,
                    });
                }
                UpdateOperation::Touch => {
                    if let Some(index) = inner.live_tuple_index(&update.relationship) {
                        inner.tuples[index].deleted = revision;
                    }
                    inner.tuples.push(TupleEntry {
                        relationship: update.relationship.clone(),
                        created: revision,
                        deleted: LIVE_TXN,
                    });
                }
                UpdateOperation::Delete => {
                    if let Some(index) = inner.live_tuple_index(&update.relationship) {
                        inner.tuples[index].deleted = revision;
                    }
                }
            }
        }

        info!(
            mutations = mutations.len(),
            revision, "committed relationship write"
        );
        inner.commit_changes(revision, mutations.to_vec());
        Ok(Revision::from_raw(revision))
    }

    async fn watch(&self, after_revision: Revision) -> Result<WatchStreams> {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.write().await;
        if let Err(err) = self.check_revision_inner(&inner, after_revision) {
            // the caller still gets streams; the error stream reports why
            // nothing will arrive
            let _ = error_tx.send(err);
            return Ok((change_rx, error_rx));
        }

        for committed in &inner.change_log {
            if committed.revision > after_revision {
                let _ = change_tx.send(committed.clone());
            }
        }
        inner.watchers.push(change_tx);
        Ok((change_rx, error_rx))
    }
}
