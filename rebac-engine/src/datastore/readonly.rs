//! A policy decorator that forwards reads to a delegate datastore and
//! rejects every mutation. New capabilities must be forwarded explicitly;
//! additions default to rejection rather than silent passthrough.

use async_trait::async_trait;
use std::sync::Arc;

use crate::datastore::{
    Datastore, RelationshipFilter, Revision, WatchStreams,
};
use crate::error::{EngineError, Result};
use crate::schema::{CaveatDefinition, NamespaceDefinition};
use crate::tuple::{Relationship, RelationshipUpdate, Subject};

pub struct ReadonlyDatastore {
    delegate: Arc<dyn Datastore>,
}

impl ReadonlyDatastore {
    pub fn new(delegate: Arc<dyn Datastore>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl Datastore for ReadonlyDatastore {
    async fn revision(&self) -> Result<Revision> {
        self.delegate.revision().await
    }

    async fn sync_revision(&self) -> Result<Revision> {
        self.delegate.sync_revision().await
    }

    async fn check_revision(&self, revision: Revision) -> Result<()> {
        self.delegate.check_revision(revision).await
    }

    async fn read_namespace(&self, name: &str, revision: Revision) -> Result<NamespaceDefinition> {
        self.delegate.read_namespace(name, revision).await
    }

    async fn write_namespace(&self, _definition: NamespaceDefinition) -> Result<Revision> {
        Err(EngineError::ReadOnly)
    }

    async fn delete_namespace(&self, _name: &str) -> Result<Revision> {
        Err(EngineError::ReadOnly)
    }

    async fn list_namespaces(&self, revision: Revision) -> Result<Vec<NamespaceDefinition>> {
        self.delegate.list_namespaces(revision).await
    }

    async fn read_caveat(&self, name: &str, revision: Revision) -> Result<CaveatDefinition> {
        self.delegate.read_caveat(name, revision).await
    }

    async fn write_caveat(&self, _definition: CaveatDefinition) -> Result<Revision> {
        Err(EngineError::ReadOnly)
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        self.delegate.query_relationships(filter, revision).await
    }

    async fn reverse_query_from_subject(
        &self,
        subject: &Subject,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        self.delegate
            .reverse_query_from_subject(subject, revision)
            .await
    }

    async fn reverse_query_from_subject_relation(
        &self,
        namespace: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<Vec<Relationship>> {
        self.delegate
            .reverse_query_from_subject_relation(namespace, relation, revision)
            .await
    }

    async fn write_relationships(
        &self,
        _preconditions: &[Relationship],
        _mutations: &[RelationshipUpdate],
    ) -> Result<Revision> {
        Err(EngineError::ReadOnly)
    }

    async fn watch(&self, after_revision: Revision) -> Result<WatchStreams> {
        self.delegate.watch(after_revision).await
    }
}
