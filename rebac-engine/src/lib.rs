//! Zanzibar-style relationship-based access control engine
//!
//! This crate implements the core of a ReBAC authorization system:
//! - Relationship storage contract with snapshot revisions and a GC window
//! - Schema model for definitions, relations, permissions and caveats
//! - Deterministic canonical schema text generation
//! - Recursive permission checks over userset rewrites
//! - Expansion into subject trees with wildcard, exclusion and caveat
//!   aware set algebra
//!
//! # Core Concepts
//!
//! - **Object**: any resource under protection, addressed as
//!   `namespace:object_id`
//! - **Subject**: an object, a userset (`namespace:object_id#relation`),
//!   or the public wildcard (`namespace:*`)
//! - **Relationship**: a stored tuple stating that a subject relates to a
//!   resource, optionally conditioned by a caveat
//! - **Permission**: a relation computed from others through set algebra
//!   instead of direct relationships
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rebac_engine::check::DispatchConfig;
//! use rebac_engine::datastore::memory::InMemoryDatastore;
//! use rebac_engine::datastore::Datastore;
//! use rebac_engine::schema::{AllowedRelation, NamespaceDefinition, RelationDef};
//! use rebac_engine::service::{AclService, CheckRequest};
//! use rebac_engine::{ObjectAndRelation, Relationship, RelationshipUpdate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryDatastore::with_unbounded_gc());
//!     store
//!         .write_namespace(NamespaceDefinition::new(
//!             "document",
//!             vec![RelationDef::relation(
//!                 "viewer",
//!                 vec![AllowedRelation::terminal("user")],
//!             )],
//!         ))
//!         .await?;
//!
//!     let service = AclService::new(store, DispatchConfig::default());
//!     let written = service
//!         .write(&rebac_engine::service::WriteRequest {
//!             preconditions: vec![],
//!             updates: vec![RelationshipUpdate::create(Relationship::parse(
//!                 "document:readme#viewer@user:jill",
//!             )?)],
//!         })
//!         .await?;
//!
//!     let response = service
//!         .check(&CheckRequest {
//!             resource: ObjectAndRelation::new("document", "readme", "viewer"),
//!             subject: ObjectAndRelation::terminal("user", "jill"),
//!             at_revision: written.revision,
//!         })
//!         .await?;
//!     assert!(response.is_member());
//!     Ok(())
//! }
//! ```

pub mod caveats;
pub mod check;
pub mod datastore;
pub mod error;
pub mod expand;
pub mod generator;
pub mod membership;
pub mod schema;
pub mod service;
pub mod subjectset;
pub mod tuple;

pub use error::{EngineError, Result, StatusCode};
pub use tuple::*;
