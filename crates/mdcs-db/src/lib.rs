//! # mdcs-db
//!
//! Document layer of the Merkle-CRDT replication core.
//!
//! This crate provides:
//! - Collection and field descriptions choosing the CRDT behind each field
//! - The document write path: field blocks linked by a composite block
//! - Remote merges that fetch, verify and replay blocks received from peers
//! - Peer key exchange for documents whose blocks arrive encrypted
//! - Historical reads of a document at any composite block
//!
//! ## Example
//!
//! ```rust
//! use mdcs_core::{Context, CounterKind};
//! use mdcs_db::{CType, CollectionDescription, Database, DatabaseConfig};
//! use mdcs_merkle::CommitOptions;
//! use serde_json::json;
//!
//! let ctx = Context::new();
//! let users = CollectionDescription::new(1, "Users", "schema-v1")
//!     .with_field("1", "name", CType::LwwRegister)
//!     .with_field("2", "points", CType::PCounter(CounterKind::Int));
//!
//! let alice = Database::new(DatabaseConfig::new("alice"));
//! let bob = Database::new(DatabaseConfig::new("bob"));
//! alice.define_collection(&ctx, users.clone()).unwrap();
//! bob.define_collection(&ctx, users).unwrap();
//!
//! let fields = json!({"name": "Alice", "points": 10});
//! let created = alice
//!     .create_document(&ctx, "Users", fields.as_object().unwrap(), &CommitOptions::default())
//!     .unwrap();
//!
//! // Bob pulls the new revision from Alice.
//! bob.execute_merge(&ctx, "Users", created.head, &alice.block_source()).unwrap();
//! let doc = bob.read_document(&ctx, "Users", &created.doc_id).unwrap();
//! assert_eq!(doc.fields["points"], json!(10));
//! ```

pub mod db;
pub mod description;
pub mod document;
pub mod error;
pub mod kms;
pub mod merge;
pub mod merkle_crdt;
pub mod versioned;

pub use db::{Database, DatabaseConfig, MergeResult};
pub use description::{CType, CollectionDescription, FieldDescription};
pub use document::{CommitResult, Document, DocumentId, DocumentWriter};
pub use error::{DbError, Result};
pub use kms::{
    FetchEncryptionKeyReply, FetchEncryptionKeyRequest, KeyRequestEvent, KeyService, MemoryPubSub, MemoryPubSubHub,
    PeerId, PubSubResponse, PubSubServer, RetrievedKey, TopicHandler, ENCRYPTION_TOPIC,
};
pub use merge::{BlockSource, MergeOutcome, MergeProcessor, PendingBlock};
pub use merkle_crdt::{field_level_crdt, FieldCrdt, MerkleCrdt};
pub use versioned::{HistoricalDocument, VersionedFetcher};
