//! # mdcs-merkle
//!
//! Merkle clock for the Merkle-CRDT replication core.
//!
//! This crate provides:
//! - A deterministic DAG-CBOR codec for `Block`, `Encryption` and `Signature` nodes
//! - CIDv1 content identifiers (DAG-CBOR codec, SHA2-256 multihash)
//! - A content-addressed block store and per-namespace head sets
//! - Ed25519 block signing and verification
//! - XChaCha20-Poly1305 payload encryption with keys inherited along the DAG
//! - [`MerkleClock`], which commits local deltas and applies remote blocks
//!
//! ## Architecture
//!
//! Every CRDT instance owns a head namespace. A commit:
//! 1. Reads the heads and sets the delta priority to `max height + 1`
//! 2. Builds a block linking the heads (and, for documents, the field blocks)
//! 3. Encrypts and signs the stored copy when required
//! 4. Merges the plaintext delta into the CRDT and advances the heads
//!
//! ## Example
//!
//! ```rust
//! use mdcs_core::keys::DataStoreKey;
//! use mdcs_core::{Context, LWWRegister, MemoryRootStore};
//! use mdcs_merkle::{ClockConfig, CommitOptions, MerkleClock};
//!
//! let txn = MemoryRootStore::new().new_txn();
//! let clock = MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), ClockConfig::default());
//! let key = DataStoreKey::new(1, "bae-doc").with_field_id("1");
//! let name = LWWRegister::new(txn.datastore(), "schema-v1", key, "name");
//!
//! let ctx = Context::new();
//! let (cid, _bytes) = clock
//!     .add_delta(&ctx, &name, name.delta(b"Alice".to_vec()), vec![], &CommitOptions::default())
//!     .unwrap();
//!
//! assert_eq!(clock.heads(&name).list(&ctx).unwrap(), (vec![cid], 1));
//! txn.commit().unwrap();
//! ```

pub mod block;
pub mod blockstore;
pub mod clock;
pub mod codec;
pub mod config;
pub mod encryption;
pub mod error;
pub mod heads;
pub mod link;
pub mod schema;
pub mod signature;

pub use block::{Block, DAGLink, Encryption, Signature, SignatureHeader, HEAD_LINK_NAME};
pub use blockstore::BlockStore;
pub use clock::MerkleClock;
pub use codec::IpldNode;
pub use config::{ClockConfig, CommitOptions, CommitOptionsBuilder};
pub use encryption::{DocEncryptor, EncryptionConfig};
pub use error::{MerkleError, Result};
pub use heads::HeadSet;
pub use link::{compute_cid, Cid};
pub use schema::{init_schema, registry, SchemaRegistry};
pub use signature::{verify_block_signature, verify_block_signature_with_identity, SigningKey};
