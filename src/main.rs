use mdcs_core::{Context, CounterKind};
use mdcs_db::{
    CType, CollectionDescription, Database, DatabaseConfig, KeyService, MemoryPubSubHub, PeerId,
};
use mdcs_merkle::{init_schema, CommitOptions, EncryptionConfig, SigningKey};
use serde_json::{json, Map, Value};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn users() -> CollectionDescription {
    CollectionDescription::new(1, "Users", "users-v1")
        .with_field("1", "name", CType::LwwRegister)
        .with_field("2", "email", CType::LwwRegister)
        .with_field("3", "points", CType::PCounter(CounterKind::Int))
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Start a replica with a key service attached to `hub`.
async fn replica(hub: &MemoryPubSubHub, name: &str) -> Result<Database, Box<dyn Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let db = Database::new(DatabaseConfig::new(name)).with_key_requests(tx);
    db.define_collection(&Context::new(), users())?;

    let service = Arc::new(KeyService::new(Arc::new(hub.join(PeerId::new(name))), db.encstore()));
    service.register().await?;
    tokio::spawn(service.run(rx));
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    init_schema()?;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║            MERKLE-CRDT REPLICATION WALKTHROUGH             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let ctx = Context::new();
    let hub = MemoryPubSubHub::new();
    let alice = replica(&hub, "alice").await?;
    let bob = replica(&hub, "bob").await?;

    // Alice writes a signed document with a private email.
    let options = CommitOptions::builder()
        .sign_with(SigningKey::generate_ed25519())
        .encryption(EncryptionConfig::fields(["email"]))
        .build();
    let created = alice.create_document(
        &ctx,
        "Users",
        &fields(json!({"name": "Alice", "email": "alice@example.com", "points": 10})),
        &options,
    )?;
    info!(doc = %created.doc_id, head = %created.head, blocks = created.blocks.len(), "alice created document");

    // Bob pulls the DAG; the email block stays pending until the key arrives.
    let merged = bob.execute_merge(&ctx, "Users", created.head, &alice.block_source())?;
    println!("\n[bob] pending encrypted blocks: {}", merged.outcome.pending.len());
    if let Some(keys) = merged.keys {
        let unlocked = bob.resolve_pending(&ctx, "Users", keys).await?;
        println!("[bob] unlocked after key exchange: {unlocked}");
    }
    let doc = bob.read_document(&ctx, "Users", &created.doc_id)?;
    println!("[bob] {}", serde_json::to_string(&doc)?);

    // Concurrent edits on both replicas, then a full exchange.
    let from_alice = alice.update_document(&ctx, "Users", &created.doc_id, &fields(json!({"points": 5})), &options)?;
    let from_bob = bob.update_document(
        &ctx,
        "Users",
        &created.doc_id,
        &fields(json!({"name": "Alice B.", "points": 2})),
        &CommitOptions::default(),
    )?;
    alice.execute_merge(&ctx, "Users", from_bob.head, &bob.block_source())?;
    bob.execute_merge(&ctx, "Users", from_alice.head, &alice.block_source())?;

    println!("\n── converged state ──");
    for (name, db) in [("alice", &alice), ("bob", &bob)] {
        let doc = db.read_document(&ctx, "Users", &created.doc_id)?;
        let (heads, height) = db.document_heads(&ctx, &created.doc_id)?;
        println!("[{name}] heads={} height={height} {}", heads.len(), serde_json::to_string(&doc.fields)?);
    }

    println!("\n── history ──");
    for (label, cid) in [("v1", created.head), ("alice v2", from_alice.head), ("bob v2", from_bob.head)] {
        let version = bob.fetch_version(&ctx, "Users", cid)?;
        println!("[{label}] {}", serde_json::to_string(&version.fields)?);
    }

    println!("\n✓ Walkthrough completed");
    Ok(())
}
