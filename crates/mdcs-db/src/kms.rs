//! Key management service: exchanging document encryption keys between peers.
//!
//! A replica that receives blocks it cannot decrypt publishes a
//! [`FetchEncryptionKeyRequest`] on the `encryption` topic. The request
//! carries a fresh X25519 public key. Any peer holding some of the requested
//! keys replies with those keys sealed to that public key, so only the
//! requester can read them. A peer holding none of them does not reply.
//!
//! Sealing derives a symmetric key with SHA-256 over the X25519 shared secret
//! and both public keys, then encrypts with XChaCha20-Poly1305. The associated
//! data binds the reply to the request's public key and the responder's peer id.

use crate::error::{DbError, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use mdcs_core::keys::EncStoreDocKey;
use mdcs_core::ReaderWriter;
use mdcs_merkle::encryption::{KEY_LEN, NONCE_LEN};
use mdcs_merkle::DocEncryptor;
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Pub/sub topic carrying key requests.
pub const ENCRYPTION_TOPIC: &str = "encryption";

const PUBLIC_KEY_LEN: usize = 32;

/// Unique identifier for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchEncryptionKeyRequest {
    pub ephemeral_public_key: Vec<u8>,
    pub targets: Vec<EncStoreDocKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchEncryptionKeyReply {
    pub request_ephemeral_public_key: Vec<u8>,
    /// Targets the responder holds keys for, in the order of `encrypted_keys`.
    pub targets: Vec<EncStoreDocKey>,
    /// The concatenated keys, sealed to the requester.
    pub encrypted_keys: Vec<u8>,
}

/// A key obtained from a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct RetrievedKey {
    pub store_key: EncStoreDocKey,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for RetrievedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievedKey")
            .field("store_key", &self.store_key)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Ask the key service to fetch `keys` from peers.
#[derive(Debug)]
pub struct KeyRequestEvent {
    pub keys: Vec<EncStoreDocKey>,
    pub resp: oneshot::Sender<Result<Vec<RetrievedKey>>>,
}

// ============================================================================
// Sealing
// ============================================================================

fn associated_data(request_public_key: &[u8], responder: &PeerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(request_public_key.len() + responder.as_bytes().len());
    aad.extend_from_slice(request_public_key);
    aad.extend_from_slice(responder.as_bytes());
    aad
}

fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

fn public_key(bytes: &[u8]) -> Result<PublicKey> {
    let raw: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| DbError::KeyExchange(format!("invalid public key length {}", bytes.len())))?;
    Ok(PublicKey::from(raw))
}

/// Seal `plaintext` so only the holder of `recipient`'s secret can open it.
///
/// Output is `ephemeral public key ‖ nonce ‖ ciphertext`.
pub fn seal(recipient: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let recipient = public_key(recipient)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = XChaCha20Poly1305::new(&key.into())
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| DbError::KeyExchange("failed to seal keys".to_string()))?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open data produced by [`seal`].
pub fn open(secret: &StaticSecret, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(DbError::KeyExchange("sealed data too short".to_string()));
    }
    let (ephemeral, rest) = sealed.split_at(PUBLIC_KEY_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let ephemeral = public_key(ephemeral)?;
    let own_public = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral);
    let key = derive_key(shared.as_bytes(), ephemeral.as_bytes(), own_public.as_bytes());

    XChaCha20Poly1305::new(&key.into())
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| DbError::KeyExchange("failed to open sealed keys".to_string()))
}

// ============================================================================
// Pub/sub transport
// ============================================================================

/// A reply received for a published message.
#[derive(Clone, Debug)]
pub struct PubSubResponse {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Handles messages published on a topic; a returned payload is sent back
/// to the publisher.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    async fn handle(&self, from: &PeerId, data: Vec<u8>) -> Result<Option<Vec<u8>>>;
}

/// Request/response pub/sub used for key exchange.
#[async_trait]
pub trait PubSubServer: Send + Sync + 'static {
    fn peer_id(&self) -> &PeerId;

    /// Subscribe `handler` to `topic`.
    async fn add_topic(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> Result<()>;

    /// Publish `data` on `topic`. The receiver yields replies as they arrive
    /// and closes once every subscriber has answered or declined.
    async fn send(&self, topic: &str, data: Vec<u8>) -> Result<mpsc::Receiver<PubSubResponse>>;
}

type Subscribers = Arc<RwLock<HashMap<String, Vec<(PeerId, Arc<dyn TopicHandler>)>>>>;

/// In-process pub/sub hub connecting any number of peers.
#[derive(Clone, Default)]
pub struct MemoryPubSubHub {
    topics: Subscribers,
}

impl MemoryPubSubHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer to the hub.
    pub fn join(&self, peer_id: PeerId) -> MemoryPubSub {
        MemoryPubSub {
            peer_id,
            topics: self.topics.clone(),
        }
    }
}

/// One peer's endpoint on a [`MemoryPubSubHub`].
#[derive(Clone)]
pub struct MemoryPubSub {
    peer_id: PeerId,
    topics: Subscribers,
}

#[async_trait]
impl PubSubServer for MemoryPubSub {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn add_topic(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> Result<()> {
        let mut topics = self.topics.write();
        let subscribers = topics.entry(topic.to_string()).or_default();
        if subscribers.iter().any(|(peer, _)| *peer == self.peer_id) {
            return Err(DbError::PubSub(format!("{} already subscribed to {topic}", self.peer_id)));
        }
        subscribers.push((self.peer_id.clone(), handler));
        Ok(())
    }

    async fn send(&self, topic: &str, data: Vec<u8>) -> Result<mpsc::Receiver<PubSubResponse>> {
        let subscribers: Vec<_> = self
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.iter().filter(|(peer, _)| *peer != self.peer_id).cloned().collect())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(subscribers.len().max(1));
        for (peer, handler) in subscribers {
            let tx = tx.clone();
            let from = self.peer_id.clone();
            let data = data.clone();
            tokio::spawn(async move {
                match handler.handle(&from, data).await {
                    Ok(Some(reply)) => {
                        if tx.send(PubSubResponse { from: peer.clone(), data: reply }).await.is_err() {
                            debug!(peer = %peer, "publisher stopped listening, reply dropped");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(peer = %peer, error = %err, "pub/sub handler failed"),
                }
            });
        }
        Ok(rx)
    }
}

// ============================================================================
// Key service
// ============================================================================

/// Answers key requests from peers and fetches missing keys from them.
pub struct KeyService<S> {
    peer_id: PeerId,
    pubsub: Arc<dyn PubSubServer>,
    encryptor: DocEncryptor<S>,
}

impl<S> KeyService<S>
where
    S: ReaderWriter + Clone + Send + Sync + 'static,
{
    pub fn new(pubsub: Arc<dyn PubSubServer>, encstore: S) -> Self {
        Self {
            peer_id: pubsub.peer_id().clone(),
            pubsub,
            encryptor: DocEncryptor::new(encstore),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Subscribe to the encryption topic and start serving requests.
    pub async fn register(self: &Arc<Self>) -> Result<()> {
        self.pubsub.add_topic(ENCRYPTION_TOPIC, self.clone()).await
    }

    /// Build a reply for `request` from the keys held locally, `None` if no
    /// requested key is held.
    pub fn try_gen_encryption_key(&self, request: &FetchEncryptionKeyRequest) -> Result<Option<FetchEncryptionKeyReply>> {
        let mut keys = Vec::with_capacity(request.targets.len() * KEY_LEN);
        let mut targets = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            if let Some(key) = self.encryptor.get_key(&target.doc_id, target.field_name.as_deref())? {
                keys.extend_from_slice(&key);
                targets.push(target.clone());
            }
        }
        if targets.is_empty() {
            return Ok(None);
        }

        let aad = associated_data(&request.ephemeral_public_key, &self.peer_id);
        let encrypted_keys = seal(&request.ephemeral_public_key, &keys, &aad)?;
        Ok(Some(FetchEncryptionKeyReply {
            request_ephemeral_public_key: request.ephemeral_public_key.clone(),
            targets,
            encrypted_keys,
        }))
    }

    /// Request `keys` from peers and return what the first responder holds.
    ///
    /// Returns an empty list when no peer replies.
    pub async fn get_keys(&self, keys: &[EncStoreDocKey]) -> Result<Vec<RetrievedKey>> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let request = FetchEncryptionKeyRequest {
            ephemeral_public_key: PublicKey::from(&secret).as_bytes().to_vec(),
            targets: keys.to_vec(),
        };
        let data = serde_json::to_vec(&request)?;
        let mut responses = self.pubsub.send(ENCRYPTION_TOPIC, data).await?;

        let Some(response) = responses.recv().await else {
            debug!(requested = keys.len(), "no peer holds the requested keys");
            return Ok(Vec::new());
        };
        let reply: FetchEncryptionKeyReply = serde_json::from_slice(&response.data)?;
        if reply.request_ephemeral_public_key != request.ephemeral_public_key {
            return Err(DbError::KeyExchange("reply does not match the request".to_string()));
        }

        let aad = associated_data(&request.ephemeral_public_key, &response.from);
        let opened = open(&secret, &reply.encrypted_keys, &aad)?;
        if opened.len() != KEY_LEN * reply.targets.len() {
            return Err(DbError::KeyExchange(format!(
                "expected {} key bytes, got {}",
                KEY_LEN * reply.targets.len(),
                opened.len()
            )));
        }

        let retrieved = reply
            .targets
            .into_iter()
            .zip(opened.chunks_exact(KEY_LEN))
            .map(|(store_key, key)| RetrievedKey {
                store_key,
                key: key.to_vec(),
            })
            .collect::<Vec<_>>();
        debug!(from = %response.from, keys = retrieved.len(), "retrieved encryption keys");
        Ok(retrieved)
    }

    /// Fetch and store keys, answering on the event's channel.
    pub async fn handle_key_request(&self, event: KeyRequestEvent) {
        let result = self.fetch_and_save(&event.keys).await;
        if let Err(err) = &result {
            error!(error = %err, "failed to get encryption keys");
        }
        let _ = event.resp.send(result);
    }

    async fn fetch_and_save(&self, keys: &[EncStoreDocKey]) -> Result<Vec<RetrievedKey>> {
        let retrieved = self.get_keys(keys).await?;
        for item in &retrieved {
            self.encryptor
                .save_key(&item.store_key.doc_id, item.store_key.field_name.as_deref(), &item.key)?;
        }
        Ok(retrieved)
    }

    /// Serve key request events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<KeyRequestEvent>) {
        while let Some(event) = events.recv().await {
            let service = self.clone();
            tokio::spawn(async move { service.handle_key_request(event).await });
        }
        debug!(peer = %self.peer_id, "key request channel closed");
    }
}

#[async_trait]
impl<S> TopicHandler for KeyService<S>
where
    S: ReaderWriter + Clone + Send + Sync + 'static,
{
    async fn handle(&self, from: &PeerId, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let request: FetchEncryptionKeyRequest = serde_json::from_slice(&data)?;
        debug!(from = %from, targets = request.targets.len(), "received key request");
        match self.try_gen_encryption_key(&request)? {
            Some(reply) => Ok(Some(serde_json::to_vec(&reply)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdcs_core::MemoryRootStore;

    fn service(hub: &MemoryPubSubHub, name: &str) -> (MemoryRootStore, Arc<KeyService<MemoryRootStore>>) {
        let store = MemoryRootStore::new();
        let pubsub = Arc::new(hub.join(PeerId::new(name)));
        (store.clone(), Arc::new(KeyService::new(pubsub, store)))
    }

    #[test]
    fn test_seal_open() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let sealed = seal(public.as_bytes(), b"key material", b"aad").unwrap();

        assert_eq!(open(&secret, &sealed, b"aad").unwrap(), b"key material");
        assert!(matches!(open(&secret, &sealed, b"other"), Err(DbError::KeyExchange(_))));

        let stranger = StaticSecret::random_from_rng(OsRng);
        assert!(open(&stranger, &sealed, b"aad").is_err());
        assert!(open(&secret, &sealed[..10], b"aad").is_err());
    }

    #[test]
    fn test_reply_only_holds_known_keys() {
        let hub = MemoryPubSubHub::new();
        let (store, holder) = service(&hub, "holder");
        let encryptor = DocEncryptor::new(store);
        encryptor.save_key("bae-1", Some("name"), &[7u8; KEY_LEN]).unwrap();

        let secret = StaticSecret::random_from_rng(OsRng);
        let request = FetchEncryptionKeyRequest {
            ephemeral_public_key: PublicKey::from(&secret).as_bytes().to_vec(),
            targets: vec![
                EncStoreDocKey::new("bae-1", None),
                EncStoreDocKey::new("bae-1", Some("name".to_string())),
            ],
        };
        let reply = holder.try_gen_encryption_key(&request).unwrap().unwrap();
        assert_eq!(reply.targets, vec![EncStoreDocKey::new("bae-1", Some("name".to_string()))]);

        let aad = associated_data(&request.ephemeral_public_key, holder.peer_id());
        assert_eq!(open(&secret, &reply.encrypted_keys, &aad).unwrap(), vec![7u8; KEY_LEN]);

        let unknown = FetchEncryptionKeyRequest {
            targets: vec![EncStoreDocKey::new("bae-2", None)],
            ..request
        };
        assert!(holder.try_gen_encryption_key(&unknown).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_exchanged_between_peers() {
        let hub = MemoryPubSubHub::new();
        let (holder_store, holder) = service(&hub, "holder");
        let (requester_store, requester) = service(&hub, "requester");
        holder.register().await.unwrap();
        requester.register().await.unwrap();

        DocEncryptor::new(holder_store)
            .save_key("bae-1", None, &[3u8; KEY_LEN])
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(requester.clone().run(rx));
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(KeyRequestEvent {
            keys: vec![EncStoreDocKey::new("bae-1", None)],
            resp: resp_tx,
        })
        .unwrap();

        let retrieved = resp_rx.await.unwrap().unwrap();
        assert_eq!(retrieved.len(), 1);
        assert_eq!(retrieved[0].key, vec![3u8; KEY_LEN]);

        let saved = DocEncryptor::new(requester_store).get_key("bae-1", None).unwrap();
        assert_eq!(saved, Some(vec![3u8; KEY_LEN]));
    }

    #[tokio::test]
    async fn test_no_holder_yields_nothing() {
        let hub = MemoryPubSubHub::new();
        let (_, holder) = service(&hub, "holder");
        let (_, requester) = service(&hub, "requester");
        holder.register().await.unwrap();

        let keys = requester.get_keys(&[EncStoreDocKey::new("bae-9", None)]).await.unwrap();
        assert!(keys.is_empty());
    }

    struct Echo {
        seen: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl TopicHandler for Echo {
        async fn handle(&self, _from: &PeerId, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
            let _ = self.seen.send(data.clone());
            Ok(Some(data))
        }
    }

    #[tokio::test]
    async fn test_reply_to_departed_publisher_is_dropped() {
        let hub = MemoryPubSubHub::new();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let responder = hub.join(PeerId::new("responder"));
        responder.add_topic("echo", Arc::new(Echo { seen: seen_tx })).await.unwrap();
        let publisher = hub.join(PeerId::new("publisher"));

        drop(publisher.send("echo", b"first".to_vec()).await.unwrap());
        assert_eq!(seen.recv().await.unwrap(), b"first".to_vec());

        let mut replies = publisher.send("echo", b"second".to_vec()).await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.from, PeerId::new("responder"));
        assert_eq!(reply.data, b"second".to_vec());
        assert!(replies.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let hub = MemoryPubSubHub::new();
        let (_, holder) = service(&hub, "holder");
        holder.register().await.unwrap();
        assert!(matches!(holder.register().await, Err(DbError::PubSub(_))));
    }
}
