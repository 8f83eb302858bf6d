//! Payload encryption for document and field deltas.
//!
//! Keys are 32 random bytes kept in the encryption store under
//! `/keys/{doc}[/{field}]`. The `Encryption` side-blocks that record which
//! key a block was sealed with live under `/blocks` of the same store. Once a
//! position has an encryption link, every later block built on it reuses the
//! same key.

use crate::block::{Block, Encryption};
use crate::blockstore::BlockStore;
use crate::error::{MerkleError, Result};
use crate::link::Cid;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use mdcs_core::keys::EncStoreDocKey;
use mdcs_core::store::{Namespaced, Reader, Writer};
use mdcs_core::Context;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const KEYS_PREFIX: &[u8] = b"/keys";
const BLOCKS_PREFIX: &[u8] = b"/blocks";

/// Which parts of a document a write asks to encrypt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt every field with one document key.
    pub encrypt_doc: bool,
    /// Fields encrypted with their own key.
    pub encrypted_fields: Vec<String>,
}

impl EncryptionConfig {
    pub fn document() -> Self {
        Self {
            encrypt_doc: true,
            encrypted_fields: Vec::new(),
        }
    }

    pub fn fields<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        Self {
            encrypt_doc: false,
            encrypted_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn should_encrypt_field(&self, field: &str) -> bool {
        self.encrypt_doc || self.encrypted_fields.iter().any(|f| f == field)
    }

    /// Whether `field` gets its own key rather than the document key.
    pub fn is_individual(&self, field: &str) -> bool {
        !self.encrypt_doc && self.encrypted_fields.iter().any(|f| f == field)
    }
}

/// Generate a fresh symmetric key.
pub fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| MerkleError::InvalidKeyLength(key.len()))
}

/// Seal `plaintext`; the output is `nonce || ciphertext`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| MerkleError::Encrypting(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open the output of [`encrypt`]. `doc_id` is only used for error context.
pub fn decrypt(doc_id: &[u8], key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let failed = |reason: &str| MerkleError::Decrypting {
        doc_id: String::from_utf8_lossy(doc_id).into_owned(),
        reason: reason.to_string(),
    };
    if data.len() < NONCE_LEN {
        return Err(failed("ciphertext shorter than nonce"));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    cipher(key)?
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| failed("authentication failed"))
}

/// Per-node key store and encryption side-block store.
#[derive(Clone, Debug)]
pub struct DocEncryptor<S> {
    keys: Namespaced<S>,
    blocks: BlockStore<Namespaced<S>>,
}

impl<S: Clone> DocEncryptor<S> {
    pub fn new(encstore: S) -> Self {
        Self {
            keys: Namespaced::new(encstore.clone(), KEYS_PREFIX),
            blocks: BlockStore::new(Namespaced::new(encstore, BLOCKS_PREFIX)),
        }
    }
}

impl<S> DocEncryptor<S> {
    pub fn blocks(&self) -> &BlockStore<Namespaced<S>> {
        &self.blocks
    }
}

impl<S: Reader> DocEncryptor<S> {
    pub fn get_key(&self, doc_id: &str, field_name: Option<&str>) -> Result<Option<Vec<u8>>> {
        let key = EncStoreDocKey::new(doc_id, field_name.map(str::to_string));
        match self.keys.get(&key.bytes()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_encryption_block(&self, cid: &Cid) -> Result<Encryption> {
        self.blocks
            .get(cid)
            .map_err(|source| MerkleError::CouldNotLoadEncryptionBlock {
                cid: cid.to_string(),
                source: Box::new(source),
            })
    }

    /// The key a block was encrypted with, if the block is encrypted.
    pub fn block_encryption(&self, block: &Block) -> Result<Option<Encryption>> {
        block
            .encryption
            .as_ref()
            .map(|cid| self.get_encryption_block(cid))
            .transpose()
    }

    /// Find a locally held key for a field: its own key first, then the document key.
    pub fn find_key(&self, doc_id: &str, field_name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(key) = self.get_key(doc_id, Some(field_name))? {
            return Ok(Some(key));
        }
        self.get_key(doc_id, None)
    }
}

impl<S: Reader + Writer> DocEncryptor<S> {
    pub fn save_key(&self, doc_id: &str, field_name: Option<&str>, key: &[u8]) -> Result<()> {
        if key.len() != KEY_LEN {
            return Err(MerkleError::InvalidKeyLength(key.len()));
        }
        let store_key = EncStoreDocKey::new(doc_id, field_name.map(str::to_string));
        Ok(self.keys.set(&store_key.bytes(), key)?)
    }

    /// Return the stored key or create and store a new one.
    ///
    /// Two writers racing on a fresh document may both generate; whichever
    /// commit lands first wins and the other sees a transaction conflict.
    pub fn get_or_generate_key(&self, doc_id: &str, field_name: Option<&str>) -> Result<Vec<u8>> {
        if let Some(key) = self.get_key(doc_id, field_name)? {
            return Ok(key);
        }
        let key = generate_key();
        self.save_key(doc_id, field_name, &key)?;
        tracing::debug!(doc_id, field = ?field_name, "generated encryption key");
        Ok(key)
    }

    pub fn put_encryption_block(&self, encryption: &Encryption) -> Result<Cid> {
        self.blocks.put(encryption)
    }
}

/// Decide which key, if any, seals the payload of a new block.
///
/// An explicit `config` covering the field wins and fetches or generates the
/// key. Otherwise the key of the first parent that carries an encryption link
/// is reused. Without either the block stays plaintext.
pub fn determine_block_encryption<B, E>(
    ctx: &Context,
    block: &Block,
    config: Option<&EncryptionConfig>,
    blockstore: &BlockStore<B>,
    encryptor: &DocEncryptor<E>,
) -> Result<Option<Encryption>>
where
    B: Reader,
    E: Reader + Writer,
{
    let doc_id = block.delta.doc_id();
    let field_name = block.delta.field_name();

    if let Some(config) = config.filter(|c| c.should_encrypt_field(field_name)) {
        let scoped_field = if config.encrypt_doc {
            None
        } else {
            Some(field_name)
        };
        let doc = String::from_utf8_lossy(doc_id);
        let key = encryptor.get_or_generate_key(&doc, scoped_field)?;
        return Ok(Some(Encryption {
            doc_id: doc_id.to_vec(),
            field_name: scoped_field.map(str::to_string),
            key,
        }));
    }

    for head in &block.heads {
        ctx.check()?;
        let parent: Block = blockstore.get(head)?;
        if let Some(encryption) = encryptor.block_encryption(&parent)? {
            return Ok(Some(encryption));
        }
    }
    Ok(None)
}

/// Copy of `block` whose payload is sealed with `encryption`.
///
/// Composite and collection-level deltas carry no payload and are returned
/// unchanged apart from the link.
pub fn encrypt_block(block: &Block, encryption: &Encryption, link: Cid) -> Result<Block> {
    let mut sealed = block.clone();
    sealed.encryption = Some(link);
    if block.delta.is_composite() || block.delta.is_collection() {
        return Ok(sealed);
    }
    if let Some(data) = block.delta.data() {
        let ciphertext = encrypt(&encryption.key, data)?;
        sealed.delta.set_data(ciphertext);
    }
    Ok(sealed)
}

/// Copy of `block` with its payload opened by `key`.
pub fn decrypt_block(block: &Block, key: &[u8]) -> Result<Block> {
    let mut plain = block.clone();
    if block.delta.is_composite() || block.delta.is_collection() {
        return Ok(plain);
    }
    if let Some(data) = block.delta.data() {
        let opened = decrypt(block.delta.doc_id(), key, data)?;
        plain.delta.set_data(opened);
    }
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdcs_core::{LWWRegDelta, MemoryRootStore};

    fn field_block(field: &str, data: &[u8], heads: Vec<Cid>) -> Block {
        Block::new(
            LWWRegDelta {
                doc_id: b"bae-1".to_vec(),
                field_name: field.to_string(),
                priority: 1,
                data: data.to_vec(),
                ..Default::default()
            }
            .into(),
            vec![],
            heads,
        )
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = generate_key();
        let sealed = encrypt(&key, b"secret").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 6 + 16);
        assert_eq!(decrypt(b"bae-1", &key, &sealed).unwrap(), b"secret");
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let sealed = encrypt(&generate_key(), b"secret").unwrap();
        assert!(matches!(
            decrypt(b"bae-1", &generate_key(), &sealed),
            Err(MerkleError::Decrypting { doc_id, .. }) if doc_id == "bae-1"
        ));
        assert!(matches!(
            decrypt(b"bae-1", &generate_key(), &sealed[..4]),
            Err(MerkleError::Decrypting { .. })
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(encrypt(&[1; 16], b"x"), Err(MerkleError::InvalidKeyLength(16))));
    }

    #[test]
    fn test_config_scoping() {
        let doc = EncryptionConfig::document();
        assert!(doc.should_encrypt_field("age"));
        assert!(!doc.is_individual("age"));

        let fields = EncryptionConfig::fields(["age"]);
        assert!(fields.should_encrypt_field("age"));
        assert!(fields.is_individual("age"));
        assert!(!fields.should_encrypt_field("name"));
    }

    #[test]
    fn test_get_or_generate_is_stable() {
        let enc = DocEncryptor::new(MemoryRootStore::new());
        let a = enc.get_or_generate_key("bae-1", Some("age")).unwrap();
        let b = enc.get_or_generate_key("bae-1", Some("age")).unwrap();
        assert_eq!(a, b);
        assert_eq!(enc.get_key("bae-1", None).unwrap(), None);
        assert_eq!(enc.find_key("bae-1", "age").unwrap(), Some(a));
    }

    #[test]
    fn test_explicit_config_generates_scoped_key() {
        let store = MemoryRootStore::new();
        let blocks = BlockStore::new(store.clone());
        let enc = DocEncryptor::new(Namespaced::new(store, b"/enc".to_vec()));
        let block = field_block("age", b"33", vec![]);

        let config = EncryptionConfig::fields(["age"]);
        let encryption = determine_block_encryption(&Context::new(), &block, Some(&config), &blocks, &enc)
            .unwrap()
            .unwrap();
        assert_eq!(encryption.field_name.as_deref(), Some("age"));
        assert_eq!(enc.get_key("bae-1", Some("age")).unwrap(), Some(encryption.key.clone()));

        let other = field_block("name", b"Bob", vec![]);
        assert!(determine_block_encryption(&Context::new(), &other, Some(&config), &blocks, &enc)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_key_is_inherited_from_parent() {
        let store = MemoryRootStore::new();
        let blocks = BlockStore::new(store.clone());
        let enc = DocEncryptor::new(Namespaced::new(store, b"/enc".to_vec()));

        let first = field_block("age", b"33", vec![]);
        let encryption = determine_block_encryption(
            &Context::new(),
            &first,
            Some(&EncryptionConfig::document()),
            &blocks,
            &enc,
        )
        .unwrap()
        .unwrap();
        let link = enc.put_encryption_block(&encryption).unwrap();
        let sealed = encrypt_block(&first, &encryption, link).unwrap();
        let parent = blocks.put(&sealed).unwrap();

        let second = field_block("age", b"34", vec![parent]);
        let inherited = determine_block_encryption(&Context::new(), &second, None, &blocks, &enc)
            .unwrap()
            .unwrap();
        assert_eq!(inherited, encryption);
    }

    #[test]
    fn test_encrypt_block_skips_composite() {
        let encryption = Encryption {
            doc_id: b"bae-1".to_vec(),
            field_name: None,
            key: generate_key(),
        };
        let link = crate::link::compute_cid(b"enc").unwrap();

        let composite = Block::new(mdcs_core::CompositeDAGDelta::default().into(), vec![], vec![]);
        let sealed = encrypt_block(&composite, &encryption, link).unwrap();
        assert_eq!(sealed.delta, composite.delta);
        assert_eq!(sealed.encryption, Some(link));

        let field = field_block("age", b"33", vec![]);
        let sealed = encrypt_block(&field, &encryption, link).unwrap();
        assert_ne!(sealed.delta.data(), field.delta.data());
        assert_eq!(decrypt_block(&sealed, &encryption.key).unwrap().delta, field.delta);
    }
}
