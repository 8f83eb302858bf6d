//! Clock configuration and per-commit options.

use crate::encryption::EncryptionConfig;
use crate::signature::SigningKey;
use serde::{Deserialize, Serialize};

/// Configuration bound to a [`MerkleClock`](crate::MerkleClock).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Fail the commit when registering a block as an additional head fails.
    ///
    /// When off, that failure is logged and the head set may miss the tip
    /// until a later block references it.
    #[serde(default)]
    pub strict_head_updates: bool,
}

/// Options for a single `add_delta` call.
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    pub signing_enabled: bool,
    pub identity: Option<SigningKey>,
    pub encryption: Option<EncryptionConfig>,
}

impl CommitOptions {
    pub fn builder() -> CommitOptionsBuilder {
        CommitOptionsBuilder::new()
    }
}

/// Builder for [`CommitOptions`].
#[derive(Clone, Debug, Default)]
pub struct CommitOptionsBuilder {
    options: CommitOptions,
}

impl CommitOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign with `key`.
    pub fn sign_with(mut self, key: SigningKey) -> Self {
        self.options.signing_enabled = true;
        self.options.identity = Some(key);
        self
    }

    pub fn signing(mut self, enabled: bool) -> Self {
        self.options.signing_enabled = enabled;
        self
    }

    pub fn encryption(mut self, config: EncryptionConfig) -> Self {
        self.options.encryption = Some(config);
        self
    }

    pub fn build(self) -> CommitOptions {
        self.options
    }
}
