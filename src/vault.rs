//! Credential vault
//!
//! Holds encrypted OAuth tokens per mailbox and decrypts on demand.
//! Rotation is atomic with respect to concurrent readers: a reader sees
//! the whole old credential or the whole new one, never a mix. Cipher
//! and key provisioning are an external collaborator behind the
//! `TokenCipher` trait.

use crate::error::PipelineError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Decrypted credential handed to a mail source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Symmetric cipher seam. Real deployments plug in a key-managed
/// implementation; key provisioning is not this crate's concern.
pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> String;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Pass-through cipher for development and tests.
pub struct PlaintextCipher;

impl TokenCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &str) -> String {
        plaintext.to_string()
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Trait for credential storage and rotation
#[async_trait::async_trait]
pub trait CredentialVault: Send + Sync {
    /// Decrypt and return the active credential for a mailbox.
    /// Fails with an auth error once the user has withdrawn access.
    async fn get_active_credential(&self, mailbox_id: Uuid) -> Result<Credential>;

    /// Replace the stored credential after an upstream refresh.
    async fn rotate(&self, mailbox_id: Uuid, new_credential: Credential) -> Result<()>;

    /// Mark the mailbox's credential as withdrawn by the user.
    async fn revoke(&self, mailbox_id: Uuid) -> Result<()>;
}

struct StoredCredential {
    access_token_enc: String,
    refresh_token_enc: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    revoked: bool,
}

/// In-memory vault for development; the storage seam is the trait above.
pub struct InMemoryVault {
    cipher: Arc<dyn TokenCipher>,
    entries: Arc<RwLock<HashMap<Uuid, StoredCredential>>>,
}

impl InMemoryVault {
    pub fn new(cipher: Arc<dyn TokenCipher>) -> Self {
        Self {
            cipher,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store the initial credential captured at OAuth linkage.
    pub async fn store(&self, mailbox_id: Uuid, credential: Credential) {
        let stored = StoredCredential {
            access_token_enc: self.cipher.encrypt(&credential.access_token),
            refresh_token_enc: credential
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t)),
            expires_at: credential.expires_at,
            revoked: false,
        };
        let mut entries = self.entries.write().await;
        entries.insert(mailbox_id, stored);
    }
}

#[async_trait::async_trait]
impl CredentialVault for InMemoryVault {
    async fn get_active_credential(&self, mailbox_id: Uuid) -> Result<Credential> {
        let entries = self.entries.read().await;
        let stored = entries
            .get(&mailbox_id)
            .ok_or_else(|| PipelineError::Vault(format!("no credential for mailbox {}", mailbox_id)))?;

        if stored.revoked {
            return Err(PipelineError::Auth(format!(
                "credential revoked for mailbox {}",
                mailbox_id
            )));
        }

        let refresh_token = match stored.refresh_token_enc.as_deref() {
            Some(enc) => Some(self.cipher.decrypt(enc)?),
            None => None,
        };

        Ok(Credential {
            access_token: self.cipher.decrypt(&stored.access_token_enc)?,
            refresh_token,
            expires_at: stored.expires_at,
        })
    }

    async fn rotate(&self, mailbox_id: Uuid, new_credential: Credential) -> Result<()> {
        // Single write-lock section: readers observe either the previous
        // credential in full or the new one in full.
        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(&mailbox_id)
            .ok_or_else(|| PipelineError::Vault(format!("no credential for mailbox {}", mailbox_id)))?;

        if stored.revoked {
            return Err(PipelineError::Auth(format!(
                "credential revoked for mailbox {}",
                mailbox_id
            )));
        }

        stored.access_token_enc = self.cipher.encrypt(&new_credential.access_token);
        stored.refresh_token_enc = new_credential
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t));
        stored.expires_at = new_credential.expires_at;

        Ok(())
    }

    async fn revoke(&self, mailbox_id: Uuid) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&mailbox_id) {
            Some(stored) => {
                stored.revoked = true;
                Ok(())
            }
            None => Err(PipelineError::Vault(format!(
                "no credential for mailbox {}",
                mailbox_id
            ))),
        }
    }
}
