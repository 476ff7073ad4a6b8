//! Opaque enclave encryption capability.
//!
//! The cryptographic protocol itself is an external collaborator; the
//! session manager only enforces the tag-scoped role checks in front of it
//! and, in external mode, bridges calls through the system browser.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IamResult;

/// One plaintext to encrypt, with its access-control tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptItem {
    /// Plaintext payload.
    pub data: String,
    /// Access-control tags; each requires a `_tide_<tag>.selfencrypt` role.
    pub tags: Vec<String>,
}

/// One ciphertext to decrypt, with its access-control tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptItem {
    /// Ciphertext payload.
    pub encrypted: String,
    /// Access-control tags; each requires a `_tide_<tag>.selfdecrypt` role.
    pub tags: Vec<String>,
}

/// Realm role required to encrypt data carrying `tag`.
#[must_use]
pub fn self_encrypt_role(tag: &str) -> String {
    format!("_tide_{tag}.selfencrypt")
}

/// Realm role required to decrypt data carrying `tag`.
#[must_use]
pub fn self_decrypt_role(tag: &str) -> String {
    format!("_tide_{tag}.selfdecrypt")
}

/// Opaque encrypt/decrypt capability backed by the secure-enclave protocol.
#[async_trait]
pub trait EnclaveClient: Send + Sync {
    /// Encrypt a batch; outputs are positionally aligned with inputs.
    ///
    /// # Errors
    /// Any failure of the underlying protocol.
    async fn encrypt(&self, items: &[EncryptItem]) -> IamResult<Vec<String>>;

    /// Decrypt a batch; outputs are positionally aligned with inputs.
    ///
    /// # Errors
    /// Any failure of the underlying protocol.
    async fn decrypt(&self, items: &[DecryptItem]) -> IamResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    //! Unit tests for tag-role naming.
    use super::*;

    #[test]
    fn test_tag_role_format() {
        assert_eq!(self_encrypt_role("dob"), "_tide_dob.selfencrypt");
        assert_eq!(self_decrypt_role("dob"), "_tide_dob.selfdecrypt");
    }
}
