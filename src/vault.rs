//! Credential vault for endpoint authentication secrets
//!
//! Wraps username/password pairs with the application certificate's RSA
//! keypair. Encryption only needs the public key; decryption requires the
//! matching private key. Plaintext credentials never persist.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::sha2::Sha256;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("no private key loaded")]
    MissingKey,

    #[error("ciphertext invalid: {0}")]
    CipherInvalid(String),

    #[error("key does not match ciphertext")]
    KeyMismatch,
}

/// Plaintext credential pair. Deliberately not `Debug` so secrets cannot leak
/// through log formatting.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Wrapped credential pair; both fields are base64 of the RSA ciphertext.
///
/// Equality is defined over the ciphertext so a configuration file that
/// round-trips through load/save preserves identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub username: String,
    pub password: String,
}

pub struct CredentialVault {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl CredentialVault {
    /// Build a vault from a PKCS#8 private key PEM. The public half is
    /// derived, so this vault can both encrypt and decrypt.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, VaultError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| VaultError::CipherInvalid(format!("invalid private key: {e}")))?;
        Ok(Self {
            public: private.to_public_key(),
            private: Some(private),
        })
    }

    /// Build an encrypt-only vault from an SPKI public key PEM.
    pub fn from_public_key_pem(pem: &str) -> Result<Self, VaultError> {
        let public = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| VaultError::CipherInvalid(format!("invalid public key: {e}")))?;
        Ok(Self {
            public,
            private: None,
        })
    }

    /// Generate a fresh 2048-bit keypair. Used when no application
    /// certificate is configured, and by tests.
    pub fn ephemeral() -> Self {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("RSA key generation");
        Self {
            public: private.to_public_key(),
            private: Some(private),
        }
    }

    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }

    pub fn encrypt(&self, credential: &Credential) -> Result<EncryptedCredential, VaultError> {
        Ok(EncryptedCredential {
            username: self.encrypt_str(&credential.username)?,
            password: self.encrypt_str(&credential.password)?,
        })
    }

    pub fn decrypt(&self, encrypted: &EncryptedCredential) -> Result<Credential, VaultError> {
        Ok(Credential {
            username: self.decrypt_str(&encrypted.username)?,
            password: self.decrypt_str(&encrypted.password)?,
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut rng = rand::thread_rng();
        let ciphertext = self
            .public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(|e| VaultError::CipherInvalid(e.to_string()))?;
        Ok(BASE64.encode(ciphertext))
    }

    pub fn decrypt_str(&self, ciphertext_b64: &str) -> Result<String, VaultError> {
        let private = self.private.as_ref().ok_or(VaultError::MissingKey)?;

        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| VaultError::CipherInvalid(format!("invalid base64: {e}")))?;

        let plaintext = private
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|_| VaultError::KeyMismatch)?;

        String::from_utf8(plaintext)
            .map_err(|e| VaultError::CipherInvalid(format!("invalid UTF-8: {e}")))
    }
}
