//! Payload cipher and credential obfuscation
//!
//! Packet payloads on the data plane are sealed with the group cipher before
//! framing and opened after decoding. AES uses AES-256-GCM with a random
//! nonce prepended to each sealed payload:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬────────────┐
//! │ Nonce (12B)  │ Ciphertext               │ Tag (16B)  │
//! └──────────────┴──────────────────────────┴────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// Fixed key for obfuscating the group credential on the wire
const CREDENTIAL_KEY: &[u8] = b"vilan_hash_key";

/// Cipher families a group can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    None,
    #[default]
    Aes,
    Des,
    Rsa,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Cipher family not available in this build
    Unsupported(CipherKind),
    /// Key material unusable
    InvalidKey,
    /// Sealing failed
    Seal,
    /// Payload failed authentication or is truncated
    Open,
    Rng,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::Unsupported(kind) => write!(f, "cipher {:?} not supported", kind),
            CipherError::InvalidKey => write!(f, "invalid cipher key"),
            CipherError::Seal => write!(f, "failed to seal payload"),
            CipherError::Open => write!(f, "failed to open payload"),
            CipherError::Rng => write!(f, "random source failed"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Symmetric payload cipher
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;
}

// ============================================================================
// AES-256-GCM
// ============================================================================

pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    /// Derive the key from arbitrary key material with SHA-256
    pub fn new(material: &[u8]) -> Result<Self, CipherError> {
        if material.is_empty() {
            return Err(CipherError::InvalidKey);
        }
        let derived = digest::digest(&digest::SHA256, material);
        let unbound =
            UnboundKey::new(&AES_256_GCM, derived.as_ref()).map_err(|_| CipherError::InvalidKey)?;
        Ok(AesGcmCipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CipherError::Rng)?;

        let mut in_out = plain.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + aead::MAX_TAG_LEN {
            return Err(CipherError::Open);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CipherError::Open)?;

        let mut in_out = body.to_vec();
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Open)?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }
}

/// Build the cipher for `kind`; `Ok(None)` means plaintext operation
pub fn build_cipher(kind: CipherKind, key: &str) -> Result<Option<Arc<dyn Cipher>>, CipherError> {
    match kind {
        CipherKind::None => Ok(None),
        CipherKind::Aes => Ok(Some(Arc::new(AesGcmCipher::new(key.as_bytes())?))),
        other => Err(CipherError::Unsupported(other)),
    }
}

/// Obfuscate the group credential for the registration request (hex HMAC)
pub fn obfuscate_credential(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let key = hmac::Key::new(hmac::HMAC_SHA256, CREDENTIAL_KEY);
    let tag = hmac::sign(&key, secret.as_bytes());
    tag.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random non-zero cookie for paginated responses
pub fn generate_cookie() -> u32 {
    let rng = SystemRandom::new();
    let mut buf = [0u8; 4];
    if rng.fill(&mut buf).is_err() {
        log::warn!("random source failed, using fallback cookie");
        return 1;
    }
    u32::from_ne_bytes(buf).wrapping_add(1).max(1)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_seal_open() {
        let cipher = AesGcmCipher::new(b"group-secret").unwrap();
        let plain = b"ethernet frame bytes".to_vec();

        let sealed = cipher.encrypt(&plain).unwrap();
        assert_ne!(sealed, plain);
        assert_eq!(sealed.len(), NONCE_LEN + plain.len() + aead::MAX_TAG_LEN);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), plain);
    }

    #[test]
    fn test_aes_rejects_tampering() {
        let cipher = AesGcmCipher::new(b"group-secret").unwrap();
        let mut sealed = cipher.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert_eq!(cipher.decrypt(&sealed), Err(CipherError::Open));
        assert_eq!(cipher.decrypt(&[0u8; 4]), Err(CipherError::Open));
    }

    #[test]
    fn test_aes_wrong_key() {
        let a = AesGcmCipher::new(b"one").unwrap();
        let b = AesGcmCipher::new(b"two").unwrap();
        let sealed = a.encrypt(b"payload").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_build_cipher_kinds() {
        assert!(build_cipher(CipherKind::None, "k").unwrap().is_none());
        assert!(build_cipher(CipherKind::Aes, "k").unwrap().is_some());
        assert_eq!(
            build_cipher(CipherKind::Des, "k").err(),
            Some(CipherError::Unsupported(CipherKind::Des))
        );
        assert_eq!(
            build_cipher(CipherKind::Aes, "").err(),
            Some(CipherError::InvalidKey)
        );
    }

    #[test]
    fn test_obfuscate_credential() {
        let a = obfuscate_credential("secret");
        assert_eq!(a.len(), 64);
        assert_eq!(a, obfuscate_credential("secret"));
        assert_ne!(a, obfuscate_credential("other"));
        assert!(!a.contains("secret"));
        assert_eq!(obfuscate_credential(""), "");
    }

    #[test]
    fn test_generate_cookie_nonzero() {
        for _ in 0..16 {
            assert_ne!(generate_cookie(), 0);
        }
    }
}
