use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// AES-256-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealerError {
    /// Key material was not valid base64 or not exactly 32 bytes.
    InvalidKey(String),

    /// The blob is too short to contain a nonce.
    CiphertextTooShort,

    /// The AEAD rejected the input (tampered ciphertext or wrong key).
    Crypto,
}

impl std::fmt::Display for SealerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealerError::InvalidKey(msg) => write!(f, "invalid encryption key: {msg}"),
            SealerError::CiphertextTooShort => write!(f, "ciphertext too short"),
            SealerError::Crypto => write!(f, "authenticated encryption failed"),
        }
    }
}

impl std::error::Error for SealerError {}

/// Authenticated encryption for provider tokens at rest.
///
/// Output layout is `nonce || ciphertext+tag` as a single opaque blob; a fresh
/// random nonce is drawn per `seal` call, so sealing the same plaintext twice
/// yields different blobs. The store keeps base64 text columns, hence the
/// `*_b64` helpers.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Build a sealer from a base64-encoded 32-byte key.
    ///
    /// Called once at startup; an unusable key is fatal for the whole
    /// credential subsystem, so the caller should fail fast.
    pub fn new(b64_key: &str) -> Result<Self, SealerError> {
        let key = STANDARD
            .decode(b64_key.trim())
            .map_err(|e| SealerError::InvalidKey(e.to_string()))?;
        if key.len() != 32 {
            return Err(SealerError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| SealerError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SealerError::Crypto)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Never returns partial or garbage plaintext on failure.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, SealerError> {
        if blob.len() < NONCE_LEN {
            return Err(SealerError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealerError::Crypto)
    }

    /// Seal and base64-encode, matching the text columns in the store.
    pub fn seal_b64(&self, plaintext: &str) -> Result<String, SealerError> {
        Ok(STANDARD.encode(self.seal(plaintext.as_bytes())?))
    }

    /// Decode base64 and open; decode failures report as `Crypto`.
    pub fn open_b64(&self, b64_blob: &str) -> Result<String, SealerError> {
        let blob = STANDARD
            .decode(b64_blob)
            .map_err(|_| SealerError::Crypto)?;
        let plain = self.open(&blob)?;
        String::from_utf8(plain).map_err(|_| SealerError::Crypto)
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sealer() -> Sealer {
        Sealer::new(&STANDARD.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(matches!(
            Sealer::new("not base64!!"),
            Err(SealerError::InvalidKey(_))
        ));
        assert!(matches!(
            Sealer::new(&STANDARD.encode([1u8; 16])),
            Err(SealerError::InvalidKey(_))
        ));
    }

    #[test]
    fn seal_open_round_trip() {
        let sealer = test_sealer();
        let blob = sealer.seal(b"app-password-jwt").unwrap();
        assert_eq!(sealer.open(&blob).unwrap(), b"app-password-jwt");
    }

    #[test]
    fn seal_is_nondeterministic_but_both_open() {
        let sealer = test_sealer();
        let a = sealer.seal(b"same plaintext").unwrap();
        let b = sealer.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(sealer.open(&a).unwrap(), b"same plaintext");
        assert_eq!(sealer.open(&b).unwrap(), b"same plaintext");
    }

    #[test]
    fn open_rejects_truncated_blob() {
        let sealer = test_sealer();
        assert_eq!(
            sealer.open(&[0u8; 5]),
            Err(SealerError::CiphertextTooShort)
        );
    }

    #[test]
    fn open_rejects_bit_flip() {
        let sealer = test_sealer();
        let mut blob = sealer.seal(b"token").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(sealer.open(&blob), Err(SealerError::Crypto));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let sealer = test_sealer();
        let other = Sealer::new(&STANDARD.encode([9u8; 32])).unwrap();
        let blob = sealer.seal(b"token").unwrap();
        assert_eq!(other.open(&blob), Err(SealerError::Crypto));
    }

    #[test]
    fn b64_helpers_round_trip() {
        let sealer = test_sealer();
        let enc = sealer.seal_b64("refresh-jwt").unwrap();
        assert_eq!(sealer.open_b64(&enc).unwrap(), "refresh-jwt");
        assert_eq!(sealer.open_b64("%%%"), Err(SealerError::Crypto));
    }
}
