//! Secure `SecurityAccess` key material (design §4.2 "Security"): PEM private
//! keys looked up by the server's certificate-serial-number and used to sign a
//! server-issued seed.
//!
//! Non-secure mode needs no key store at all: seed/key are the fixed pair
//! `42`/`23` (design §4.2, §4.4 `ConfigureDevice`).

use crate::error::{Error, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fixed non-secure seed/key pair (design §4.2, §4.4).
pub const NON_SECURE_SEED: u8 = 42;
pub const NON_SECURE_KEY: u8 = 23;

/// A directory of PEM private keys, one per certificate serial number, named
/// `<serial>.pem`. Loaded lazily and cached by serial on first use.
#[derive(Debug)]
pub struct SecurityKeyStore {
    directory: PathBuf,
    cache: HashMap<String, RsaPrivateKey>,
}

impl SecurityKeyStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cache: HashMap::new(),
        }
    }

    fn load(&self, serial: &str) -> Result<RsaPrivateKey> {
        let path = self.path_for(serial);
        let pem_text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Checksum(format!("no PEM key for certificate serial '{}': {}", serial, e)))?;
        RsaPrivateKey::from_pkcs8_pem(&pem_text)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem_text))
            .map_err(|e| Error::Checksum(format!("malformed PEM key for certificate serial '{}': {}", serial, e)))
    }

    fn path_for(&self, serial: &str) -> PathBuf {
        self.directory.join(format!("{}.pem", serial))
    }

    /// Signs `seed` with the key matching `certificate_serial`, caching the
    /// parsed key for subsequent calls (design §4.2: "locates a PEM key by the
    /// server's certificate-serial-number, signs the seed").
    pub fn sign(&mut self, certificate_serial: &str, seed: &[u8]) -> Result<Vec<u8>> {
        if !self.cache.contains_key(certificate_serial) {
            let key = self.load(certificate_serial)?;
            self.cache.insert(certificate_serial.to_string(), key);
        }
        let key = self.cache.get(certificate_serial).expect("just inserted");

        let digest = Sha256::digest(seed);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| Error::Checksum(format!("RSA signing failed: {}", e)))
    }

    /// Key size in bytes, used to size the `send-key` payload before signing
    /// actually happens (callers may want to pre-allocate).
    pub fn key_size(&self, certificate_serial: &str) -> Option<usize> {
        self.cache.get(certificate_serial).map(|k| k.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn write_test_key(dir: &Path, serial: &str) {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let pem = key.to_pkcs8_pem(Default::default()).unwrap();
        std::fs::write(dir.join(format!("{}.pem", serial)), pem.as_bytes()).unwrap();
    }

    #[test]
    fn missing_serial_is_a_checksum_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SecurityKeyStore::new(dir.path());
        let result = store.sign("00000000", b"seed");
        assert!(matches!(result, Err(Error::Checksum(_))));
    }

    #[test]
    fn signs_with_key_matching_serial() {
        let dir = tempfile::tempdir().unwrap();
        write_test_key(dir.path(), "12345678");
        let mut store = SecurityKeyStore::new(dir.path());
        let signature = store.sign("12345678", b"seed-bytes").unwrap();
        assert!(!signature.is_empty());
        assert_eq!(store.key_size("12345678"), Some(signature.len()));
    }
}
