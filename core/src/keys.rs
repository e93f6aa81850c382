//! Key material: supported key types, key ids, signing and verification, and
//! the private key import procedure.
//!
//! Key ids are content-derived: the hex digest of the canonical key metadata,
//! computed once per supported hash algorithm. The SHA-256 id is primary.

use std::fmt;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key as CipherKey, KeyInit, Nonce};
use p256::ecdsa::signature::{RandomizedSigner as _, SignatureEncoding as _, Signer as _, Verifier as _};
use p256::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _, EncodePrivateKey as _, EncodePublicKey as _, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::errors::{AttemptFailure, ImportAttempt, ImportFailures, RepoError, Result};
use crate::types::{canonical_bytes, sha256_hex, sha512_hex, KeyMetadata, KeyVal};

/// Hash algorithms key ids are computed with.
pub const KEYID_HASH_ALGORITHMS: [&str; 2] = ["sha256", "sha512"];

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// The closed set of key algorithms a repository accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ed25519,
    EcdsaNistp256,
    Rsa,
}

impl KeyType {
    pub const SUPPORTED: [KeyType; 3] = [KeyType::Ed25519, KeyType::EcdsaNistp256, KeyType::Rsa];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::EcdsaNistp256 => "ecdsa-sha2-nistp256",
            KeyType::Rsa => "rsa",
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::EcdsaNistp256 => "ecdsa-sha2-nistp256",
            KeyType::Rsa => "rsassa-pss-sha256",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        KeyType::SUPPORTED
            .into_iter()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| RepoError::UnsupportedKeyType(name.to_string()))
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted private key material.
pub enum PrivateKey {
    Ed25519(ed25519_dalek::SigningKey),
    Ecdsa(p256::ecdsa::SigningKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, <redacted>)", self.key_type())
    }
}

impl PrivateKey {
    pub fn ed25519_from_seed(seed: [u8; 32]) -> Self {
        PrivateKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::Ed25519(_) => KeyType::Ed25519,
            PrivateKey::Ecdsa(_) => KeyType::EcdsaNistp256,
            PrivateKey::Rsa(_) => KeyType::Rsa,
        }
    }

    /// Public half in its metadata encoding: hex for ed25519, SPKI PEM otherwise.
    pub fn public_material(&self) -> Result<String> {
        let pem_err = |e: p256::pkcs8::spki::Error| RepoError::UnsupportedKeyType(format!("{}: {e}", self.key_type()));
        match self {
            PrivateKey::Ed25519(sk) => Ok(hex::encode(sk.verifying_key().to_bytes())),
            PrivateKey::Ecdsa(sk) => sk.verifying_key().to_public_key_pem(LineEnding::LF).map_err(pem_err),
            PrivateKey::Rsa(sk) => {
                rsa::pkcs8::EncodePublicKey::to_public_key_pem(&sk.to_public_key(), LineEnding::LF)
                    .map_err(pem_err)
            }
        }
    }

    pub fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, String> {
        match self {
            PrivateKey::Ed25519(sk) => {
                let sig: ed25519_dalek::Signature = sk.try_sign(msg).map_err(|e| e.to_string())?;
                Ok(sig.to_bytes().to_vec())
            }
            PrivateKey::Ecdsa(sk) => {
                let sig: p256::ecdsa::Signature = sk.try_sign(msg).map_err(|e| e.to_string())?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            PrivateKey::Rsa(sk) => {
                let signer = rsa::pss::BlindedSigningKey::<Sha256>::new(sk.as_ref().clone());
                let sig = signer.try_sign_with_rng(&mut OsRng, msg).map_err(|e| e.to_string())?;
                Ok(sig.to_vec())
            }
        }
    }

    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        let pem = match self {
            PrivateKey::Ed25519(sk) => sk.to_pkcs8_pem(LineEnding::LF),
            PrivateKey::Ecdsa(sk) => sk.to_pkcs8_pem(LineEnding::LF),
            PrivateKey::Rsa(sk) => rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(sk.as_ref(), LineEnding::LF),
        }
        .map_err(|e| RepoError::UnsupportedKeyType(format!("{}: {e}", self.key_type())))?;
        Ok(Zeroizing::new(pem.as_str().to_owned()))
    }

    /// Parse an unencrypted PKCS#8 PEM key, trying each supported algorithm in turn.
    pub fn from_pkcs8_pem(pem: &str) -> std::result::Result<Self, String> {
        if let Ok(sk) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Ed25519(sk));
        }
        if let Ok(sk) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Ecdsa(sk));
        }
        match rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(sk) => Ok(PrivateKey::Rsa(Box::new(sk))),
            Err(e) => Err(format!("not an ed25519, ECDSA P-256 or RSA PKCS#8 key ({e})")),
        }
    }
}

/// A public key, optionally carrying the private half loaded for signing.
///
/// Keys are immutable and shared by every role that lists their id.
#[derive(Clone)]
pub struct Key {
    keyids: Vec<String>,
    key_type: KeyType,
    public: String,
    private: Option<Arc<PrivateKey>>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("keyid", &self.keyid())
            .field("key_type", &self.key_type)
            .field("private", &self.private.is_some())
            .finish()
    }
}

impl Key {
    pub fn new(key_type: KeyType, public: impl Into<String>) -> Result<Self> {
        let public = public.into();
        let hashed = canonical_bytes(&key_metadata(key_type, &public))?;
        let keyids = vec![sha256_hex(&hashed), sha512_hex(&hashed)];
        Ok(Key { keyids, key_type, public, private: None })
    }

    pub fn from_private(private: PrivateKey) -> Result<Self> {
        let mut key = Key::new(private.key_type(), private.public_material()?)?;
        key.private = Some(Arc::new(private));
        Ok(key)
    }

    /// Use `keyid` as the primary id, as declared by existing metadata.
    pub fn with_keyid(mut self, keyid: impl Into<String>) -> Self {
        let keyid = keyid.into();
        self.keyids.retain(|id| *id != keyid);
        self.keyids.insert(0, keyid);
        self
    }

    pub fn from_metadata(meta: &KeyMetadata) -> Result<Self> {
        let key_type = KeyType::parse(&meta.keytype)?;
        Key::new(key_type, meta.keyval.public.clone())
    }

    /// Import a public key file holding TUF key metadata JSON.
    pub fn from_metadata_json(raw: &[u8]) -> Result<Self> {
        let meta: KeyMetadata = serde_json::from_slice(raw)?;
        Key::from_metadata(&meta)
    }

    pub fn keyid(&self) -> &str {
        &self.keyids[0]
    }

    /// Every id this key is known under, primary first.
    pub fn keyids(&self) -> &[String] {
        &self.keyids
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn public(&self) -> &str {
        &self.public
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private.as_deref()
    }

    pub fn public_only(&self) -> Key {
        Key { private: None, ..self.clone() }
    }

    pub fn same_material(&self, other: &Key) -> bool {
        self.key_type == other.key_type && self.public == other.public
    }

    pub fn metadata(&self) -> KeyMetadata {
        key_metadata(self.key_type, &self.public)
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let private = self.private_key().ok_or_else(|| RepoError::Signing {
            keyid: self.keyid().to_string(),
            reason: "no private key loaded".into(),
        })?;
        private
            .sign(msg)
            .map_err(|reason| RepoError::Signing { keyid: self.keyid().to_string(), reason })
    }

    /// Check `sig` over `msg`. Malformed keys or signatures simply fail.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match self.key_type {
            KeyType::Ed25519 => {
                let Ok(bytes) = hex::decode(&self.public) else { return false };
                let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else { return false };
                let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&bytes) else { return false };
                let Ok(sig) = ed25519_dalek::Signature::from_slice(sig) else { return false };
                vk.verify(msg, &sig).is_ok()
            }
            KeyType::EcdsaNistp256 => {
                let Ok(vk) = p256::ecdsa::VerifyingKey::from_public_key_pem(&self.public) else { return false };
                let Ok(sig) = p256::ecdsa::Signature::from_der(sig) else { return false };
                vk.verify(msg, &sig).is_ok()
            }
            KeyType::Rsa => {
                let decoded = <rsa::RsaPublicKey as rsa::pkcs8::DecodePublicKey>::from_public_key_pem(&self.public);
                let Ok(pk) = decoded else { return false };
                let Ok(sig) = rsa::pss::Signature::try_from(sig) else { return false };
                rsa::pss::VerifyingKey::<Sha256>::new(pk).verify(msg, &sig).is_ok()
            }
        }
    }
}

fn key_metadata(key_type: KeyType, public: &str) -> KeyMetadata {
    KeyMetadata {
        keytype: key_type.as_str().to_string(),
        scheme: key_type.scheme().to_string(),
        keyid_hash_algorithms: KEYID_HASH_ALGORITHMS.iter().map(|a| a.to_string()).collect(),
        keyval: KeyVal { public: public.to_string() },
    }
}

/// Argon2id cost parameters for password-encrypted key files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams { memory_kib: 65536, iterations: 3, parallelism: 4 }
    }
}

/// On-disk form of a password-encrypted private key.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    keytype: String,
    scheme: String,
    keyval: KeyVal,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_cipher(password: &str, salt: &[u8], kdf: &KdfParams) -> std::result::Result<ChaCha20Poly1305, String> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| format!("invalid argon2 parameters: {e}"))?;
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| format!("key derivation failed: {e}"))?;
    Ok(ChaCha20Poly1305::new(CipherKey::from_slice(&key[..])))
}

/// Encrypt `key` under `password` into the envelope format read by [`import_private_key`].
pub fn encrypt_private_key(key: &PrivateKey, password: &str, kdf: &KdfParams) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key_type = key.key_type();
    let signing_err = |reason: String| RepoError::Signing { keyid: key_type.to_string(), reason };
    let cipher = derive_cipher(password, &salt, kdf).map_err(signing_err)?;
    let pem = key.to_pkcs8_pem()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), pem.as_bytes())
        .map_err(|e| signing_err(format!("encryption failed: {e}")))?;

    let file = EncryptedKeyFile {
        keytype: key_type.as_str().to_string(),
        scheme: key_type.scheme().to_string(),
        keyval: KeyVal { public: key.public_material()? },
        kdf: *kdf,
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: B64.encode(ciphertext),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

fn decrypt_envelope(raw: &[u8], password: Option<&str>) -> Result<std::result::Result<PrivateKey, String>> {
    let file: EncryptedKeyFile = match serde_json::from_slice(raw) {
        Ok(file) => file,
        Err(e) => return Ok(Err(format!("not an encrypted key envelope: {e}"))),
    };
    let declared = KeyType::parse(&file.keytype)?;
    let Some(password) = password else {
        return Ok(Err("a password is required to decrypt the key".into()));
    };
    let decoded = (|| {
        let salt = hex::decode(&file.salt).map_err(|e| format!("bad salt: {e}"))?;
        let nonce = hex::decode(&file.nonce).map_err(|e| format!("bad nonce: {e}"))?;
        if nonce.len() != NONCE_LEN {
            return Err(format!("nonce must be {NONCE_LEN} bytes"));
        }
        let ciphertext = B64.decode(&file.ciphertext).map_err(|e| format!("bad ciphertext: {e}"))?;
        let cipher = derive_cipher(password, &salt, &file.kdf)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| "decryption failed (wrong password?)".to_string())?;
        let pem = std::str::from_utf8(&plaintext).map_err(|_| "decrypted key is not PEM".to_string())?;
        PrivateKey::from_pkcs8_pem(pem)
    })();
    Ok(decoded.and_then(|key| {
        if key.key_type() == declared {
            Ok(key)
        } else {
            Err(format!("envelope declares {declared} but holds a {} key", key.key_type()))
        }
    }))
}

fn attempt(kind: ImportAttempt, raw: &[u8], password: Option<&str>) -> Result<std::result::Result<PrivateKey, String>> {
    match kind {
        ImportAttempt::EncryptedEnvelope => decrypt_envelope(raw, password),
        ImportAttempt::Pkcs8Pem => Ok(std::str::from_utf8(raw)
            .map_err(|_| "key file is not UTF-8 text".to_string())
            .and_then(PrivateKey::from_pkcs8_pem)),
    }
}

/// Import a private key from raw file contents.
///
/// Formats are tried in a fixed order (encrypted envelope, then plain PKCS#8
/// PEM); the first success wins. When every attempt fails the error lists all
/// attempts, the last one being the reported cause.
pub fn import_private_key(raw: &[u8], password: Option<&str>) -> Result<Key> {
    let mut failures = Vec::new();
    for kind in [ImportAttempt::EncryptedEnvelope, ImportAttempt::Pkcs8Pem] {
        match attempt(kind, raw, password)? {
            Ok(private) => return Key::from_private(private),
            Err(detail) => {
                debug!(attempt = %kind, %detail, "private key import attempt failed");
                failures.push(AttemptFailure { attempt: kind, detail });
            }
        }
    }
    Err(RepoError::KeyImport(ImportFailures(failures)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_kdf() -> KdfParams {
        KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 }
    }

    #[test]
    fn keyids_are_content_derived() {
        let a = Key::from_private(PrivateKey::ed25519_from_seed([1u8; 32])).unwrap();
        let b = Key::new(KeyType::Ed25519, a.public().to_string()).unwrap();
        assert_eq!(a.keyids(), b.keyids());
        assert_eq!(a.keyid().len(), 64);
        assert_eq!(a.keyids()[1].len(), 128);
    }

    #[test]
    fn unsupported_key_type_is_rejected() {
        let raw = br#"{"keytype":"dsa","scheme":"dsa","keyval":{"public":"00"}}"#;
        let err = Key::from_metadata_json(raw).unwrap_err();
        assert!(matches!(err, RepoError::UnsupportedKeyType(t) if t == "dsa"));
    }

    fn rsa_key() -> PrivateKey {
        PrivateKey::Rsa(Box::new(rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap()))
    }

    #[test]
    fn every_key_type_signs_and_verifies() {
        let ecdsa = p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap();
        for private in [PrivateKey::ed25519_from_seed([3u8; 32]), PrivateKey::Ecdsa(ecdsa), rsa_key()] {
            let key = Key::from_private(private).unwrap();
            let sig = key.sign(b"payload").unwrap();
            assert!(key.public_only().verify(b"payload", &sig), "{} signature rejected", key.key_type());
            assert!(!key.verify(b"other payload", &sig));
        }
    }

    #[test]
    fn signatures_do_not_cross_key_types() {
        let ed = Key::from_private(PrivateKey::ed25519_from_seed([3u8; 32])).unwrap();
        let rsa = Key::from_private(rsa_key()).unwrap();
        let sig = rsa.sign(b"payload").unwrap();
        assert!(!ed.verify(b"payload", &sig));
        assert!(!Key::from_private(rsa_key()).unwrap().verify(b"payload", &sig));
    }

    #[test]
    fn encrypted_envelope_round_trips_with_password() {
        let private = PrivateKey::ed25519_from_seed([5u8; 32]);
        let expected = Key::from_private(PrivateKey::ed25519_from_seed([5u8; 32])).unwrap();
        let raw = encrypt_private_key(&private, "hunter2", &cheap_kdf()).unwrap();

        let key = import_private_key(&raw, Some("hunter2")).unwrap();
        assert_eq!(key.keyid(), expected.keyid());
        assert!(key.private_key().is_some());
    }

    #[test]
    fn wrong_password_reports_every_attempt() {
        let raw = encrypt_private_key(&PrivateKey::ed25519_from_seed([5u8; 32]), "right", &cheap_kdf()).unwrap();
        let err = import_private_key(&raw, Some("wrong")).unwrap_err();
        let RepoError::KeyImport(failures) = err else { panic!("expected KeyImport, got {err:?}") };
        let attempts: Vec<_> = failures.0.iter().map(|f| f.attempt).collect();
        assert_eq!(attempts, vec![ImportAttempt::EncryptedEnvelope, ImportAttempt::Pkcs8Pem]);
        assert!(failures.0[0].detail.contains("wrong password"));
    }

    #[test]
    fn plain_pem_is_the_fallback() {
        let private = PrivateKey::ed25519_from_seed([9u8; 32]);
        let pem = private.to_pkcs8_pem().unwrap();
        let key = import_private_key(pem.as_bytes(), Some("unused")).unwrap();
        assert_eq!(key.key_type(), KeyType::Ed25519);
        assert_eq!(key.public(), private.public_material().unwrap());
    }

    #[test]
    fn plain_rsa_pem_imports_under_the_same_keyid() {
        let private = rsa_key();
        let expected = Key::new(KeyType::Rsa, private.public_material().unwrap()).unwrap();
        let pem = private.to_pkcs8_pem().unwrap();

        let key = import_private_key(pem.as_bytes(), None).unwrap();
        assert_eq!(key.key_type(), KeyType::Rsa);
        assert_eq!(key.keyid(), expected.keyid());
        let sig = key.sign(b"payload").unwrap();
        assert!(expected.verify(b"payload", &sig));
    }

    #[test]
    fn encrypted_rsa_envelope_round_trips() {
        let private = rsa_key();
        let public = private.public_material().unwrap();
        let raw = encrypt_private_key(&private, "pw", &cheap_kdf()).unwrap();
        let key = import_private_key(&raw, Some("pw")).unwrap();
        assert_eq!(key.key_type(), KeyType::Rsa);
        assert_eq!(key.public(), public);
    }
}
