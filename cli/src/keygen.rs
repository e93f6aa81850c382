use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use tracing::info;
use tufrepo_core::errors::{RepoError, Result};
use tufrepo_core::{encrypt_private_key, GeneratedKey, KdfParams, Key, KeyGenerator, KeyType, PrivateKey};

const RSA_BITS: usize = 3072;

/// Writes `<stem>` (password-encrypted private key) and `<stem>.pub` (key metadata JSON).
pub struct FsKeyGenerator {
    pub kdf: KdfParams,
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|source| RepoError::Io { path: path.to_path_buf(), source })
}

fn generate_private(key_type: KeyType) -> Result<PrivateKey> {
    Ok(match key_type {
        KeyType::Ed25519 => PrivateKey::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng)),
        KeyType::EcdsaNistp256 => PrivateKey::Ecdsa(p256::ecdsa::SigningKey::random(&mut OsRng)),
        KeyType::Rsa => {
            let key = rsa::RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|e| RepoError::Signing {
                keyid: key_type.to_string(),
                reason: format!("key generation failed: {e}"),
            })?;
            PrivateKey::Rsa(Box::new(key))
        }
    })
}

impl KeyGenerator for FsKeyGenerator {
    fn generate(&self, key_type: KeyType, password: &str, stem: &Path) -> Result<GeneratedKey> {
        if let Some(dir) = stem.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| RepoError::Io { path: dir.to_path_buf(), source })?;
        }
        let private = generate_private(key_type)?;
        let envelope = encrypt_private_key(&private, password, &self.kdf)?;
        let key = Key::from_private(private)?;

        let mut public_path = stem.as_os_str().to_owned();
        public_path.push(".pub");
        let public_path = PathBuf::from(public_path);
        write(stem, &envelope)?;
        write(&public_path, &serde_json::to_vec_pretty(&key.metadata())?)?;
        info!(keyid = key.keyid(), %key_type, path = %stem.display(), "key pair generated");

        Ok(GeneratedKey { public: key.public_only(), private: key, written: vec![stem.to_path_buf(), public_path] })
    }
}

#[cfg(test)]
mod tests {
    use tufrepo_core::import_private_key;

    use super::*;

    #[test]
    fn generated_pair_round_trips_through_import() {
        let dir = tempfile::tempdir().unwrap();
        let generator = FsKeyGenerator { kdf: KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 } };
        let stem = dir.path().join("keys/root_key");
        let generated = generator.generate(KeyType::EcdsaNistp256, "pw", &stem).unwrap();
        assert_eq!(generated.written.len(), 2);

        let public = Key::from_metadata_json(&fs::read(dir.path().join("keys/root_key.pub")).unwrap()).unwrap();
        assert_eq!(public.keyid(), generated.public.keyid());
        let private = import_private_key(&fs::read(&stem).unwrap(), Some("pw")).unwrap();
        assert_eq!(private.keyid(), generated.private.keyid());
    }
}
