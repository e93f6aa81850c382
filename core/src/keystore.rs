use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{RepoError, Result};
use crate::keys::{import_private_key, Key};

/// Keys known to a repository, reachable under every id they hash to.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: BTreeMap<String, Key>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` under all of its ids.
    ///
    /// Adding the same key twice is a no-op, except that a copy carrying
    /// private material replaces a public-only one.
    pub fn add(&mut self, key: Key) -> Result<()> {
        for id in key.keyids() {
            if let Some(existing) = self.keys.get(id) {
                if !existing.same_material(&key) {
                    return Err(RepoError::DuplicateKeyType { keyid: id.clone() });
                }
            }
        }
        for id in key.keyids() {
            let keep_existing = self
                .keys
                .get(id)
                .is_some_and(|existing| existing.private_key().is_some() && key.private_key().is_none());
            if !keep_existing {
                self.keys.insert(id.clone(), key.clone());
            }
        }
        debug!(keyid = key.keyid(), key_type = %key.key_type(), "key added");
        Ok(())
    }

    pub fn get(&self, keyid: &str) -> Result<&Key> {
        self.keys.get(keyid).ok_or_else(|| RepoError::KeyNotFound(keyid.to_string()))
    }

    pub fn contains(&self, keyid: &str) -> bool {
        self.keys.contains_key(keyid)
    }

    /// Drop a key under every id it is known by. Absent ids are ignored.
    pub fn remove(&mut self, keyid: &str) {
        if let Some(key) = self.keys.remove(keyid) {
            for id in key.keyids() {
                self.keys.remove(id);
            }
        }
    }

    /// Decode a private key file and store it, replacing any earlier copy.
    pub fn import(&mut self, raw: &[u8], password: Option<&str>) -> Result<Key> {
        let key = import_private_key(raw, password)?;
        self.remove(key.keyid());
        self.add(key.clone())?;
        Ok(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys.iter().filter(|(id, key)| key.keyid() == id.as_str()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyType, PrivateKey};

    fn key(seed: u8) -> Key {
        Key::from_private(PrivateKey::ed25519_from_seed([seed; 32])).unwrap()
    }

    #[test]
    fn add_is_idempotent_and_indexes_every_keyid() {
        let mut store = KeyStore::new();
        let k = key(1);
        store.add(k.public_only()).unwrap();
        store.add(k.public_only()).unwrap();
        assert_eq!(store.len(), 1);
        for id in k.keyids() {
            assert!(store.get(id).unwrap().same_material(&k));
        }
    }

    #[test]
    fn private_copy_supersedes_public_copy() {
        let mut store = KeyStore::new();
        let k = key(2);
        store.add(k.public_only()).unwrap();
        store.add(k.clone()).unwrap();
        store.add(k.public_only()).unwrap();
        assert!(store.get(k.keyid()).unwrap().private_key().is_some());
    }

    #[test]
    fn colliding_keyid_for_different_key_is_rejected() {
        let mut store = KeyStore::new();
        let a = key(3);
        store.add(a.clone()).unwrap();
        let impostor = Key::new(KeyType::Ed25519, key(4).public().to_string())
            .unwrap()
            .with_keyid(a.keyids()[1].clone());
        let err = store.add(impostor).unwrap_err();
        assert!(matches!(err, RepoError::DuplicateKeyType { keyid } if keyid == a.keyids()[1]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_is_a_noop_when_absent() {
        let mut store = KeyStore::new();
        store.remove("missing");
        let k = key(5);
        store.add(k.clone()).unwrap();
        store.remove(&k.keyids()[1]);
        assert!(store.is_empty());
        assert!(matches!(store.get(k.keyid()), Err(RepoError::KeyNotFound(_))));
    }
}
