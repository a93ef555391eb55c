//! Durable record of the last known passkey session.
//!
//! The record lives in the host's per-origin key/value storage under fixed key
//! names. A missing key is not an error: it means there is no session.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::DialogError;

/// Storage key of the credential id.
pub const CREDENTIAL_ID_KEY: &str = "CREDENTIAL_ID";
/// Storage key of the base64 public key.
pub const PUBLIC_KEY_KEY: &str = "PUBLIC_KEY";
/// Storage key of the derived wallet address.
pub const SMART_WALLET_ADDRESS_KEY: &str = "SMART_WALLET_ADDRESS";
/// Storage key of the last update timestamp (ms since epoch).
pub const UPDATED_AT_KEY: &str = "UPDATED_AT";

/// Minimal key/value interface over the host's durable per-origin storage.
pub trait KeyValueStorage {
    /// Reads the value at `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses the read.
    fn get(&self, key: &str) -> Result<Option<String>, DialogError>;

    /// Writes `value` at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses the write (quota, privacy mode).
    fn set(&self, key: &str, value: &str) -> Result<(), DialogError>;

    /// Removes `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses the delete.
    fn remove(&self, key: &str) -> Result<(), DialogError>;
}

/// The minimal durable data identifying an established passkey session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Passkey credential id. A different id is a different session.
    pub credential_id: String,
    /// Public key material, raw bytes.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Wallet address derived from the credential.
    pub derived_address: Option<String>,
    /// Last write, ms since epoch.
    pub updated_at: u64,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// What [`SessionStore::reconcile`] did with an incoming credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconciliation {
    /// No session, or a different credential: a new record was written.
    Created,
    /// The credential was already stored and was reused.
    Reused,
}

/// Typed access to the persisted [`CredentialRecord`].
pub struct SessionStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> SessionStore<S> {
    /// Wraps a storage backend.
    pub const fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The underlying backend.
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Loads the stored record.
    ///
    /// Returns `Ok(None)` when no session is stored, or when the stored fields are
    /// incomplete (a torn write is treated as no session).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the stored public key is not base64.
    pub fn load(&self) -> Result<Option<CredentialRecord>, DialogError> {
        let Some(credential_id) = self.storage.get(CREDENTIAL_ID_KEY)? else {
            return Ok(None);
        };
        let Some(public_key) = self.storage.get(PUBLIC_KEY_KEY)? else {
            log::warn!("stored session has no public key, ignoring it");
            return Ok(None);
        };
        let public_key = STANDARD
            .decode(public_key)
            .map_err(|err| DialogError::Storage(format!("stored public key: {err}")))?;
        let derived_address = self.storage.get(SMART_WALLET_ADDRESS_KEY)?;
        let updated_at = self
            .storage
            .get(UPDATED_AT_KEY)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Ok(Some(CredentialRecord {
            credential_id,
            public_key,
            derived_address,
            updated_at,
        }))
    }

    /// Persists `record`, replacing whatever was stored.
    ///
    /// The credential id is removed first and written last, so a save that fails
    /// halfway leaves no session rather than a mix of the old and new records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses a write.
    pub fn save(&self, record: &CredentialRecord) -> Result<(), DialogError> {
        self.storage.remove(CREDENTIAL_ID_KEY)?;
        let written = self
            .write_fields(record)
            .and_then(|()| self.storage.set(CREDENTIAL_ID_KEY, &record.credential_id));
        if let Err(err) = written {
            log::warn!("session write failed, discarding partial record: {err}");
            self.discard_fields();
            return Err(err);
        }
        Ok(())
    }

    fn write_fields(&self, record: &CredentialRecord) -> Result<(), DialogError> {
        self.storage
            .set(PUBLIC_KEY_KEY, &STANDARD.encode(&record.public_key))?;
        match &record.derived_address {
            Some(address) => self.storage.set(SMART_WALLET_ADDRESS_KEY, address)?,
            None => self.storage.remove(SMART_WALLET_ADDRESS_KEY)?,
        }
        self.storage
            .set(UPDATED_AT_KEY, &record.updated_at.to_string())
    }

    fn discard_fields(&self) {
        for key in [PUBLIC_KEY_KEY, SMART_WALLET_ADDRESS_KEY, UPDATED_AT_KEY] {
            if let Err(err) = self.storage.remove(key) {
                log::debug!("could not remove {key}: {err}");
            }
        }
    }

    /// Forgets the stored session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses a delete.
    pub fn clear(&self) -> Result<(), DialogError> {
        for key in [
            CREDENTIAL_ID_KEY,
            PUBLIC_KEY_KEY,
            SMART_WALLET_ADDRESS_KEY,
            UPDATED_AT_KEY,
        ] {
            self.storage.remove(key)?;
        }
        Ok(())
    }

    /// Reconciles a freshly connected credential with the stored one.
    ///
    /// A known credential id is reused as-is (only a previously unknown derived
    /// address is filled in). Any other id starts a new session and replaces the
    /// record wholesale.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn reconcile(
        &self,
        incoming: CredentialRecord,
    ) -> Result<(CredentialRecord, Reconciliation), DialogError> {
        if let Some(mut stored) = self.load()? {
            if stored.credential_id == incoming.credential_id {
                if stored.derived_address.is_none() && incoming.derived_address.is_some() {
                    stored.derived_address = incoming.derived_address;
                    stored.updated_at = incoming.updated_at;
                    self.save(&stored)?;
                }
                return Ok((stored, Reconciliation::Reused));
            }
            log::debug!(
                "credential changed from {} to {}, starting a new session",
                stored.credential_id,
                incoming.credential_id
            );
        }
        self.save(&incoming)?;
        Ok((incoming, Reconciliation::Created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    fn record(id: &str, address: Option<&str>, at: u64) -> CredentialRecord {
        CredentialRecord {
            credential_id: id.to_string(),
            public_key: vec![1, 2, 3],
            derived_address: address.map(ToString::to_string),
            updated_at: at,
        }
    }

    #[test]
    fn test_missing_keys_mean_no_session() {
        let store = SessionStore::new(MemoryStorage::new());
        assert_eq!(store.load().unwrap(), None);
        store.storage().set(CREDENTIAL_ID_KEY, "abc").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_load_clear() {
        let store = SessionStore::new(MemoryStorage::new());
        store.save(&record("abc", Some("Wa11et"), 10)).unwrap();
        assert_eq!(store.storage().get(PUBLIC_KEY_KEY).unwrap().as_deref(), Some("AQID"));
        assert_eq!(store.load().unwrap(), Some(record("abc", Some("Wa11et"), 10)));

        store.save(&record("abc", None, 11)).unwrap();
        assert_eq!(store.storage().get(SMART_WALLET_ADDRESS_KEY).unwrap(), None);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        assert!(store.storage().is_empty());
    }

    #[test]
    fn test_reconcile_reuses_known_credential() {
        let store = SessionStore::new(MemoryStorage::new());
        let (_, outcome) = store.reconcile(record("abc", None, 10)).unwrap();
        assert_eq!(outcome, Reconciliation::Created);

        let (kept, outcome) = store.reconcile(record("abc", Some("Wa11et"), 20)).unwrap();
        assert_eq!(outcome, Reconciliation::Reused);
        assert_eq!(kept.derived_address.as_deref(), Some("Wa11et"));

        // a known address is never overwritten by a reused session
        let (kept, _) = store.reconcile(record("abc", Some("0ther"), 30)).unwrap();
        assert_eq!(kept.derived_address.as_deref(), Some("Wa11et"));
        assert_eq!(kept.updated_at, 20);
    }

    #[test]
    fn test_reconcile_replaces_different_credential() {
        let store = SessionStore::new(MemoryStorage::new());
        store.save(&record("abc", Some("Wa11et"), 10)).unwrap();
        let (current, outcome) = store.reconcile(record("xyz", None, 20)).unwrap();
        assert_eq!(outcome, Reconciliation::Created);
        assert_eq!(store.load().unwrap(), Some(current));
        assert_eq!(store.storage().get(SMART_WALLET_ADDRESS_KEY).unwrap(), None);
    }

    #[test]
    fn test_failed_save_never_leaves_a_mixed_record() {
        let old = CredentialRecord {
            credential_id: "old".to_string(),
            public_key: vec![9, 9, 9],
            derived_address: Some("0x01d".to_string()),
            updated_at: 10,
        };
        // "new" needs three sets: public key, timestamp and finally the id
        for budget in 0..3 {
            let storage = MemoryStorage::new();
            let store = SessionStore::new(storage.clone());
            store.save(&old).unwrap();
            storage.refuse_writes_after(budget);

            let err = store.reconcile(record("new", None, 20)).unwrap_err();
            assert!(matches!(err, DialogError::Storage(_)), "budget {budget}");
            assert_eq!(store.load().unwrap(), None, "budget {budget}");
            assert!(storage.is_empty(), "budget {budget}");
        }

        let storage = MemoryStorage::new();
        let store = SessionStore::new(storage.clone());
        store.save(&old).unwrap();
        storage.refuse_writes_after(3);
        store.reconcile(record("new", None, 20)).unwrap();
        assert_eq!(store.load().unwrap(), Some(record("new", None, 20)));
    }

    #[test]
    fn test_refused_removal_keeps_the_old_record() {
        let storage = MemoryStorage::new();
        let store = SessionStore::new(storage.clone());
        store.save(&record("old", Some("0x01d"), 10)).unwrap();
        storage.refuse_writes();

        assert!(store.reconcile(record("new", None, 20)).is_err());
        assert_eq!(store.load().unwrap(), Some(record("old", Some("0x01d"), 10)));
    }

    #[test]
    fn test_undecodable_public_key_is_a_storage_error() {
        let store = SessionStore::new(MemoryStorage::new());
        store.storage().set(CREDENTIAL_ID_KEY, "abc").unwrap();
        store.storage().set(PUBLIC_KEY_KEY, "***").unwrap();
        assert!(matches!(store.load(), Err(DialogError::Storage(_))));
    }
}
