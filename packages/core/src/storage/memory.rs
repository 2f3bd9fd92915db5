// In-memory storage для тестов и однопроцессных развёртываний
//
// Всё состояние под одним Arc<Mutex<>>: каждый метод KeyStore выполняется
// целиком под блокировкой, что даёт атомарные compare-and-set операции.

use crate::protocol::{DeviceAddress, SessionKey};
use crate::storage::models::*;
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// In-memory хранилище
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    identities: HashMap<DeviceAddress, Vec<IdentityKeyRecord>>,
    signed_prekeys: HashMap<DeviceAddress, BTreeMap<u32, SignedPreKeyRecord>>,
    one_time_prekeys: HashMap<DeviceAddress, BTreeMap<u32, OneTimePreKeyRecord>>,
    /// Максимальные выданные id (переживают purge)
    signed_prekey_high_water: HashMap<DeviceAddress, u32>,
    one_time_prekey_high_water: HashMap<DeviceAddress, u32>,
    encapsulations: HashMap<(Uuid, DeviceAddress), QuantumEncapsulationRecord>,
    sessions: HashMap<SessionKey, Vec<SessionRecord>>,
    conversations: HashMap<Uuid, ConversationRecord>,
    bundles: BTreeMap<(Uuid, DeviceAddress, u32), ConversationKeyBundleRecord>,
    chat_keys: HashMap<(Uuid, DeviceAddress), ChatEncryptionKeyRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStorageInner>> {
        self.inner
            .lock()
            .map_err(|_| ConstructError::StorageError("Storage mutex poisoned".to_string()))
    }

    /// Количество сессий (включая неактивные)
    pub fn session_count(&self) -> Result<usize> {
        Ok(self.lock()?.sessions.values().map(Vec::len).sum())
    }

    /// Количество one-time prekeys устройства (включая использованные)
    pub fn one_time_prekey_count(&self, address: &DeviceAddress) -> Result<usize> {
        Ok(self
            .lock()?
            .one_time_prekeys
            .get(address)
            .map_or(0, BTreeMap::len))
    }
}

fn already_used(address: &DeviceAddress, key_id: u32) -> ConstructError {
    ConstructError::AlreadyUsed {
        device: address.to_string(),
        key_id,
    }
}

impl KeyStore for MemoryStorage {
    // === Identity ===

    fn activate_identity(&self, mut record: IdentityKeyRecord, replace: bool) -> Result<IdentityKeyRecord> {
        let mut inner = self.lock()?;
        let history = inner.identities.entry(record.address.clone()).or_default();

        if let Some(active) = history.iter_mut().find(|r| r.is_active) {
            if !replace {
                return Err(ConstructError::DuplicateIdentity(record.address.to_string()));
            }
            active.is_active = false;
            active.deactivated_at = Some(record.created_at);
            active.revocation_reason = Some("rotated".to_string());
        }

        record.registration_id = history.iter().map(|r| r.registration_id).max().unwrap_or(0) + 1;
        record.is_active = true;
        history.push(record.clone());
        Ok(record)
    }

    fn active_identity(&self, address: &DeviceAddress) -> Result<Option<IdentityKeyRecord>> {
        Ok(self
            .lock()?
            .identities
            .get(address)
            .and_then(|history| history.iter().find(|r| r.is_active).cloned()))
    }

    fn identity_history(&self, address: &DeviceAddress) -> Result<Vec<IdentityKeyRecord>> {
        Ok(self.lock()?.identities.get(address).cloned().unwrap_or_default())
    }

    fn deactivate_identity(&self, address: &DeviceAddress, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let active = inner
            .identities
            .get_mut(address)
            .and_then(|history| history.iter_mut().find(|r| r.is_active));

        match active {
            Some(record) => {
                record.is_active = false;
                record.deactivated_at = Some(at);
                record.revocation_reason = Some(reason.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn active_devices(&self) -> Result<Vec<DeviceAddress>> {
        let inner = self.lock()?;
        let mut devices: Vec<DeviceAddress> = inner
            .identities
            .iter()
            .filter(|(_, history)| history.iter().any(|r| r.is_active))
            .map(|(address, _)| address.clone())
            .collect();
        devices.sort();
        Ok(devices)
    }

    // === Signed prekeys ===

    fn next_signed_prekey_id(&self, address: &DeviceAddress) -> Result<u32> {
        let inner = self.lock()?;
        let stored = inner
            .signed_prekeys
            .get(address)
            .and_then(|keys| keys.keys().next_back().copied())
            .unwrap_or(0);
        let high_water = inner.signed_prekey_high_water.get(address).copied().unwrap_or(0);
        Ok(stored.max(high_water) + 1)
    }

    fn activate_signed_prekey(&self, mut record: SignedPreKeyRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let address = record.address.clone();
        let keys = inner.signed_prekeys.entry(address.clone()).or_default();
        if keys.contains_key(&record.key_id) {
            return Err(ConstructError::StorageError(format!(
                "Signed prekey {} already exists for {}",
                record.key_id, address
            )));
        }

        for key in keys.values_mut() {
            key.is_active = false;
        }
        record.is_active = true;
        let key_id = record.key_id;
        keys.insert(key_id, record);

        let high_water = inner.signed_prekey_high_water.entry(address).or_insert(0);
        *high_water = (*high_water).max(key_id);
        Ok(())
    }

    fn active_signed_prekey(&self, address: &DeviceAddress) -> Result<Option<SignedPreKeyRecord>> {
        Ok(self
            .lock()?
            .signed_prekeys
            .get(address)
            .and_then(|keys| keys.values().find(|k| k.is_active).cloned()))
    }

    fn signed_prekey(&self, address: &DeviceAddress, key_id: u32) -> Result<Option<SignedPreKeyRecord>> {
        Ok(self
            .lock()?
            .signed_prekeys
            .get(address)
            .and_then(|keys| keys.get(&key_id).cloned()))
    }

    fn deactivate_signed_prekeys(&self, address: &DeviceAddress) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        if let Some(keys) = inner.signed_prekeys.get_mut(address) {
            for key in keys.values_mut().filter(|k| k.is_active) {
                key.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    fn purge_signed_prekeys(&self, address: &DeviceAddress, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(keys) = inner.signed_prekeys.get_mut(address) else {
            return Ok(0);
        };
        let initial = keys.len();
        keys.retain(|_, key| key.is_active || key.expires_at >= before);
        Ok(initial - keys.len())
    }

    // === One-time prekeys ===

    fn next_one_time_prekey_id(&self, address: &DeviceAddress) -> Result<u32> {
        let inner = self.lock()?;
        let stored = inner
            .one_time_prekeys
            .get(address)
            .and_then(|keys| keys.keys().next_back().copied())
            .unwrap_or(0);
        let high_water = inner.one_time_prekey_high_water.get(address).copied().unwrap_or(0);
        Ok(stored.max(high_water) + 1)
    }

    fn insert_one_time_prekeys(&self, records: Vec<OneTimePreKeyRecord>) -> Result<()> {
        let mut inner = self.lock()?;

        // Проверяем все id до вставки, чтобы батч был атомарным
        for record in &records {
            let exists = inner
                .one_time_prekeys
                .get(&record.address)
                .map_or(false, |keys| keys.contains_key(&record.key_id));
            if exists {
                return Err(ConstructError::StorageError(format!(
                    "One-time prekey {} already exists for {}",
                    record.key_id, record.address
                )));
            }
        }

        for record in records {
            let high_water = inner
                .one_time_prekey_high_water
                .entry(record.address.clone())
                .or_insert(0);
            *high_water = (*high_water).max(record.key_id);
            inner
                .one_time_prekeys
                .entry(record.address.clone())
                .or_default()
                .insert(record.key_id, record);
        }
        Ok(())
    }

    fn peek_one_time_prekey(&self, address: &DeviceAddress, now: DateTime<Utc>) -> Result<Option<OneTimePreKeyRecord>> {
        Ok(self
            .lock()?
            .one_time_prekeys
            .get(address)
            .and_then(|keys| keys.values().find(|k| k.is_available(now)).cloned()))
    }

    fn claim_one_time_prekey(
        &self,
        address: &DeviceAddress,
        key_id: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Option<OneTimePreKeyRecord>> {
        let mut inner = self.lock()?;
        let keys = inner.one_time_prekeys.get_mut(address);

        match key_id {
            Some(key_id) => {
                let record = keys
                    .and_then(|keys| keys.get_mut(&key_id))
                    .ok_or_else(|| ConstructError::NotFound(format!("One-time prekey {} for {}", key_id, address)))?;
                if record.used_at.is_some() {
                    return Err(already_used(address, key_id));
                }
                if record.is_expired(now) {
                    return Err(ConstructError::NotFound(format!(
                        "One-time prekey {} for {} expired",
                        key_id, address
                    )));
                }
                record.used_at = Some(now);
                Ok(Some(record.clone()))
            }
            None => {
                let record = keys.and_then(|keys| keys.values_mut().find(|k| k.is_available(now)));
                Ok(record.map(|record| {
                    record.used_at = Some(now);
                    record.clone()
                }))
            }
        }
    }

    fn take_one_time_prekey_private(&self, address: &DeviceAddress, key_id: u32, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut inner = self.lock()?;
        let record = inner
            .one_time_prekeys
            .get_mut(address)
            .and_then(|keys| keys.get_mut(&key_id))
            .ok_or_else(|| ConstructError::NotFound(format!("One-time prekey {} for {}", key_id, address)))?;

        let sealed = record
            .sealed_private_key
            .take()
            .ok_or_else(|| already_used(address, key_id))?;
        record.used_at.get_or_insert(now);
        Ok(sealed)
    }

    fn count_available_one_time_prekeys(&self, address: &DeviceAddress, now: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .lock()?
            .one_time_prekeys
            .get(address)
            .map_or(0, |keys| keys.values().filter(|k| k.is_available(now)).count()))
    }

    fn invalidate_one_time_prekeys(&self, address: &DeviceAddress, at: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        if let Some(keys) = inner.one_time_prekeys.get_mut(address) {
            for key in keys.values_mut() {
                if key.used_at.is_none() || key.sealed_private_key.is_some() {
                    count += 1;
                }
                key.used_at.get_or_insert(at);
                key.sealed_private_key = None;
            }
        }
        Ok(count)
    }

    fn purge_one_time_prekeys(&self, address: &DeviceAddress, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(keys) = inner.one_time_prekeys.get_mut(address) else {
            return Ok(0);
        };
        let initial = keys.len();
        keys.retain(|_, key| {
            let used_long_ago = key.used_at.map_or(false, |used_at| used_at < before);
            let expired_long_ago = key.expires_at.map_or(false, |expires_at| expires_at < before);
            !(used_long_ago || expired_long_ago)
        });
        Ok(initial - keys.len())
    }

    // === Quantum encapsulation ===

    fn store_encapsulation(&self, record: QuantumEncapsulationRecord) -> Result<()> {
        self.lock()?
            .encapsulations
            .insert((record.session_id, record.owner.clone()), record);
        Ok(())
    }

    fn encapsulation(&self, session_id: Uuid, owner: &DeviceAddress) -> Result<Option<QuantumEncapsulationRecord>> {
        Ok(self
            .lock()?
            .encapsulations
            .get(&(session_id, owner.clone()))
            .cloned())
    }

    fn deactivate_encapsulations(&self, session_id: Uuid) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for record in inner
            .encapsulations
            .values_mut()
            .filter(|r| r.session_id == session_id && r.is_active)
        {
            record.is_active = false;
            count += 1;
        }
        Ok(count)
    }

    // === Sessions ===

    fn insert_session(&self, record: SessionRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let sessions = inner.sessions.entry(record.key.clone()).or_default();
        if sessions.iter().any(|s| s.session_id == record.session_id) {
            return Err(ConstructError::StorageError(format!(
                "Session {} already exists for {}",
                record.session_id, record.key
            )));
        }
        for session in sessions.iter_mut() {
            session.is_active = false;
        }
        sessions.push(record);
        Ok(())
    }

    fn active_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .get(key)
            .and_then(|sessions| sessions.iter().find(|s| s.is_active).cloned()))
    }

    fn session(&self, key: &SessionKey, session_id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .get(key)
            .and_then(|sessions| sessions.iter().find(|s| s.session_id == session_id).cloned()))
    }

    fn sessions_for(&self, key: &SessionKey) -> Result<Vec<SessionRecord>> {
        Ok(self.lock()?.sessions.get(key).cloned().unwrap_or_default())
    }

    fn update_session(&self, mut record: SessionRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let slot = inner
            .sessions
            .get_mut(&record.key)
            .and_then(|sessions| sessions.iter_mut().find(|s| s.session_id == record.session_id))
            .ok_or_else(|| ConstructError::NotFound(format!("Session {} for {}", record.session_id, record.key)))?;

        if slot.is_revoked() && !record.is_revoked() {
            record.state = SessionState::Revoked;
            record.is_active = false;
            record.pending_handshake = None;
            record.revoked_at = slot.revoked_at;
            record.revocation_reason = slot.revocation_reason.clone();
        }
        *slot = record;
        Ok(())
    }

    fn sessions_involving(&self, address: &DeviceAddress) -> Result<Vec<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .iter()
            .filter(|(key, _)| key.involves(address))
            .flat_map(|(_, sessions)| sessions.iter().cloned())
            .collect())
    }

    fn all_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .flat_map(|sessions| sessions.iter().cloned())
            .collect())
    }

    // === Conversations ===

    fn upsert_conversation(&self, record: ConversationRecord) -> Result<()> {
        self.lock()?.conversations.insert(record.id, record);
        Ok(())
    }

    fn conversation(&self, id: Uuid) -> Result<Option<ConversationRecord>> {
        Ok(self.lock()?.conversations.get(&id).cloned())
    }

    fn conversations_involving(&self, address: &DeviceAddress) -> Result<Vec<ConversationRecord>> {
        Ok(self
            .lock()?
            .conversations
            .values()
            .filter(|c| c.owner == *address || c.participants.contains(address))
            .cloned()
            .collect())
    }

    fn put_bundle(&self, record: ConversationKeyBundleRecord) -> Result<()> {
        let index = (record.conversation_id, record.recipient.clone(), record.version);
        self.lock()?.bundles.insert(index, record);
        Ok(())
    }

    fn bundle(&self, conversation_id: Uuid, recipient: &DeviceAddress, version: u32) -> Result<Option<ConversationKeyBundleRecord>> {
        Ok(self
            .lock()?
            .bundles
            .get(&(conversation_id, recipient.clone(), version))
            .cloned())
    }

    fn bundles_for(&self, conversation_id: Uuid, recipient: &DeviceAddress) -> Result<Vec<ConversationKeyBundleRecord>> {
        Ok(self
            .lock()?
            .bundles
            .range((conversation_id, recipient.clone(), 0)..=(conversation_id, recipient.clone(), u32::MAX))
            .map(|(_, bundle)| bundle.clone())
            .collect())
    }

    fn deactivate_bundles_before(&self, conversation_id: Uuid, version: u32) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for bundle in inner
            .bundles
            .values_mut()
            .filter(|b| b.conversation_id == conversation_id && b.version < version && b.is_active)
        {
            bundle.is_active = false;
            count += 1;
        }
        Ok(count)
    }

    fn deactivate_bundles_for_device(&self, recipient: &DeviceAddress) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for bundle in inner
            .bundles
            .values_mut()
            .filter(|b| b.recipient == *recipient && b.is_active)
        {
            bundle.is_active = false;
            count += 1;
        }
        Ok(count)
    }

    fn upsert_chat_key(&self, record: ChatEncryptionKeyRecord) -> Result<()> {
        let index = (record.conversation_id, record.address.clone());
        self.lock()?.chat_keys.insert(index, record);
        Ok(())
    }

    fn chat_key(&self, conversation_id: Uuid, address: &DeviceAddress) -> Result<Option<ChatEncryptionKeyRecord>> {
        Ok(self
            .lock()?
            .chat_keys
            .get(&(conversation_id, address.clone()))
            .cloned())
    }

    fn revoke_chat_keys(&self, address: &DeviceAddress, reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for key in inner
            .chat_keys
            .values_mut()
            .filter(|k| k.address == *address && k.revoked_at.is_none())
        {
            key.is_active = false;
            key.revoked_at = Some(at);
            key.revocation_reason = Some(reason.to_string());
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn address() -> DeviceAddress {
        DeviceAddress::new("bob", "laptop")
    }

    fn identity(now: DateTime<Utc>) -> IdentityKeyRecord {
        IdentityKeyRecord {
            address: address(),
            registration_id: 0,
            public_key: vec![1u8; 32],
            signing_public_key: vec![2u8; 32],
            sealed_private_key: vec![3u8; 60],
            sealed_signing_key: vec![4u8; 60],
            fingerprint: "ab".to_string(),
            quantum: None,
            is_active: false,
            created_at: now,
            deactivated_at: None,
            revocation_reason: None,
        }
    }

    fn one_time(key_id: u32, now: DateTime<Utc>) -> OneTimePreKeyRecord {
        OneTimePreKeyRecord {
            address: address(),
            key_id,
            public_key: vec![key_id as u8; 32],
            sealed_private_key: Some(vec![9u8; 60]),
            used_at: None,
            created_at: now,
            expires_at: Some(now + Duration::days(90)),
        }
    }

    #[test]
    fn test_identity_duplicate_and_replace() {
        let storage = MemoryStorage::new();
        let now = Utc::now();

        let first = storage.activate_identity(identity(now), false).unwrap();
        assert_eq!(first.registration_id, 1);

        let err = storage.activate_identity(identity(now), false).unwrap_err();
        assert!(matches!(err, ConstructError::DuplicateIdentity(_)));

        let second = storage.activate_identity(identity(now), true).unwrap();
        assert_eq!(second.registration_id, 2);

        let history = storage.identity_history(&address()).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_active);
        assert!(history[1].is_active);
    }

    #[test]
    fn test_claim_one_time_prekey_once() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert_one_time_prekeys(vec![one_time(1, now), one_time(2, now)]).unwrap();

        assert!(storage.claim_one_time_prekey(&address(), Some(1), now).unwrap().is_some());
        let err = storage.claim_one_time_prekey(&address(), Some(1), now).unwrap_err();
        assert!(matches!(err, ConstructError::AlreadyUsed { key_id: 1, .. }));

        let err = storage.claim_one_time_prekey(&address(), Some(42), now).unwrap_err();
        assert!(matches!(err, ConstructError::NotFound(_)));

        // Любой свободный, затем пул пуст
        let any = storage.claim_one_time_prekey(&address(), None, now).unwrap().unwrap();
        assert_eq!(any.key_id, 2);
        assert!(storage.claim_one_time_prekey(&address(), None, now).unwrap().is_none());
    }

    #[test]
    fn test_take_private_erases() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert_one_time_prekeys(vec![one_time(1, now)]).unwrap();

        assert!(storage.take_one_time_prekey_private(&address(), 1, now).is_ok());
        let err = storage.take_one_time_prekey_private(&address(), 1, now).unwrap_err();
        assert!(matches!(err, ConstructError::AlreadyUsed { .. }));
    }

    #[test]
    fn test_ids_not_reused_after_purge() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert_one_time_prekeys(vec![one_time(1, now), one_time(2, now)]).unwrap();
        storage.claim_one_time_prekey(&address(), Some(2), now).unwrap();

        let purged = storage
            .purge_one_time_prekeys(&address(), now + Duration::seconds(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(storage.next_one_time_prekey_id(&address()).unwrap(), 3);
    }

    #[test]
    fn test_duplicate_batch_is_rejected_atomically() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert_one_time_prekeys(vec![one_time(2, now)]).unwrap();

        assert!(storage.insert_one_time_prekeys(vec![one_time(1, now), one_time(2, now)]).is_err());
        assert_eq!(storage.one_time_prekey_count(&address()).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_claim_has_single_winner() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.insert_one_time_prekeys(vec![one_time(1, now)]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = storage.clone();
                std::thread::spawn(move || storage.claim_one_time_prekey(&address(), Some(1), now))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| matches!(r, Ok(Some(_)))).count();
        let already_used = results
            .iter()
            .filter(|r| matches!(r, Err(ConstructError::AlreadyUsed { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(already_used, 7);
    }

    fn session(now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: Uuid::new_v4(),
            key: SessionKey::new(DeviceAddress::new("alice", "phone"), address()),
            role: SessionRole::Initiator,
            state: SessionState::Established,
            sealed_state: vec![0u8; 16],
            remote_identity_key: vec![1u8; 32],
            remote_fingerprint: "ab".to_string(),
            remote_registration_id: 1,
            message_counter: 0,
            is_active: true,
            pending_handshake: None,
            reduced_security: false,
            hybrid: false,
            created_at: now,
            last_used_at: now,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[test]
    fn test_new_session_supersedes_previous() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let first = session(now);
        let second = session(now);
        storage.insert_session(first.clone()).unwrap();
        storage.insert_session(second.clone()).unwrap();

        let active = storage.active_session(&first.key).unwrap().unwrap();
        assert_eq!(active.session_id, second.session_id);

        // Старая сессия остаётся доступной по id
        let old = storage.session(&first.key, first.session_id).unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(storage.sessions_for(&first.key).unwrap().len(), 2);
    }

    #[test]
    fn test_revoked_session_stays_revoked() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let record = session(now);
        storage.insert_session(record.clone()).unwrap();

        let mut revoked = record.clone();
        assert!(revoked.revoke("compromised", now));
        storage.update_session(revoked).unwrap();

        // Конкурентный writer со старой копией записи
        let mut stale = record.clone();
        stale.state = SessionState::Active;
        stale.message_counter = 5;
        storage.update_session(stale).unwrap();

        let stored = storage.session(&record.key, record.session_id).unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Revoked);
        assert_eq!(stored.message_counter, 5);
        assert_eq!(stored.revocation_reason.as_deref(), Some("compromised"));
    }
}
