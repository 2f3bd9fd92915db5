// PreKeyStore: signed prekeys и one-time prekeys устройств
//
// Bundle отдаётся read-only; claim one-time prekey атомарен в хранилище
// (ровно один победитель на key id).

use crate::config::Config;
use crate::crypto::handshake::X3DHProtocol;
use crate::crypto::keys::KeyManager;
use crate::crypto::master_key::SealingKey;
use crate::crypto::{CryptoProvider, Suite};
use crate::protocol::{DeviceAddress, OneTimePreKeyPublic, PreKeyBundle, QuantumPreKeyPublic};
use crate::registry::identity::IdentityRegistry;
use crate::storage::models::{OneTimePreKeyRecord, SignedPreKeyRecord};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::logging::{security_event, SecurityEvent};
use crate::utils::time::Clock;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

fn signed_prekey_label(key_id: u32) -> String {
    format!("signed-prekey-{}", key_id)
}

fn one_time_prekey_label(key_id: u32) -> String {
    format!("one-time-prekey-{}", key_id)
}

/// Хранилище prekeys
#[derive(Clone)]
pub struct PreKeyStore<S: KeyStore> {
    store: S,
    identities: IdentityRegistry<S>,
    sealing: SealingKey,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<S: KeyStore> PreKeyStore<S> {
    pub fn new(
        store: S,
        identities: IdentityRegistry<S>,
        sealing: SealingKey,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            identities,
            sealing,
            clock,
            config,
        }
    }

    // ============================================
    // SIGNED PREKEYS
    // ============================================

    /// Опубликовать signed prekey
    ///
    /// Подпись проверяется verifying key текущей identity устройства.
    /// Предыдущий signed prekey деактивируется, но остаётся для in-flight handshakes.
    ///
    /// # Errors
    /// - `NotFound`: нет активной identity
    /// - `InvalidSignature`: подпись не проверяется
    pub fn publish_signed_prekey(
        &self,
        address: &DeviceAddress,
        key_id: u32,
        public_key: &[u8],
        private_key: &[u8],
        signature: &[u8],
    ) -> Result<SignedPreKeyRecord> {
        let identity = self.identities.get_identity(address)?;

        if let Err(err) =
            X3DHProtocol::<Suite>::verify_prekey_signature(&identity.signing_public_key, public_key, signature)
        {
            security_event(
                SecurityEvent::InvalidSignature,
                &address.to_string(),
                &format!("signed prekey {} rejected at publish", key_id),
            );
            return Err(err);
        }

        let derived = Suite::from_private_key_to_public_key(&private_key.to_vec())?;
        if derived.as_slice() != public_key {
            return Err(ConstructError::InvalidInput(format!(
                "Signed prekey {} does not match its private key",
                key_id
            )));
        }

        let now = self.clock.now();
        let record = SignedPreKeyRecord {
            address: address.clone(),
            key_id,
            public_key: public_key.to_vec(),
            sealed_private_key: self
                .sealing
                .seal(private_key, &address.context(&signed_prekey_label(key_id)))?,
            signature: signature.to_vec(),
            is_active: true,
            created_at: now,
            expires_at: now + Duration::seconds(self.config.signed_prekey_lifetime_secs),
        };

        self.store.activate_signed_prekey(record.clone())?;
        info!(
            target: "registry::prekeys",
            device = %address,
            key_id,
            expires_at = %record.expires_at,
            "Signed prekey published"
        );
        Ok(record)
    }

    /// Сгенерировать, подписать и опубликовать новый signed prekey
    pub fn rotate_signed_prekey(&self, address: &DeviceAddress) -> Result<SignedPreKeyRecord> {
        let signing_key = self.identities.signing_key(address)?;
        let key_id = self.store.next_signed_prekey_id(address)?;
        let signed = KeyManager::<Suite>::generate_signed_prekey(&signing_key, key_id)?;
        let private_key = Zeroizing::new(signed.pair.private_key);

        self.publish_signed_prekey(
            address,
            key_id,
            &signed.pair.public_key,
            &private_key,
            &signed.signature,
        )
    }

    pub fn active_signed_prekey(&self, address: &DeviceAddress) -> Result<Option<SignedPreKeyRecord>> {
        self.store.active_signed_prekey(address)
    }

    /// Приватный ключ signed prekey (включая деактивированные)
    pub fn signed_prekey_private(&self, address: &DeviceAddress, key_id: u32) -> Result<Zeroizing<Vec<u8>>> {
        let record = self
            .store
            .signed_prekey(address, key_id)?
            .ok_or_else(|| ConstructError::NotFound(format!("Signed prekey {} for {}", key_id, address)))?;
        self.sealing
            .open(&record.sealed_private_key, &address.context(&signed_prekey_label(key_id)))
    }

    // ============================================
    // ONE-TIME PREKEYS
    // ============================================

    /// Создать `count` неиспользованных ключей с последовательными id
    pub fn generate_one_time_prekeys(&self, address: &DeviceAddress, count: u32) -> Result<Vec<OneTimePreKeyPublic>> {
        self.identities.get_identity(address)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let first_id = self.store.next_one_time_prekey_id(address)?;
        let pairs = KeyManager::<Suite>::generate_one_time_prekeys(first_id, count)?;
        let now = self.clock.now();
        let expires_at = now + Duration::seconds(self.config.one_time_prekey_lifetime_secs);

        let mut published = Vec::with_capacity(pairs.len());
        let mut records = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let private_key = Zeroizing::new(pair.private_key);
            records.push(OneTimePreKeyRecord {
                address: address.clone(),
                key_id: pair.key_id,
                public_key: pair.public_key.clone(),
                sealed_private_key: Some(
                    self.sealing
                        .seal(&private_key, &address.context(&one_time_prekey_label(pair.key_id)))?,
                ),
                used_at: None,
                created_at: now,
                expires_at: Some(expires_at),
            });
            published.push(OneTimePreKeyPublic {
                key_id: pair.key_id,
                public_key: pair.public_key,
            });
        }

        self.store.insert_one_time_prekeys(records)?;
        debug!(
            target: "registry::prekeys",
            device = %address,
            first_id,
            count,
            "One-time prekeys generated"
        );
        Ok(published)
    }

    /// Атомарно пометить one-time prekey использованным
    ///
    /// - `key_id = Some(id)`: claim конкретного ключа, `AlreadyUsed` / `NotFound`
    /// - `key_id = None`: любой свободный ключ; `Ok(None)` если пул исчерпан
    pub fn consume_one_time_prekey(
        &self,
        address: &DeviceAddress,
        key_id: Option<u32>,
    ) -> Result<Option<OneTimePreKeyPublic>> {
        match self.store.claim_one_time_prekey(address, key_id, self.clock.now()) {
            Ok(claimed) => {
                if claimed.is_none() {
                    debug!(target: "registry::prekeys", device = %address, "One-time prekey pool exhausted");
                }
                Ok(claimed.map(|record| OneTimePreKeyPublic {
                    key_id: record.key_id,
                    public_key: record.public_key,
                }))
            }
            Err(err @ ConstructError::AlreadyUsed { .. }) => {
                security_event(SecurityEvent::OneTimePreKeyReuse, &address.to_string(), &err.to_string());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Забрать приватный ключ one-time prekey; повторный вызов даёт `AlreadyUsed`
    pub fn take_one_time_prekey_private(&self, address: &DeviceAddress, key_id: u32) -> Result<Zeroizing<Vec<u8>>> {
        let sealed = match self
            .store
            .take_one_time_prekey_private(address, key_id, self.clock.now())
        {
            Ok(sealed) => sealed,
            Err(err @ ConstructError::AlreadyUsed { .. }) => {
                security_event(SecurityEvent::OneTimePreKeyReuse, &address.to_string(), &err.to_string());
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.sealing
            .open(&sealed, &address.context(&one_time_prekey_label(key_id)))
    }

    pub fn available_one_time_prekeys(&self, address: &DeviceAddress) -> Result<usize> {
        self.store
            .count_available_one_time_prekeys(address, self.clock.now())
    }

    // ============================================
    // BUNDLE
    // ============================================

    /// Read-only bundle для инициатора handshake
    ///
    /// One-time prekey только предлагается: claim выполняет handshake.
    /// Истёкший signed prekey отдаётся как есть, отказ `StalePreKeyBundle`
    /// принимает инициатор.
    pub fn get_prekey_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle> {
        let identity = self.identities.get_identity(address)?;
        let signed_prekey = self
            .store
            .active_signed_prekey(address)?
            .ok_or_else(|| ConstructError::NotFound(format!("Signed prekey for {}", address)))?;
        let one_time_prekey = self
            .store
            .peek_one_time_prekey(address, self.clock.now())?
            .map(|record| OneTimePreKeyPublic {
                key_id: record.key_id,
                public_key: record.public_key,
            });

        Ok(PreKeyBundle {
            address: address.clone(),
            registration_id: identity.registration_id,
            identity_key: identity.public_key,
            signing_key: identity.signing_public_key,
            signed_prekey_id: signed_prekey.key_id,
            signed_prekey: signed_prekey.public_key,
            signed_prekey_signature: signed_prekey.signature,
            signed_prekey_expires_at: signed_prekey.expires_at,
            one_time_prekey,
            quantum: identity.quantum.map(|quantum| QuantumPreKeyPublic {
                algorithm: quantum.algorithm,
                version: quantum.version,
                public_key: quantum.public_key,
                signature: quantum.signature,
            }),
            suite_id: Suite::suite_id(),
        })
    }

    /// Удалить prekeys, истёкшие или использованные раньше grace period
    ///
    /// Возвращает (signed, one-time) количество удалённых записей.
    pub fn purge_expired(&self, address: &DeviceAddress) -> Result<(usize, usize)> {
        let before = self.clock.now() - Duration::seconds(self.config.prekey_cleanup_period_secs);
        let signed = self.store.purge_signed_prekeys(address, before)?;
        let one_time = self.store.purge_one_time_prekeys(address, before)?;
        if signed + one_time > 0 {
            debug!(
                target: "registry::prekeys",
                device = %address,
                signed,
                one_time,
                "Purged stale prekeys"
            );
        }
        Ok((signed, one_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::utils::time::ManualClock;
    use chrono::Utc;

    struct Fixture {
        prekeys: PreKeyStore<MemoryStorage>,
        clock: ManualClock,
        bob: DeviceAddress,
    }

    fn fixture() -> Fixture {
        let store = MemoryStorage::new();
        let sealing = SealingKey::generate().unwrap();
        let clock = ManualClock::new(Utc::now());
        let config = Arc::new(Config::default());
        let identities = IdentityRegistry::new(store.clone(), sealing.clone(), Arc::new(clock.clone()), config.clone());
        let prekeys = PreKeyStore::new(store, identities.clone(), sealing, Arc::new(clock.clone()), config);

        let bob = DeviceAddress::new("bob", "laptop");
        identities.create_identity(&bob, false).unwrap();
        Fixture { prekeys, clock, bob }
    }

    #[test]
    fn test_publish_signed_prekey_deactivates_previous() {
        let f = fixture();
        let first = f.prekeys.rotate_signed_prekey(&f.bob).unwrap();
        let second = f.prekeys.rotate_signed_prekey(&f.bob).unwrap();
        assert!(second.key_id > first.key_id);

        let active = f.prekeys.active_signed_prekey(&f.bob).unwrap().unwrap();
        assert_eq!(active.key_id, second.key_id);
        // Предыдущий остаётся доступен для in-flight handshakes
        assert!(f.prekeys.signed_prekey_private(&f.bob, first.key_id).is_ok());
    }

    #[test]
    fn test_publish_rejects_foreign_signature() {
        let f = fixture();
        let stranger = KeyManager::<Suite>::generate_identity(None).unwrap();
        let forged = KeyManager::<Suite>::generate_signed_prekey(&stranger.signing.0, 1).unwrap();

        let result = f.prekeys.publish_signed_prekey(
            &f.bob,
            1,
            &forged.pair.public_key,
            &forged.pair.private_key,
            &forged.signature,
        );
        assert!(matches!(result, Err(ConstructError::InvalidSignature(_))));
        assert!(f.prekeys.active_signed_prekey(&f.bob).unwrap().is_none());
    }

    #[test]
    fn test_one_time_prekeys_sequential_across_batches() {
        let f = fixture();
        let first = f.prekeys.generate_one_time_prekeys(&f.bob, 3).unwrap();
        let second = f.prekeys.generate_one_time_prekeys(&f.bob, 2).unwrap();

        let ids: Vec<u32> = first.iter().chain(second.iter()).map(|k| k.key_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(f.prekeys.available_one_time_prekeys(&f.bob).unwrap(), 5);
    }

    #[test]
    fn test_consume_specific_key_once() {
        let f = fixture();
        f.prekeys.generate_one_time_prekeys(&f.bob, 2).unwrap();

        let claimed = f.prekeys.consume_one_time_prekey(&f.bob, Some(1)).unwrap().unwrap();
        assert_eq!(claimed.key_id, 1);

        let again = f.prekeys.consume_one_time_prekey(&f.bob, Some(1));
        assert!(matches!(again, Err(ConstructError::AlreadyUsed { key_id: 1, .. })));

        let missing = f.prekeys.consume_one_time_prekey(&f.bob, Some(99));
        assert!(matches!(missing, Err(ConstructError::NotFound(_))));
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let f = fixture();
        f.prekeys.generate_one_time_prekeys(&f.bob, 1).unwrap();

        assert!(f.prekeys.consume_one_time_prekey(&f.bob, None).unwrap().is_some());
        assert!(f.prekeys.consume_one_time_prekey(&f.bob, None).unwrap().is_none());
    }

    #[test]
    fn test_bundle_is_read_only() {
        let f = fixture();
        f.prekeys.rotate_signed_prekey(&f.bob).unwrap();
        f.prekeys.generate_one_time_prekeys(&f.bob, 1).unwrap();

        let first = f.prekeys.get_prekey_bundle(&f.bob).unwrap();
        let second = f.prekeys.get_prekey_bundle(&f.bob).unwrap();
        assert_eq!(first.one_time_prekey, second.one_time_prekey);
        assert_eq!(f.prekeys.available_one_time_prekeys(&f.bob).unwrap(), 1);

        X3DHProtocol::<Suite>::verify_prekey_signature(
            &first.signing_key,
            &first.signed_prekey,
            &first.signed_prekey_signature,
        )
        .unwrap();
    }

    #[test]
    fn test_bundle_without_signed_prekey_not_found() {
        let f = fixture();
        let result = f.prekeys.get_prekey_bundle(&f.bob);
        assert!(matches!(result, Err(ConstructError::NotFound(_))));
    }

    #[test]
    fn test_purge_after_grace_period() {
        let f = fixture();
        f.prekeys.rotate_signed_prekey(&f.bob).unwrap();
        f.prekeys.rotate_signed_prekey(&f.bob).unwrap();
        f.prekeys.generate_one_time_prekeys(&f.bob, 2).unwrap();
        f.prekeys.consume_one_time_prekey(&f.bob, Some(1)).unwrap();

        assert_eq!(f.prekeys.purge_expired(&f.bob).unwrap(), (0, 0));

        // signed lifetime 30d + grace 30d
        f.clock.advance(Duration::days(61));
        let (signed, one_time) = f.prekeys.purge_expired(&f.bob).unwrap();
        assert_eq!(signed, 1);
        assert_eq!(one_time, 1);
        assert!(f.prekeys.active_signed_prekey(&f.bob).unwrap().is_some());
    }
}
