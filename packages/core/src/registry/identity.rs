// IdentityRegistry: долговременные ключи устройств (trust root)

use crate::config::Config;
use crate::crypto::keys::{identity_fingerprint, DeviceIdentityKeys, KeyManager};
use crate::crypto::master_key::SealingKey;
use crate::crypto::quantum::{QuantumAlgorithm, QuantumEncapsulator, QuantumKeyPair};
use crate::crypto::{CryptoProvider, Suite};
use crate::protocol::DeviceAddress;
use crate::storage::models::{IdentityKeyRecord, QuantumIdentityKey};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::logging::{security_event, SecurityEvent};
use crate::utils::time::Clock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const IDENTITY_LABEL: &str = "identity";
const SIGNING_LABEL: &str = "identity-signing";
const QUANTUM_LABEL: &str = "identity-quantum";

/// Версия формата квантового материала identity
const QUANTUM_KEY_VERSION: u32 = 1;

/// Результат ротации identity
#[derive(Debug, Clone)]
pub struct IdentityRotation {
    pub previous: IdentityKeyRecord,
    pub current: IdentityKeyRecord,
    /// Сессии, закреплённые за старым ключом и отозванные
    pub revoked_sessions: usize,
}

/// Реестр identity ключей
///
/// Приватные части хранятся только sealed; [`IdentityRegistry::unlock`]
/// расшифровывает их для handshake.
#[derive(Clone)]
pub struct IdentityRegistry<S: KeyStore> {
    store: S,
    sealing: SealingKey,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<S: KeyStore> IdentityRegistry<S> {
    pub fn new(store: S, sealing: SealingKey, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            store,
            sealing,
            clock,
            config,
        }
    }

    /// Сгенерировать и зарегистрировать identity
    ///
    /// При `quantum == true` и поддержке `default_quantum_algorithm` добавляется
    /// ML-KEM пара; без поддержки identity остаётся классической.
    pub fn create_identity(&self, address: &DeviceAddress, quantum: bool) -> Result<IdentityKeyRecord> {
        let keys = self.generate_keys(address, quantum)?;
        self.register_identity(address, &keys, false)
    }

    /// Зарегистрировать сгенерированные ключи
    ///
    /// # Errors
    /// `DuplicateIdentity` если у устройства уже есть активная identity и
    /// `replace == false`
    pub fn register_identity(
        &self,
        address: &DeviceAddress,
        keys: &DeviceIdentityKeys<Suite>,
        replace: bool,
    ) -> Result<IdentityKeyRecord> {
        let now = self.clock.now();

        let quantum = match &keys.quantum {
            Some((pair, signature)) => Some(QuantumIdentityKey {
                algorithm: pair.algorithm,
                version: QUANTUM_KEY_VERSION,
                public_key: pair.public_key.clone(),
                signature: signature.clone(),
                sealed_private_key: self
                    .sealing
                    .seal(&pair.private_key, &address.context(QUANTUM_LABEL))?,
            }),
            None => None,
        };

        let record = IdentityKeyRecord {
            address: address.clone(),
            registration_id: 0,
            public_key: keys.dh.1.clone(),
            signing_public_key: keys.signing.1.clone(),
            sealed_private_key: self.sealing.seal(&keys.dh.0, &address.context(IDENTITY_LABEL))?,
            sealed_signing_key: self.sealing.seal(&keys.signing.0, &address.context(SIGNING_LABEL))?,
            fingerprint: keys.fingerprint(),
            quantum,
            is_active: true,
            created_at: now,
            deactivated_at: None,
            revocation_reason: None,
        };

        let record = self.store.activate_identity(record, replace)?;
        info!(
            target: "registry::identity",
            device = %address,
            registration_id = record.registration_id,
            fingerprint = %record.fingerprint,
            quantum = record.quantum_capable(),
            "Identity registered"
        );
        Ok(record)
    }

    /// Активная identity устройства
    ///
    /// # Errors
    /// `NotFound` если устройство не зарегистрировано или отозвано
    pub fn get_identity(&self, address: &DeviceAddress) -> Result<IdentityKeyRecord> {
        self.store
            .active_identity(address)?
            .ok_or_else(|| ConstructError::NotFound(format!("Identity for {}", address)))
    }

    /// Заменить identity новой парой
    ///
    /// Старая запись деактивируется, сессии, закреплённые за старым ключом,
    /// отзываются, signed prekeys деактивируются (их подпись больше не проверяется).
    /// Вызывающий должен опубликовать свежие prekeys.
    pub fn rotate_identity(&self, address: &DeviceAddress, quantum: bool) -> Result<IdentityRotation> {
        let previous = self.get_identity(address)?;
        let keys = self.generate_keys(address, quantum)?;
        let current = self.register_identity(address, &keys, true)?;
        let now = self.clock.now();

        let mut revoked_sessions = 0;
        for mut session in self.store.sessions_involving(address)? {
            let pinned = session.key.local == *address
                || (session.key.remote == *address && session.remote_identity_key == previous.public_key);
            if pinned && session.revoke("identity rotated", now) {
                self.store.deactivate_encapsulations(session.session_id)?;
                self.store.update_session(session)?;
                revoked_sessions += 1;
            }
        }

        let deactivated = self.store.deactivate_signed_prekeys(address)?;
        self.store.invalidate_one_time_prekeys(address, now)?;

        security_event(
            SecurityEvent::IdentityRotated,
            &address.to_string(),
            &format!(
                "registration {} -> {}, fingerprint {} -> {}, {} sessions revoked",
                previous.registration_id,
                current.registration_id,
                previous.fingerprint,
                current.fingerprint,
                revoked_sessions
            ),
        );
        debug!(
            target: "registry::identity",
            device = %address,
            signed_prekeys_deactivated = deactivated,
            "Prekeys of previous identity retired"
        );

        Ok(IdentityRotation {
            previous,
            current,
            revoked_sessions,
        })
    }

    /// Расшифровать приватные ключи активной identity
    pub fn unlock(&self, address: &DeviceAddress) -> Result<(IdentityKeyRecord, DeviceIdentityKeys<Suite>)> {
        let record = self.get_identity(address)?;

        let dh_private = self
            .sealing
            .open(&record.sealed_private_key, &address.context(IDENTITY_LABEL))?;
        let signing_private = self
            .sealing
            .open(&record.sealed_signing_key, &address.context(SIGNING_LABEL))?;
        let (dh_private, signing_private) =
            KeyManager::<Suite>::identity_from_private(dh_private.to_vec(), signing_private.to_vec())?;

        let fingerprint = identity_fingerprint(&record.public_key, &record.signing_public_key);
        if fingerprint != record.fingerprint {
            return Err(ConstructError::StorageError(format!(
                "Identity fingerprint mismatch for {}",
                address
            )));
        }

        let quantum = match &record.quantum {
            Some(quantum) => {
                let private_key = self
                    .sealing
                    .open(&quantum.sealed_private_key, &address.context(QUANTUM_LABEL))?;
                Some((
                    QuantumKeyPair {
                        algorithm: quantum.algorithm,
                        public_key: quantum.public_key.clone(),
                        private_key,
                    },
                    quantum.signature.clone(),
                ))
            }
            None => None,
        };

        Ok((
            record.clone(),
            DeviceIdentityKeys {
                dh: (dh_private, record.public_key.clone()),
                signing: (signing_private, record.signing_public_key.clone()),
                quantum,
            },
        ))
    }

    /// Только signing private key (для подписи prekeys)
    pub(crate) fn signing_key(&self, address: &DeviceAddress) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.get_identity(address)?;
        let signing_private = self
            .sealing
            .open(&record.sealed_signing_key, &address.context(SIGNING_LABEL))?;
        Suite::from_signature_private_to_public(&signing_private)?;
        Ok(signing_private)
    }

    fn generate_keys(&self, address: &DeviceAddress, quantum: bool) -> Result<DeviceIdentityKeys<Suite>> {
        if !quantum {
            return KeyManager::<Suite>::generate_identity(None);
        }

        let algorithm: QuantumAlgorithm = self.config.default_quantum_algorithm;
        let encapsulator = QuantumEncapsulator::from_config(&self.config);
        if encapsulator.supports(algorithm) {
            KeyManager::<Suite>::generate_identity(Some((&encapsulator, algorithm)))
        } else {
            warn!(
                target: "registry::identity",
                device = %address,
                algorithm = %algorithm,
                "Quantum algorithm not available, registering classic identity"
            );
            KeyManager::<Suite>::generate_identity(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::utils::time::SystemClock;

    fn registry() -> IdentityRegistry<MemoryStorage> {
        IdentityRegistry::new(
            MemoryStorage::new(),
            SealingKey::generate().unwrap(),
            Arc::new(SystemClock),
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn test_create_and_get_identity() {
        let registry = registry();
        let bob = DeviceAddress::new("bob", "laptop");

        let record = registry.create_identity(&bob, false).unwrap();
        assert_eq!(record.registration_id, 1);
        assert_eq!(record.fingerprint, identity_fingerprint(&record.public_key, &record.signing_public_key));
        // Приватный ключ не хранится в открытом виде
        assert_ne!(record.sealed_private_key.len(), 32);

        let fetched = registry.get_identity(&bob).unwrap();
        assert_eq!(fetched.fingerprint, record.fingerprint);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let registry = registry();
        let bob = DeviceAddress::new("bob", "laptop");
        registry.create_identity(&bob, false).unwrap();

        let result = registry.create_identity(&bob, false);
        assert!(matches!(result, Err(ConstructError::DuplicateIdentity(_))));
    }

    #[test]
    fn test_missing_identity_not_found() {
        let registry = registry();
        let result = registry.get_identity(&DeviceAddress::new("nobody", "none"));
        assert!(matches!(result, Err(ConstructError::NotFound(_))));
    }

    #[test]
    fn test_unlock_restores_keys() {
        let registry = registry();
        let bob = DeviceAddress::new("bob", "laptop");
        let record = registry.create_identity(&bob, false).unwrap();

        let (_, keys) = registry.unlock(&bob).unwrap();
        assert_eq!(Suite::from_private_key_to_public_key(&keys.dh.0).unwrap(), record.public_key);
        assert_eq!(keys.fingerprint(), record.fingerprint);
    }

    #[test]
    fn test_rotate_identity_bumps_registration_id() {
        let registry = registry();
        let bob = DeviceAddress::new("bob", "laptop");
        let first = registry.create_identity(&bob, false).unwrap();

        let rotation = registry.rotate_identity(&bob, false).unwrap();
        assert_eq!(rotation.previous.fingerprint, first.fingerprint);
        assert!(rotation.current.registration_id > first.registration_id);
        assert_ne!(rotation.current.fingerprint, first.fingerprint);
        assert_eq!(registry.get_identity(&bob).unwrap().fingerprint, rotation.current.fingerprint);
    }

    #[cfg(feature = "post-quantum")]
    #[test]
    fn test_quantum_identity_is_sealed() {
        let registry = registry();
        let bob = DeviceAddress::new("bob", "laptop");
        let record = registry.create_identity(&bob, true).unwrap();

        let quantum = record.quantum.as_ref().unwrap();
        assert_eq!(quantum.algorithm, QuantumAlgorithm::MlKem768);

        let (_, keys) = registry.unlock(&bob).unwrap();
        let (pair, _) = keys.quantum.as_ref().unwrap();
        assert_eq!(pair.public_key, quantum.public_key);
    }
}
