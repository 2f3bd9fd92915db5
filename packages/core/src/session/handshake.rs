// HandshakeCoordinator: X3DH-style handshake с опциональным ML-KEM секретом
//
// Инициатор ничего не сохраняет, пока handshake не завершён: таймаут или
// ошибка проверки bundle не оставляют частичного состояния.

use crate::config::{Config, QuantumPolicy};
use crate::crypto::handshake::{LocalPreKeys, RemotePreKeys, X3DHProtocol};
use crate::crypto::keys::{identity_fingerprint, DeviceIdentityKeys};
use crate::crypto::master_key::SealingKey;
use crate::crypto::messaging::{DoubleRatchetSession, RatchetLimits, SecureMessaging};
use crate::crypto::quantum::{Encapsulation, QuantumEncapsulator};
use crate::crypto::{CryptoProvider, Suite};
use crate::protocol::{
    DeviceAddress, InitialMessage, OneTimePreKeyPublic, PreKeyBundle, QuantumCiphertext, QuantumPreKeyPublic,
    SessionKey,
};
use crate::registry::{IdentityRegistry, PreKeyStore};
use crate::session::{seal_state, BundleSource};
use crate::storage::models::{
    EncapsulationCompletion, IdentityKeyRecord, QuantumEncapsulationRecord, SessionRecord, SessionRole, SessionState,
};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::logging::{security_event, SecurityEvent};
use crate::utils::time::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Результат handshake на одной стороне
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    pub session_id: Uuid,
    pub key: SessionKey,
    pub role: SessionRole,
    /// У инициатора: сообщение, которое нужно доставить получателю
    pub initial_message: Option<InitialMessage>,
    pub remote_fingerprint: String,
    /// Handshake прошёл без one-time prekey
    pub reduced_security: bool,
    pub hybrid: bool,
}

/// Bundle, прошедший проверку, policy и claim
struct NegotiatedBundle {
    bundle: PreKeyBundle,
    quantum: Option<(QuantumPreKeyPublic, Encapsulation)>,
    one_time_prekey: Option<OneTimePreKeyPublic>,
}

/// Координатор handshake
#[derive(Clone)]
pub struct HandshakeCoordinator<S: KeyStore> {
    store: S,
    identities: IdentityRegistry<S>,
    prekeys: PreKeyStore<S>,
    source: Arc<dyn BundleSource>,
    encapsulator: QuantumEncapsulator,
    sealing: SealingKey,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<S: KeyStore> HandshakeCoordinator<S> {
    pub fn new(
        store: S,
        identities: IdentityRegistry<S>,
        prekeys: PreKeyStore<S>,
        source: Arc<dyn BundleSource>,
        sealing: SealingKey,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            identities,
            prekeys,
            source,
            encapsulator: QuantumEncapsulator::from_config(&config),
            sealing,
            clock,
            config,
        }
    }

    // ============================================
    // INITIATOR
    // ============================================

    /// Установить сессию local → remote
    ///
    /// # Errors
    /// - `HandshakeTimeout`: bundle не получен за `handshake_timeout_ms`
    /// - `InvalidSignature`: подпись signed prekey или квантового ключа не проверяется
    /// - `StalePreKeyBundle`: signed prekey собеседника истёк
    /// - `UnsupportedAlgorithm`: KEM недоступен при `QuantumPolicy::RequireHybrid`
    pub async fn initiate(&self, local: &DeviceAddress, remote: &DeviceAddress) -> Result<EstablishedSession> {
        if local == remote {
            return Err(ConstructError::InvalidInput(format!("Cannot open a session with itself: {}", local)));
        }

        // Локальные проверки до claim: неудача после него сжигает OPK собеседника
        let (local_identity, keys) = self.identities.unlock(local)?;

        let timeout_ms = self.config.handshake_timeout_ms;
        let negotiated = tokio::time::timeout(Duration::from_millis(timeout_ms), self.negotiate_bundle(remote)).await;
        let negotiated = match negotiated {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    target: "session::handshake",
                    local = %local,
                    remote = %remote,
                    timeout_ms,
                    "Prekey bundle fetch timed out"
                );
                return Err(ConstructError::HandshakeTimeout(timeout_ms));
            }
        };

        self.complete_initiation(local, local_identity, keys, negotiated)
    }

    /// Получить проверенный bundle, применить quantum policy и забрать OPK
    ///
    /// Claim идёт последним: bundle, отклонённый политикой, не тратит OPK.
    /// Если OPK забрал конкурент, bundle перезапрашивается. После исчерпания
    /// попыток handshake продолжается без OPK.
    async fn negotiate_bundle(&self, remote: &DeviceAddress) -> Result<NegotiatedBundle> {
        let attempts = self.config.handshake_prekey_retries.max(1);
        let mut attempt = 1;

        loop {
            let bundle = self.source.fetch_bundle(remote).await?;
            self.verify_bundle(remote, &bundle)?;
            let quantum = self.select_quantum(&bundle)?;

            let Some(one_time_prekey) = bundle.one_time_prekey.clone() else {
                return Ok(NegotiatedBundle { bundle, quantum, one_time_prekey: None });
            };

            match self.source.claim_one_time_prekey(remote, one_time_prekey.key_id).await {
                Ok(()) => {
                    return Ok(NegotiatedBundle {
                        bundle,
                        quantum,
                        one_time_prekey: Some(one_time_prekey),
                    })
                }
                Err(ConstructError::AlreadyUsed { .. }) | Err(ConstructError::NotFound(_)) if attempt < attempts => {
                    debug!(
                        target: "session::handshake",
                        remote = %remote,
                        key_id = one_time_prekey.key_id,
                        attempt,
                        "One-time prekey taken concurrently, refetching bundle"
                    );
                    attempt += 1;
                }
                Err(ConstructError::AlreadyUsed { .. }) | Err(ConstructError::NotFound(_)) => {
                    return Ok(NegotiatedBundle { bundle, quantum, one_time_prekey: None });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn verify_bundle(&self, remote: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()> {
        if bundle.address != *remote {
            return Err(ConstructError::InvalidInput(format!(
                "Bundle for {} returned for {}",
                bundle.address, remote
            )));
        }
        if bundle.suite_id != Suite::suite_id() {
            return Err(ConstructError::InvalidInput(format!("Unknown suite {}", bundle.suite_id)));
        }

        let verified = X3DHProtocol::<Suite>::verify_prekey_signature(
            &bundle.signing_key,
            &bundle.signed_prekey,
            &bundle.signed_prekey_signature,
        )
        .and_then(|()| match &bundle.quantum {
            Some(quantum) => {
                X3DHProtocol::<Suite>::verify_prekey_signature(&bundle.signing_key, &quantum.public_key, &quantum.signature)
            }
            None => Ok(()),
        });
        if let Err(err) = verified {
            security_event(
                SecurityEvent::InvalidSignature,
                &remote.to_string(),
                &format!("prekey bundle signed prekey {}", bundle.signed_prekey_id),
            );
            return Err(err);
        }

        if bundle.signed_prekey_expires_at <= self.clock.now() {
            return Err(ConstructError::StalePreKeyBundle(remote.to_string()));
        }
        Ok(())
    }

    /// Квантовая часть по политике: (опубликованный ключ, инкапсуляция) или None
    fn select_quantum(&self, bundle: &PreKeyBundle) -> Result<Option<(QuantumPreKeyPublic, Encapsulation)>> {
        let policy = self.config.quantum_policy;
        match (&bundle.quantum, policy) {
            (_, QuantumPolicy::ClassicOnly) => Ok(None),
            (None, QuantumPolicy::RequireHybrid) => Err(ConstructError::UnsupportedAlgorithm(format!(
                "{} publishes no quantum key",
                bundle.address
            ))),
            (None, QuantumPolicy::PreferHybrid) => Ok(None),
            (Some(quantum), _) if self.encapsulator.supports(quantum.algorithm) => {
                let encapsulation = self.encapsulator.encapsulate(quantum.algorithm, &quantum.public_key)?;
                Ok(Some((quantum.clone(), encapsulation)))
            }
            (Some(quantum), QuantumPolicy::RequireHybrid) => {
                Err(ConstructError::UnsupportedAlgorithm(quantum.algorithm.tag().to_string()))
            }
            (Some(quantum), QuantumPolicy::PreferHybrid) => {
                security_event(
                    SecurityEvent::QuantumFallback,
                    &bundle.address.to_string(),
                    &format!("{} not supported locally", quantum.algorithm),
                );
                Ok(None)
            }
        }
    }

    fn complete_initiation(
        &self,
        local: &DeviceAddress,
        local_identity: IdentityKeyRecord,
        keys: DeviceIdentityKeys<Suite>,
        negotiated: NegotiatedBundle,
    ) -> Result<EstablishedSession> {
        let NegotiatedBundle {
            bundle,
            quantum,
            one_time_prekey,
        } = negotiated;

        let remote_keys = RemotePreKeys {
            identity_public: &bundle.identity_key,
            signed_prekey_public: &bundle.signed_prekey,
            one_time_prekey_public: one_time_prekey.as_ref().map(|k| k.public_key.as_slice()),
        };
        let (root_key, initiator_state) = X3DHProtocol::<Suite>::perform_as_initiator(
            &keys.dh.0,
            &remote_keys,
            quantum.as_ref().map(|(_, encapsulation)| encapsulation.shared_secret.as_slice()),
        )?;
        let ephemeral_key = Suite::from_private_key_to_public_key(&initiator_state.ephemeral_private)?;

        let session_id = Uuid::new_v4();
        let key = SessionKey::new(local.clone(), bundle.address.clone());
        let session = DoubleRatchetSession::<Suite>::new_initiator_session(
            &root_key,
            initiator_state,
            &bundle.signed_prekey,
            session_id.to_string(),
        )?
        .with_limits(RatchetLimits::from_config(&self.config));

        let initial_message = InitialMessage {
            session_id,
            initiator: local.clone(),
            responder: bundle.address.clone(),
            registration_id: local_identity.registration_id,
            identity_key: local_identity.public_key.clone(),
            signing_key: local_identity.signing_public_key.clone(),
            ephemeral_key,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: one_time_prekey.as_ref().map(|k| k.key_id),
            quantum: quantum.as_ref().map(|(published, encapsulation)| QuantumCiphertext {
                algorithm: published.algorithm,
                version: published.version,
                ciphertext: encapsulation.ciphertext.clone(),
            }),
            suite_id: Suite::suite_id(),
        };

        let now = self.clock.now();
        let remote_fingerprint = identity_fingerprint(&bundle.identity_key, &bundle.signing_key);
        let reduced_security = one_time_prekey.is_none();
        let record = SessionRecord {
            session_id,
            key: key.clone(),
            role: SessionRole::Initiator,
            state: SessionState::Established,
            sealed_state: seal_state(&self.sealing, &key, session_id, &session)?,
            remote_identity_key: bundle.identity_key.clone(),
            remote_fingerprint: remote_fingerprint.clone(),
            remote_registration_id: bundle.registration_id,
            message_counter: 0,
            is_active: true,
            pending_handshake: Some(initial_message.clone()),
            reduced_security,
            hybrid: quantum.is_some(),
            created_at: now,
            last_used_at: now,
            revoked_at: None,
            revocation_reason: None,
        };

        self.store.insert_session(record)?;
        if let Some((published, encapsulation)) = &quantum {
            self.store.store_encapsulation(QuantumEncapsulationRecord {
                session_id,
                owner: local.clone(),
                algorithm: published.algorithm,
                version: published.version,
                public_key: published.public_key.clone(),
                sealed_private_key: None,
                completion: Some(self.completion(local, session_id, &encapsulation.ciphertext, &encapsulation.shared_secret, now)?),
                is_active: true,
                expires_at: Some(now + chrono::Duration::seconds(self.config.session_max_idle_secs)),
            })?;
        }

        self.log_established(&key, session_id, reduced_security, quantum.is_some(), SessionRole::Initiator);

        Ok(EstablishedSession {
            session_id,
            key,
            role: SessionRole::Initiator,
            initial_message: Some(initial_message),
            remote_fingerprint,
            reduced_security,
            hybrid: quantum.is_some(),
        })
    }

    // ============================================
    // RESPONDER
    // ============================================

    /// Принять InitialMessage на стороне получателя
    ///
    /// Приватный one-time prekey стирается при первом accept, поэтому повторный
    /// InitialMessage даёт `AlreadyUsed`.
    pub fn accept(&self, local: &DeviceAddress, message: &InitialMessage) -> Result<EstablishedSession> {
        if message.responder != *local {
            return Err(ConstructError::InvalidInput(format!(
                "Handshake addressed to {}, not {}",
                message.responder, local
            )));
        }
        if message.suite_id != Suite::suite_id() {
            return Err(ConstructError::InvalidInput(format!("Unknown suite {}", message.suite_id)));
        }
        if message.quantum.is_none() && self.config.quantum_policy == QuantumPolicy::RequireHybrid {
            return Err(ConstructError::UnsupportedAlgorithm(format!(
                "{} sent a classic-only handshake",
                message.initiator
            )));
        }

        let (_, keys) = self.identities.unlock(local)?;
        let signed_prekey_private = self.prekeys.signed_prekey_private(local, message.signed_prekey_id)?;

        let quantum = match &message.quantum {
            Some(ciphertext) => {
                let (pair, _) = keys
                    .quantum
                    .as_ref()
                    .filter(|(pair, _)| pair.algorithm == ciphertext.algorithm)
                    .ok_or_else(|| ConstructError::UnsupportedAlgorithm(ciphertext.algorithm.tag().to_string()))?;
                let shared_secret =
                    self.encapsulator
                        .decapsulate(ciphertext.algorithm, &ciphertext.ciphertext, &pair.private_key)?;
                Some((ciphertext, pair, shared_secret))
            }
            None => None,
        };

        let one_time_private = match message.one_time_prekey_id {
            Some(key_id) => Some(self.prekeys.take_one_time_prekey_private(local, key_id)?),
            None => None,
        };

        let key = SessionKey::new(local.clone(), message.initiator.clone());
        if self.store.session(&key, message.session_id)?.is_some() {
            security_event(
                SecurityEvent::ReplayDetected,
                &local.to_string(),
                &format!("handshake {} from {} replayed", message.session_id, message.initiator),
            );
            return Err(ConstructError::ReplayOrExpiredKey(format!(
                "Handshake {} already accepted",
                message.session_id
            )));
        }

        let local_prekeys = LocalPreKeys::<Suite> {
            identity_private: &keys.dh.0,
            signed_prekey_private: &*signed_prekey_private,
            one_time_prekey_private: one_time_private.as_deref(),
        };
        let root_key = X3DHProtocol::<Suite>::perform_as_responder(
            &local_prekeys,
            &message.identity_key,
            &message.ephemeral_key,
            quantum.as_ref().map(|(_, _, shared_secret)| shared_secret.as_slice()),
        )?;

        let session = DoubleRatchetSession::<Suite>::new_responder_session(
            &root_key,
            signed_prekey_private.to_vec(),
            &message.ephemeral_key,
            message.session_id.to_string(),
        )?
        .with_limits(RatchetLimits::from_config(&self.config));

        let now = self.clock.now();
        let remote_fingerprint = identity_fingerprint(&message.identity_key, &message.signing_key);
        let reduced_security = message.one_time_prekey_id.is_none();
        let record = SessionRecord {
            session_id: message.session_id,
            key: key.clone(),
            role: SessionRole::Responder,
            state: SessionState::Established,
            sealed_state: seal_state(&self.sealing, &key, message.session_id, &session)?,
            remote_identity_key: message.identity_key.clone(),
            remote_fingerprint: remote_fingerprint.clone(),
            remote_registration_id: message.registration_id,
            message_counter: 0,
            is_active: true,
            pending_handshake: None,
            reduced_security,
            hybrid: quantum.is_some(),
            created_at: now,
            last_used_at: now,
            revoked_at: None,
            revocation_reason: None,
        };

        self.store.insert_session(record)?;
        if let Some((ciphertext, pair, shared_secret)) = &quantum {
            self.store.store_encapsulation(QuantumEncapsulationRecord {
                session_id: message.session_id,
                owner: local.clone(),
                algorithm: ciphertext.algorithm,
                version: ciphertext.version,
                public_key: pair.public_key.clone(),
                sealed_private_key: Some(self.sealing.seal(
                    &pair.private_key,
                    &local.context(&format!("kem-private-{}", message.session_id)),
                )?),
                completion: Some(self.completion(local, message.session_id, &ciphertext.ciphertext, shared_secret, now)?),
                is_active: true,
                expires_at: Some(now + chrono::Duration::seconds(self.config.session_max_idle_secs)),
            })?;
        }

        self.log_established(&key, message.session_id, reduced_security, quantum.is_some(), SessionRole::Responder);

        Ok(EstablishedSession {
            session_id: message.session_id,
            key,
            role: SessionRole::Responder,
            initial_message: None,
            remote_fingerprint,
            reduced_security,
            hybrid: quantum.is_some(),
        })
    }

    fn completion(
        &self,
        owner: &DeviceAddress,
        session_id: Uuid,
        ciphertext: &[u8],
        shared_secret: &[u8],
        now: DateTime<Utc>,
    ) -> Result<EncapsulationCompletion> {
        Ok(EncapsulationCompletion {
            ciphertext: ciphertext.to_vec(),
            sealed_shared_secret: self
                .sealing
                .seal(shared_secret, &owner.context(&format!("kem-secret-{}", session_id)))?,
            established_at: now,
        })
    }

    fn log_established(&self, key: &SessionKey, session_id: Uuid, reduced_security: bool, hybrid: bool, role: SessionRole) {
        if reduced_security {
            security_event(
                SecurityEvent::ReducedSecurityHandshake,
                &key.local.to_string(),
                &format!("session {} with {} has no one-time prekey", session_id, key.remote),
            );
        }
        info!(
            target: "session::handshake",
            session = %key,
            session_id = %session_id,
            role = ?role,
            hybrid,
            reduced_security,
            "Session established"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LocalBundleSource;
    use crate::storage::MemoryStorage;
    use crate::utils::time::ManualClock;

    struct Fixture {
        store: MemoryStorage,
        identities: IdentityRegistry<MemoryStorage>,
        prekeys: PreKeyStore<MemoryStorage>,
        coordinator: HandshakeCoordinator<MemoryStorage>,
        clock: ManualClock,
        alice: DeviceAddress,
        bob: DeviceAddress,
    }

    fn fixture(config: Config) -> Fixture {
        let store = MemoryStorage::new();
        let sealing = SealingKey::generate().unwrap();
        let clock = ManualClock::new(Utc::now());
        let config = Arc::new(config);
        let identities = IdentityRegistry::new(store.clone(), sealing.clone(), Arc::new(clock.clone()), config.clone());
        let prekeys = PreKeyStore::new(
            store.clone(),
            identities.clone(),
            sealing.clone(),
            Arc::new(clock.clone()),
            config.clone(),
        );
        let coordinator = HandshakeCoordinator::new(
            store.clone(),
            identities.clone(),
            prekeys.clone(),
            Arc::new(LocalBundleSource::new(prekeys.clone())),
            sealing,
            Arc::new(clock.clone()),
            config,
        );

        let alice = DeviceAddress::new("alice", "phone");
        let bob = DeviceAddress::new("bob", "laptop");
        for device in [&alice, &bob] {
            identities.create_identity(device, false).unwrap();
            prekeys.rotate_signed_prekey(device).unwrap();
        }

        Fixture {
            store,
            identities,
            prekeys,
            coordinator,
            clock,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn test_initiate_and_accept_with_one_time_prekey() {
        let f = fixture(Config::default());
        f.prekeys.generate_one_time_prekeys(&f.bob, 2).unwrap();

        let initiated = f.coordinator.initiate(&f.alice, &f.bob).await.unwrap();
        assert!(!initiated.reduced_security);
        let message = initiated.initial_message.clone().unwrap();
        assert_eq!(message.one_time_prekey_id, Some(1));
        assert_eq!(f.prekeys.available_one_time_prekeys(&f.bob).unwrap(), 1);

        let accepted = f.coordinator.accept(&f.bob, &message).unwrap();
        assert_eq!(accepted.session_id, initiated.session_id);
        assert_eq!(accepted.key, initiated.key.reversed());
        assert_eq!(
            accepted.remote_fingerprint,
            f.identities.get_identity(&f.alice).unwrap().fingerprint
        );

        let record = f.store.active_session(&initiated.key).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Established);
        assert!(record.pending_handshake.is_some());
    }

    #[tokio::test]
    async fn test_replayed_initial_message_rejected() {
        let f = fixture(Config::default());
        f.prekeys.generate_one_time_prekeys(&f.bob, 1).unwrap();

        let initiated = f.coordinator.initiate(&f.alice, &f.bob).await.unwrap();
        let message = initiated.initial_message.unwrap();
        f.coordinator.accept(&f.bob, &message).unwrap();

        let replay = f.coordinator.accept(&f.bob, &message);
        assert!(matches!(replay, Err(ConstructError::AlreadyUsed { key_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_stale_bundle_rejected() {
        let f = fixture(Config::default());
        f.clock.advance(chrono::Duration::days(31));

        let result = f.coordinator.initiate(&f.alice, &f.bob).await;
        assert!(matches!(result, Err(ConstructError::StalePreKeyBundle(_))));
        assert!(f.store.all_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accept_for_other_device_rejected() {
        let f = fixture(Config::default());
        let initiated = f.coordinator.initiate(&f.alice, &f.bob).await.unwrap();
        let message = initiated.initial_message.unwrap();

        let result = f.coordinator.accept(&f.alice, &message);
        assert!(matches!(result, Err(ConstructError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_require_hybrid_rejects_classic_peer() {
        let mut config = Config::default();
        config.quantum_policy = QuantumPolicy::RequireHybrid;
        let f = fixture(config);

        let result = f.coordinator.initiate(&f.alice, &f.bob).await;
        assert!(matches!(result, Err(ConstructError::UnsupportedAlgorithm(_))));
        assert!(f.store.all_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_policy_rejection_keeps_one_time_prekeys() {
        let mut config = Config::default();
        config.quantum_policy = QuantumPolicy::RequireHybrid;
        let f = fixture(config);
        f.prekeys.generate_one_time_prekeys(&f.bob, 3).unwrap();

        for _ in 0..3 {
            let result = f.coordinator.initiate(&f.alice, &f.bob).await;
            assert!(matches!(result, Err(ConstructError::UnsupportedAlgorithm(_))));
        }
        assert_eq!(f.prekeys.available_one_time_prekeys(&f.bob).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_initiator_keeps_one_time_prekeys() {
        let f = fixture(Config::default());
        f.prekeys.generate_one_time_prekeys(&f.bob, 2).unwrap();
        let stranger = DeviceAddress::new("carol", "tablet");

        let result = f.coordinator.initiate(&stranger, &f.bob).await;
        assert!(matches!(result, Err(ConstructError::NotFound(_))));
        assert_eq!(f.prekeys.available_one_time_prekeys(&f.bob).unwrap(), 2);
    }
}
