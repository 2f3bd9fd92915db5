// Публичный API ядра
// Логические операции, которые вызывают collaborators (REST, транспорт):
// публикация ключей устройства, bundle, сессии, ключи бесед, отзыв устройства

use crate::config::Config;
use crate::conversation::{ConversationKey, ConversationKeyDistributor, ConversationKeyring, DistributionReport};
use crate::crypto::master_key::SealingKey;
use crate::crypto::messaging::RatchetLimits;
use crate::lifecycle::{KeyLifecycleManager, RevocationReport, RotationReport};
use crate::protocol::{DeviceAddress, InitialMessage, OneTimePreKeyPublic, PreKeyBundle, RatchetEnvelope, SessionKey};
use crate::registry::{IdentityRegistry, IdentityRotation, PreKeyStore};
use crate::session::{BundleSource, EstablishedSession, HandshakeCoordinator, LocalBundleSource, OutboundMessage, RatchetSessions};
use crate::storage::models::{ConversationKeyBundleRecord, IdentityKeyRecord, SessionState, SignedPreKeyRecord};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::time::{Clock, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Результат публикации ключей устройства
#[derive(Debug, Clone)]
pub struct PublishedDevice {
    pub identity: IdentityKeyRecord,
    pub signed_prekey: SignedPreKeyRecord,
    /// Только сгенерированные в этом вызове
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
    pub bundle: PreKeyBundle,
}

/// Главный API ядра
#[derive(Clone)]
pub struct KeyService<S: KeyStore> {
    config: Arc<Config>,
    identities: IdentityRegistry<S>,
    prekeys: PreKeyStore<S>,
    coordinator: HandshakeCoordinator<S>,
    sessions: RatchetSessions<S>,
    distributor: ConversationKeyDistributor<S>,
    lifecycle: Arc<KeyLifecycleManager<S>>,
}

impl<S: KeyStore> KeyService<S> {
    pub fn new(store: S, sealing: SealingKey, config: Config) -> Self {
        Self::with_clock(store, sealing, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, sealing: SealingKey, config: Config, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let identities = IdentityRegistry::new(store.clone(), sealing.clone(), clock.clone(), config.clone());
        let prekeys = PreKeyStore::new(
            store.clone(),
            identities.clone(),
            sealing.clone(),
            clock.clone(),
            config.clone(),
        );
        let source = Arc::new(LocalBundleSource::new(prekeys.clone()));
        Self::assemble(store, sealing, config, clock, identities, prekeys, source)
    }

    /// Bundle собеседников берутся из внешнего источника (например, REST)
    pub fn with_bundle_source(
        store: S,
        sealing: SealingKey,
        config: Config,
        clock: Arc<dyn Clock>,
        source: Arc<dyn BundleSource>,
    ) -> Self {
        let config = Arc::new(config);
        let identities = IdentityRegistry::new(store.clone(), sealing.clone(), clock.clone(), config.clone());
        let prekeys = PreKeyStore::new(
            store.clone(),
            identities.clone(),
            sealing.clone(),
            clock.clone(),
            config.clone(),
        );
        Self::assemble(store, sealing, config, clock, identities, prekeys, source)
    }

    fn assemble(
        store: S,
        sealing: SealingKey,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        identities: IdentityRegistry<S>,
        prekeys: PreKeyStore<S>,
        source: Arc<dyn BundleSource>,
    ) -> Self {
        let coordinator = HandshakeCoordinator::new(
            store.clone(),
            identities.clone(),
            prekeys.clone(),
            source,
            sealing.clone(),
            clock.clone(),
            config.clone(),
        );
        let sessions = RatchetSessions::new(
            store.clone(),
            sealing.clone(),
            clock.clone(),
            RatchetLimits::from_config(&config),
        );
        let distributor = ConversationKeyDistributor::new(
            store.clone(),
            coordinator.clone(),
            sessions.clone(),
            sealing,
            clock.clone(),
            config.clone(),
        );
        let lifecycle = Arc::new(KeyLifecycleManager::new(
            store,
            prekeys.clone(),
            sessions.clone(),
            distributor.clone(),
            clock,
            config.clone(),
        ));

        Self {
            config,
            identities,
            prekeys,
            coordinator,
            sessions,
            distributor,
            lifecycle,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identities(&self) -> &IdentityRegistry<S> {
        &self.identities
    }

    pub fn prekeys(&self) -> &PreKeyStore<S> {
        &self.prekeys
    }

    pub fn sessions(&self) -> &RatchetSessions<S> {
        &self.sessions
    }

    // ============================================
    // УСТРОЙСТВА
    // ============================================

    /// Опубликовать identity и prekeys устройства
    ///
    /// Повторный вызов не пересоздаёт identity: отсутствующий signed prekey
    /// публикуется, пул one-time prekeys дополняется до `one_time_prekey_batch`.
    pub fn publish_device(&self, address: &DeviceAddress, quantum: bool) -> Result<PublishedDevice> {
        let identity = match self.identities.get_identity(address) {
            Ok(identity) => identity,
            Err(ConstructError::NotFound(_)) => self.identities.create_identity(address, quantum)?,
            Err(err) => return Err(err),
        };

        let signed_prekey = match self.prekeys.active_signed_prekey(address)? {
            Some(active) => active,
            None => self.prekeys.rotate_signed_prekey(address)?,
        };

        let available = self.prekeys.available_one_time_prekeys(address)?;
        let missing = self.config.one_time_prekey_batch.saturating_sub(available);
        let count = u32::try_from(missing)
            .map_err(|_| ConstructError::InvalidInput(format!("Batch size too large: {}", missing)))?;
        let one_time_prekeys = self.prekeys.generate_one_time_prekeys(address, count)?;

        info!(
            target: "registry::prekeys",
            device = %address,
            fingerprint = %identity.fingerprint,
            one_time_prekeys = one_time_prekeys.len(),
            "Device published"
        );

        Ok(PublishedDevice {
            identity,
            signed_prekey,
            one_time_prekeys,
            bundle: self.prekeys.get_prekey_bundle(address)?,
        })
    }

    pub fn fetch_prekey_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle> {
        self.prekeys.get_prekey_bundle(address)
    }

    /// Новая identity устройства со свежими prekeys
    pub fn rotate_identity(&self, address: &DeviceAddress, quantum: bool) -> Result<IdentityRotation> {
        let rotation = self.identities.rotate_identity(address, quantum)?;
        self.publish_device(address, quantum)?;
        Ok(rotation)
    }

    pub async fn revoke_device(&self, address: &DeviceAddress, reason: &str) -> Result<RevocationReport> {
        self.lifecycle.revoke_device(address, reason).await
    }

    // ============================================
    // СЕССИИ
    // ============================================

    pub async fn establish_session(&self, local: &DeviceAddress, remote: &DeviceAddress) -> Result<EstablishedSession> {
        self.coordinator.initiate(local, remote).await
    }

    pub fn accept_session(&self, local: &DeviceAddress, message: &InitialMessage) -> Result<EstablishedSession> {
        self.coordinator.accept(local, message)
    }

    pub fn session_state(&self, local: &DeviceAddress, remote: &DeviceAddress) -> Result<SessionState> {
        self.sessions
            .state(&SessionKey::new(local.clone(), remote.clone()))
    }

    /// Зашифровать сообщение для устройства
    ///
    /// Если сессии ещё нет, сначала выполняется handshake. Отозванная
    /// сессия не переустанавливается: `SessionRevoked`.
    pub async fn encrypt(&self, local: &DeviceAddress, remote: &DeviceAddress, plaintext: &[u8]) -> Result<OutboundMessage> {
        let key = SessionKey::new(local.clone(), remote.clone());
        {
            let _guard = self.sessions.lock_session(&key).await;
            if self.sessions.state(&key)? == SessionState::Uninitialized {
                self.coordinator.initiate(local, remote).await?;
            }
        }
        self.sessions.encrypt(&key, plaintext).await
    }

    /// Расшифровать сообщение от `remote`; вложенный handshake принимается,
    /// если его сессия ещё неизвестна
    pub async fn decrypt(
        &self,
        local: &DeviceAddress,
        remote: &DeviceAddress,
        envelope: &RatchetEnvelope,
        handshake: Option<&InitialMessage>,
    ) -> Result<Vec<u8>> {
        let key = SessionKey::new(local.clone(), remote.clone());
        if let Some(message) = handshake {
            if message.initiator != *remote {
                return Err(ConstructError::InvalidInput(format!(
                    "Handshake from {} delivered as {}",
                    message.initiator, remote
                )));
            }
            if !self.sessions.has_session(&key, message.session_id)? {
                self.coordinator.accept(local, message)?;
            }
        }
        self.sessions.decrypt(&key, envelope).await
    }

    // ============================================
    // КЛЮЧИ БЕСЕД
    // ============================================

    pub async fn distribute_key(
        &self,
        owner: &DeviceAddress,
        conversation_id: Uuid,
        participants: Vec<DeviceAddress>,
    ) -> Result<DistributionReport> {
        self.distributor
            .distribute_key(owner, conversation_id, participants)
            .await
    }

    pub async fn rotate_conversation_key(&self, conversation_id: Uuid) -> Result<DistributionReport> {
        self.distributor.rotate_key(conversation_id).await
    }

    pub async fn retry_key_delivery(
        &self,
        conversation_id: Uuid,
        recipient: &DeviceAddress,
    ) -> Result<ConversationKeyBundleRecord> {
        self.distributor.retry_device(conversation_id, recipient).await
    }

    pub async fn unwrap_bundle(&self, local: &DeviceAddress, bundle: &ConversationKeyBundleRecord) -> Result<ConversationKey> {
        self.distributor.unwrap_bundle(local, bundle).await
    }

    pub fn pending_bundles(&self, conversation_id: Uuid, recipient: &DeviceAddress) -> Result<Vec<ConversationKeyBundleRecord>> {
        self.distributor.bundles_for(conversation_id, recipient)
    }

    pub fn conversation_keyring(&self, conversation_id: Uuid) -> Result<ConversationKeyring> {
        self.distributor.keyring(conversation_id)
    }

    // ============================================
    // РОТАЦИЯ
    // ============================================

    pub async fn run_rotation_pass(&self) -> Result<RotationReport> {
        self.lifecycle.run_rotation_pass().await
    }

    pub fn spawn_rotation(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.lifecycle.clone().spawn(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn service() -> KeyService<MemoryStorage> {
        let config = Config {
            one_time_prekey_batch: 10,
            one_time_prekey_low_water: 3,
            ..Config::default()
        };
        KeyService::new(MemoryStorage::new(), SealingKey::generate().unwrap(), config)
    }

    #[test]
    fn test_publish_device_is_idempotent() {
        let api = service();
        let device = DeviceAddress::new("alice", "phone");

        let first = api.publish_device(&device, false).unwrap();
        assert_eq!(first.one_time_prekeys.len(), 10);
        assert!(first.bundle.one_time_prekey.is_some());

        let second = api.publish_device(&device, false).unwrap();
        assert_eq!(second.identity.fingerprint, first.identity.fingerprint);
        assert_eq!(second.signed_prekey.key_id, first.signed_prekey.key_id);
        assert!(second.one_time_prekeys.is_empty());
    }

    #[tokio::test]
    async fn test_first_message_carries_handshake() {
        let api = service();
        let alice = DeviceAddress::new("alice", "phone");
        let bob = DeviceAddress::new("bob", "laptop");
        api.publish_device(&alice, false).unwrap();
        api.publish_device(&bob, false).unwrap();

        assert_eq!(api.session_state(&alice, &bob).unwrap(), SessionState::Uninitialized);
        let outbound = api.encrypt(&alice, &bob, b"hello").await.unwrap();
        let handshake = outbound.handshake.clone().unwrap();

        let plaintext = api
            .decrypt(&bob, &alice, &outbound.envelope, Some(&handshake))
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");

        let reply = api.encrypt(&bob, &alice, b"hi").await.unwrap();
        assert!(reply.handshake.is_none());
        assert_eq!(api.decrypt(&alice, &bob, &reply.envelope, None).await.unwrap(), b"hi");

        // После ответа инициатор больше не прикладывает handshake
        let next = api.encrypt(&alice, &bob, b"again").await.unwrap();
        assert!(next.handshake.is_none());
        assert_eq!(api.session_state(&alice, &bob).unwrap(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_handshake_from_wrong_sender_rejected() {
        let api = service();
        let alice = DeviceAddress::new("alice", "phone");
        let bob = DeviceAddress::new("bob", "laptop");
        let carol = DeviceAddress::new("carol", "tablet");
        for device in [&alice, &bob, &carol] {
            api.publish_device(device, false).unwrap();
        }

        let outbound = api.encrypt(&alice, &bob, b"hello").await.unwrap();
        let handshake = outbound.handshake.clone().unwrap();
        let result = api.decrypt(&bob, &carol, &outbound.envelope, Some(&handshake)).await;
        assert!(matches!(result, Err(ConstructError::InvalidInput(_))));
    }
}
