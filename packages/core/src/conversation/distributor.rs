// ConversationKeyDistributor: ключ беседы, обёрнутый для каждого устройства
//
// Версия ключа фиксируется до рассылки. Смены версии одной беседы идут
// под её мьютексом: read → bump → upsert → fan-out не перемежаются.
// Доставка на каждое устройство независима: частичный результат
// коммитится, упавшие устройства повторяются через retry_device.

use crate::config::Config;
use crate::conversation::cipher::{ConversationKey, ConversationKeyring};
use crate::crypto::master_key::SealingKey;
use crate::protocol::{DeviceAddress, SessionKey};
use crate::session::{HandshakeCoordinator, RatchetSessions};
use crate::storage::models::{ChatEncryptionKeyRecord, ConversationKeyBundleRecord, ConversationRecord, KeyWrapAlgorithm};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::serialization::to_bytes;
use crate::utils::time::Clock;
use chrono::Duration;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Итог рассылки одной версии ключа
#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub conversation_id: Uuid,
    pub version: u32,
    /// Копия ключа для распределяющего устройства
    pub key: ConversationKey,
    pub delivered: Vec<ConversationKeyBundleRecord>,
    pub failed: Vec<(DeviceAddress, ConstructError)>,
}

impl DistributionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn key_context(owner: &DeviceAddress, conversation_id: Uuid, version: u32) -> Vec<u8> {
    owner.context(&format!("conversation-{}-v{}", conversation_id, version))
}

#[derive(Clone)]
pub struct ConversationKeyDistributor<S: KeyStore> {
    store: S,
    coordinator: HandshakeCoordinator<S>,
    sessions: RatchetSessions<S>,
    sealing: SealingKey,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S: KeyStore> ConversationKeyDistributor<S> {
    pub fn new(
        store: S,
        coordinator: HandshakeCoordinator<S>,
        sessions: RatchetSessions<S>,
        sealing: SealingKey,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            coordinator,
            sessions,
            sealing,
            clock,
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Сгенерировать новую версию ключа и разослать её участникам
    ///
    /// `owner` это распределяющее устройство, в список получателей оно не входит.
    /// Для устройств без сессии выполняется handshake.
    pub async fn distribute_key(
        &self,
        owner: &DeviceAddress,
        conversation_id: Uuid,
        participants: Vec<DeviceAddress>,
    ) -> Result<DistributionReport> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let mut record = match self.store.conversation(conversation_id)? {
            Some(record) if record.owner != *owner => {
                return Err(ConstructError::InvalidInput(format!(
                    "Conversation {} is distributed by {}, not {}",
                    conversation_id, record.owner, owner
                )));
            }
            Some(record) => record,
            None => ConversationRecord {
                id: conversation_id,
                owner: owner.clone(),
                participants: Vec::new(),
                current_version: 0,
                sealed_keys: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            },
        };

        let unique: BTreeSet<DeviceAddress> = participants.into_iter().filter(|p| p != owner).collect();
        record.participants = unique.into_iter().collect();
        self.distribute_new_version(record).await
    }

    /// Новая версия только для участников с активной identity
    pub async fn rotate_key(&self, conversation_id: Uuid) -> Result<DistributionReport> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let mut record = self.conversation(conversation_id)?;

        let mut active = Vec::with_capacity(record.participants.len());
        for participant in record.participants.drain(..) {
            if self.store.active_identity(&participant)?.is_some() {
                active.push(participant);
            } else {
                debug!(
                    target: "conversation::distributor",
                    conversation = %conversation_id,
                    device = %participant,
                    "Dropping inactive participant on rotation"
                );
            }
        }
        record.participants = active;

        self.distribute_new_version(record).await
    }

    /// Исключить устройство и ротировать ключ
    pub async fn remove_participant(
        &self,
        conversation_id: Uuid,
        device: &DeviceAddress,
        reason: &str,
    ) -> Result<DistributionReport> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let mut record = self.conversation(conversation_id)?;
        record.participants.retain(|p| p != device);

        if let Some(mut chat_key) = self.store.chat_key(conversation_id, device)? {
            let now = self.clock.now();
            chat_key.is_active = false;
            chat_key.revoked_at = Some(now);
            chat_key.revocation_reason = Some(reason.to_string());
            chat_key.updated_at = now;
            self.store.upsert_chat_key(chat_key)?;
        }

        self.distribute_new_version(record).await
    }

    /// Повторить доставку текущей версии одному устройству
    ///
    /// Ждёт идущую ротацию, поэтому не доставляет уже заменённую версию.
    pub async fn retry_device(
        &self,
        conversation_id: Uuid,
        recipient: &DeviceAddress,
    ) -> Result<ConversationKeyBundleRecord> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let record = self.conversation(conversation_id)?;
        if !record.participants.contains(recipient) {
            return Err(ConstructError::InvalidInput(format!(
                "{} is not a participant of {}",
                recipient, conversation_id
            )));
        }

        let version = record.current_version;
        let key = self.unseal_key(&record, version)?;
        self.deliver(&record.owner, recipient, conversation_id, version, &key).await
    }

    /// Все версии ключа беседы на распределяющем устройстве
    pub fn keyring(&self, conversation_id: Uuid) -> Result<ConversationKeyring> {
        let record = self.conversation(conversation_id)?;
        let mut keyring = ConversationKeyring::new(conversation_id);
        for &version in record.sealed_keys.keys() {
            keyring.insert(version, self.unseal_key(&record, version)?);
        }
        Ok(keyring)
    }

    /// Bundles устройства в беседе, по возрастанию версии
    pub fn bundles_for(&self, conversation_id: Uuid, recipient: &DeviceAddress) -> Result<Vec<ConversationKeyBundleRecord>> {
        self.store.bundles_for(conversation_id, recipient)
    }

    /// Развернуть bundle на устройстве-получателе
    ///
    /// Если bundle открыл новую сессию, сначала принимается вложенный handshake.
    /// Ratchet ключ одноразовый: повторный unwrap того же bundle даёт
    /// `ReplayOrExpiredKey`, развёрнутый ключ хранит вызывающий.
    pub async fn unwrap_bundle(
        &self,
        local: &DeviceAddress,
        bundle: &ConversationKeyBundleRecord,
    ) -> Result<ConversationKey> {
        if bundle.recipient != *local {
            return Err(ConstructError::InvalidInput(format!(
                "Bundle addressed to {}, not {}",
                bundle.recipient, local
            )));
        }

        let key = SessionKey::new(local.clone(), bundle.sender.clone());
        if let Some(handshake) = &bundle.handshake {
            if !self.sessions.has_session(&key, handshake.session_id)? {
                self.coordinator.accept(local, handshake)?;
            }
        }

        let bytes = Zeroizing::new(self.sessions.decrypt(&key, &bundle.wrapped_key).await?);
        ConversationKey::from_bytes(&bytes)
    }

    fn conversation(&self, conversation_id: Uuid) -> Result<ConversationRecord> {
        self.store
            .conversation(conversation_id)?
            .ok_or_else(|| ConstructError::NotFound(format!("Conversation {}", conversation_id)))
    }

    fn unseal_key(&self, record: &ConversationRecord, version: u32) -> Result<ConversationKey> {
        let sealed = record.sealed_keys.get(&version).ok_or_else(|| {
            ConstructError::NotFound(format!("Key version {} for conversation {}", version, record.id))
        })?;
        let bytes = self
            .sealing
            .open(sealed, &key_context(&record.owner, record.id, version))?;
        ConversationKey::from_bytes(&bytes)
    }

    /// Вызывается под мьютексом беседы
    async fn distribute_new_version(&self, mut record: ConversationRecord) -> Result<DistributionReport> {
        let version = record.current_version + 1;
        let key = ConversationKey::generate()?;
        let now = self.clock.now();

        record.sealed_keys.insert(
            version,
            self.sealing
                .seal(key.as_bytes(), &key_context(&record.owner, record.id, version))?,
        );
        record.current_version = version;
        record.updated_at = now;
        self.store.upsert_conversation(record.clone())?;
        let superseded = self.store.deactivate_bundles_before(record.id, version)?;

        let mut tasks = JoinSet::new();
        for recipient in record.participants.iter().cloned() {
            let distributor = self.clone();
            let owner = record.owner.clone();
            let key = key.clone();
            let conversation_id = record.id;
            tasks.spawn(async move {
                let result = distributor
                    .deliver(&owner, &recipient, conversation_id, version, &key)
                    .await;
                (recipient, result)
            });
        }

        let mut pending: BTreeSet<DeviceAddress> = record.participants.iter().cloned().collect();
        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((recipient, Ok(bundle))) => {
                    pending.remove(&recipient);
                    delivered.push(bundle);
                }
                Ok((recipient, Err(err))) => {
                    pending.remove(&recipient);
                    warn!(
                        target: "conversation::distributor",
                        conversation = %record.id,
                        version,
                        device = %recipient,
                        error = %err,
                        "Key delivery failed"
                    );
                    failed.push((recipient, err));
                }
                Err(join_error) => {
                    error!(
                        target: "conversation::distributor",
                        conversation = %record.id,
                        error = %join_error,
                        "Key delivery task aborted"
                    );
                }
            }
        }
        for recipient in pending {
            failed.push((
                recipient,
                ConstructError::StorageError("Key delivery task aborted".to_string()),
            ));
        }

        delivered.sort_by(|a, b| a.recipient.cmp(&b.recipient));
        failed.sort_by(|a, b| a.0.cmp(&b.0));

        info!(
            target: "conversation::distributor",
            conversation = %record.id,
            version,
            delivered = delivered.len(),
            failed = failed.len(),
            superseded,
            "Conversation key distributed"
        );

        Ok(DistributionReport {
            conversation_id: record.id,
            version,
            key,
            delivered,
            failed,
        })
    }

    async fn deliver(
        &self,
        owner: &DeviceAddress,
        recipient: &DeviceAddress,
        conversation_id: Uuid,
        version: u32,
        key: &ConversationKey,
    ) -> Result<ConversationKeyBundleRecord> {
        let session_key = SessionKey::new(owner.clone(), recipient.clone());
        {
            // Параллельные рассылки тому же устройству открывают одну сессию
            let _guard = self.sessions.lock_session(&session_key).await;
            if !self.sessions.can_send(&session_key)? {
                self.coordinator.initiate(owner, recipient).await?;
            }
        }

        let outbound = self.sessions.encrypt(&session_key, key.as_bytes()).await?;
        let session = self
            .store
            .session(&session_key, outbound.envelope.session_id)?
            .ok_or_else(|| ConstructError::NotFound(format!("Session {}", session_key)))?;

        let now = self.clock.now();
        let bundle = ConversationKeyBundleRecord {
            conversation_id,
            recipient: recipient.clone(),
            sender: owner.clone(),
            version,
            algorithm: KeyWrapAlgorithm::DoubleRatchetChaCha20Poly1305,
            wrapped_key: outbound.envelope.clone(),
            handshake: outbound.handshake,
            is_active: true,
            distributed_at: now,
            expires_at: now + Duration::seconds(self.config.conversation_key_lifetime_secs),
        };
        self.store.put_bundle(bundle.clone())?;

        let created_at = self
            .store
            .chat_key(conversation_id, recipient)?
            .map_or(now, |existing| existing.created_at);
        self.store.upsert_chat_key(ChatEncryptionKeyRecord {
            conversation_id,
            address: recipient.clone(),
            wrapped_key: to_bytes(&outbound.envelope)?,
            public_key: session.remote_identity_key,
            fingerprint: session.remote_fingerprint,
            version,
            is_active: true,
            created_at,
            updated_at: now,
            revoked_at: None,
            revocation_reason: None,
        })?;

        debug!(
            target: "conversation::distributor",
            conversation = %conversation_id,
            version,
            device = %recipient,
            "Key wrapped for device"
        );
        Ok(bundle)
    }
}
