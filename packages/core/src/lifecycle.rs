// KeyLifecycleManager: фоновая ротация prekeys и каскад отзыва устройства
//
// Каждое устройство в проходе ротации обрабатывается отдельно: ошибка на
// одном устройстве попадает в отчёт и не прерывает остальные.

use crate::config::Config;
use crate::conversation::ConversationKeyDistributor;
use crate::protocol::DeviceAddress;
use crate::registry::PreKeyStore;
use crate::session::RatchetSessions;
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::logging::{security_event, SecurityEvent};
use crate::utils::time::Clock;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Итог одного прохода ротации
#[derive(Debug, Default)]
pub struct RotationReport {
    pub devices_checked: usize,
    pub signed_prekeys_rotated: usize,
    pub one_time_prekeys_generated: usize,
    pub prekeys_purged: usize,
    pub sessions_expired: usize,
    pub failures: Vec<(DeviceAddress, ConstructError)>,
}

/// Беседа, ключ которой ротирован после отзыва устройства
#[derive(Debug, Clone)]
pub struct RotatedConversation {
    pub conversation_id: Uuid,
    pub version: u32,
    /// Участники, которым новая версия не доставлена
    pub undelivered: Vec<DeviceAddress>,
}

#[derive(Debug, Default)]
pub struct RevocationReport {
    pub identity_deactivated: bool,
    pub signed_prekeys_deactivated: usize,
    pub one_time_prekeys_invalidated: usize,
    pub sessions_revoked: usize,
    pub bundles_deactivated: usize,
    pub chat_keys_revoked: usize,
    pub conversations_rotated: Vec<RotatedConversation>,
    pub failures: Vec<(Uuid, ConstructError)>,
}

pub struct KeyLifecycleManager<S: KeyStore> {
    store: S,
    prekeys: PreKeyStore<S>,
    sessions: RatchetSessions<S>,
    distributor: ConversationKeyDistributor<S>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<S: KeyStore> KeyLifecycleManager<S> {
    pub fn new(
        store: S,
        prekeys: PreKeyStore<S>,
        sessions: RatchetSessions<S>,
        distributor: ConversationKeyDistributor<S>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            prekeys,
            sessions,
            distributor,
            clock,
            config,
        }
    }

    // ============================================
    // ROTATION
    // ============================================

    /// Один проход политики ротации по всем активным устройствам
    pub async fn run_rotation_pass(&self) -> Result<RotationReport> {
        let mut report = RotationReport::default();

        for device in self.store.active_devices()? {
            report.devices_checked += 1;
            if let Err(err) = self.maintain_device(&device, &mut report) {
                warn!(
                    target: "lifecycle",
                    device = %device,
                    error = %err,
                    "Prekey maintenance failed"
                );
                report.failures.push((device, err));
            }
        }

        report.sessions_expired = self
            .sessions
            .expire_idle(Duration::seconds(self.config.session_max_idle_secs))
            .await?;

        info!(
            target: "lifecycle",
            devices = report.devices_checked,
            signed_rotated = report.signed_prekeys_rotated,
            one_time_generated = report.one_time_prekeys_generated,
            purged = report.prekeys_purged,
            sessions_expired = report.sessions_expired,
            failures = report.failures.len(),
            "Rotation pass finished"
        );
        Ok(report)
    }

    fn maintain_device(&self, device: &DeviceAddress, report: &mut RotationReport) -> Result<()> {
        let now = self.clock.now();
        let lead = Duration::seconds(self.config.signed_prekey_rotation_lead_secs);

        let rotate = match self.store.active_signed_prekey(device)? {
            Some(active) => active.expires_at - now <= lead,
            None => true,
        };
        if rotate {
            let record = self.prekeys.rotate_signed_prekey(device)?;
            debug!(target: "lifecycle", device = %device, key_id = record.key_id, "Signed prekey rotated");
            report.signed_prekeys_rotated += 1;
        }

        let available = self.prekeys.available_one_time_prekeys(device)?;
        if available < self.config.one_time_prekey_low_water {
            let missing = self.config.one_time_prekey_batch.saturating_sub(available);
            let count = u32::try_from(missing)
                .map_err(|_| ConstructError::InvalidInput(format!("Batch size too large: {}", missing)))?;
            let generated = self.prekeys.generate_one_time_prekeys(device, count)?;
            debug!(
                target: "lifecycle",
                device = %device,
                available,
                generated = generated.len(),
                "One-time prekey pool replenished"
            );
            report.one_time_prekeys_generated += generated.len();
        }

        let (signed, one_time) = self.prekeys.purge_expired(device)?;
        report.prekeys_purged += signed + one_time;
        Ok(())
    }

    /// Фоновая ротация каждые `rotation_interval_secs` до сигнала shutdown
    ///
    /// Первый проход выполняется сразу после запуска.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(self.config.rotation_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_rotation_pass().await {
                            error!(target: "lifecycle", error = %err, "Rotation pass aborted");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(target: "lifecycle", "Background rotation stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    // ============================================
    // REVOCATION
    // ============================================

    /// Отозвать устройство и ротировать ключи всех его бесед
    ///
    /// Беседы, которые распределяет само отзываемое устройство, ротировать
    /// некому: они попадают в `failures`.
    pub async fn revoke_device(&self, device: &DeviceAddress, reason: &str) -> Result<RevocationReport> {
        let now = self.clock.now();
        let mut report = RevocationReport {
            identity_deactivated: self.store.deactivate_identity(device, reason, now)?,
            signed_prekeys_deactivated: self.store.deactivate_signed_prekeys(device)?,
            one_time_prekeys_invalidated: self.store.invalidate_one_time_prekeys(device, now)?,
            ..RevocationReport::default()
        };
        report.sessions_revoked = self.sessions.revoke_involving(device, reason).await?;
        report.bundles_deactivated = self.store.deactivate_bundles_for_device(device)?;
        report.chat_keys_revoked = self.store.revoke_chat_keys(device, reason, now)?;

        security_event(
            SecurityEvent::DeviceRevoked,
            &device.to_string(),
            &format!("{} sessions revoked: {}", report.sessions_revoked, reason),
        );

        for conversation in self.store.conversations_involving(device)? {
            if conversation.owner == *device {
                report.failures.push((
                    conversation.id,
                    ConstructError::InvalidInput(format!("Distributing device {} is revoked", device)),
                ));
                continue;
            }

            match self.distributor.remove_participant(conversation.id, device, reason).await {
                Ok(rotated) => report.conversations_rotated.push(RotatedConversation {
                    conversation_id: rotated.conversation_id,
                    version: rotated.version,
                    undelivered: rotated.failed.into_iter().map(|(device, _)| device).collect(),
                }),
                Err(err) => {
                    warn!(
                        target: "lifecycle",
                        conversation = %conversation.id,
                        error = %err,
                        "Post-revocation rotation failed"
                    );
                    report.failures.push((conversation.id, err));
                }
            }
        }

        info!(
            target: "lifecycle",
            device = %device,
            sessions = report.sessions_revoked,
            conversations = report.conversations_rotated.len(),
            failures = report.failures.len(),
            "Device revoked"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::master_key::SealingKey;
    use crate::crypto::messaging::RatchetLimits;
    use crate::protocol::SessionKey;
    use crate::registry::IdentityRegistry;
    use crate::session::{HandshakeCoordinator, LocalBundleSource};
    use crate::storage::MemoryStorage;
    use crate::utils::time::ManualClock;
    use chrono::Utc;

    struct Fixture {
        store: MemoryStorage,
        clock: ManualClock,
        identities: IdentityRegistry<MemoryStorage>,
        prekeys: PreKeyStore<MemoryStorage>,
        sessions: RatchetSessions<MemoryStorage>,
        distributor: ConversationKeyDistributor<MemoryStorage>,
        manager: KeyLifecycleManager<MemoryStorage>,
    }

    fn fixture(config: Config) -> Fixture {
        let store = MemoryStorage::new();
        let sealing = SealingKey::generate().unwrap();
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let config = Arc::new(config);
        let identities = IdentityRegistry::new(store.clone(), sealing.clone(), shared_clock.clone(), config.clone());
        let prekeys = PreKeyStore::new(
            store.clone(),
            identities.clone(),
            sealing.clone(),
            shared_clock.clone(),
            config.clone(),
        );
        let coordinator = HandshakeCoordinator::new(
            store.clone(),
            identities.clone(),
            prekeys.clone(),
            Arc::new(LocalBundleSource::new(prekeys.clone())),
            sealing.clone(),
            shared_clock.clone(),
            config.clone(),
        );
        let sessions = RatchetSessions::new(
            store.clone(),
            sealing.clone(),
            shared_clock.clone(),
            RatchetLimits::from_config(&config),
        );
        let distributor = ConversationKeyDistributor::new(
            store.clone(),
            coordinator,
            sessions.clone(),
            sealing,
            shared_clock.clone(),
            config.clone(),
        );
        let manager = KeyLifecycleManager::new(
            store.clone(),
            prekeys.clone(),
            sessions.clone(),
            distributor.clone(),
            shared_clock,
            config,
        );

        Fixture {
            store,
            clock,
            identities,
            prekeys,
            sessions,
            distributor,
            manager,
        }
    }

    fn small_pool() -> Config {
        Config {
            one_time_prekey_low_water: 2,
            one_time_prekey_batch: 5,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_rotation_pass_bootstraps_device() {
        let f = fixture(small_pool());
        let device = DeviceAddress::new("alice", "phone");
        f.identities.create_identity(&device, false).unwrap();

        let report = f.manager.run_rotation_pass().await.unwrap();
        assert_eq!(report.devices_checked, 1);
        assert_eq!(report.signed_prekeys_rotated, 1);
        assert_eq!(report.one_time_prekeys_generated, 5);
        assert!(report.failures.is_empty());

        // Повторный проход ничего не меняет
        let again = f.manager.run_rotation_pass().await.unwrap();
        assert_eq!(again.signed_prekeys_rotated, 0);
        assert_eq!(again.one_time_prekeys_generated, 0);
    }

    #[tokio::test]
    async fn test_signed_prekey_rotated_within_lead_time() {
        let f = fixture(small_pool());
        let device = DeviceAddress::new("alice", "phone");
        f.identities.create_identity(&device, false).unwrap();
        let first = f.prekeys.rotate_signed_prekey(&device).unwrap();

        f.clock.advance(Duration::days(29));
        let report = f.manager.run_rotation_pass().await.unwrap();
        assert_eq!(report.signed_prekeys_rotated, 1);

        let active = f.prekeys.active_signed_prekey(&device).unwrap().unwrap();
        assert!(active.key_id > first.key_id);
    }

    #[tokio::test]
    async fn test_low_water_replenishes_to_batch() {
        let f = fixture(small_pool());
        let device = DeviceAddress::new("alice", "phone");
        f.identities.create_identity(&device, false).unwrap();
        f.prekeys.rotate_signed_prekey(&device).unwrap();
        f.prekeys.generate_one_time_prekeys(&device, 1).unwrap();

        let report = f.manager.run_rotation_pass().await.unwrap();
        assert_eq!(report.one_time_prekeys_generated, 4);
        assert_eq!(f.prekeys.available_one_time_prekeys(&device).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_revoke_device_cascades() {
        let f = fixture(Config::default());
        let owner = DeviceAddress::new("alice", "phone");
        let bob = DeviceAddress::new("bob", "laptop");
        let mallory = DeviceAddress::new("bob", "lost-phone");
        for device in [&owner, &bob, &mallory] {
            f.identities.create_identity(device, false).unwrap();
            f.prekeys.rotate_signed_prekey(device).unwrap();
            f.prekeys.generate_one_time_prekeys(device, 3).unwrap();
        }

        let conversation_id = Uuid::new_v4();
        let distributed = f
            .distributor
            .distribute_key(&owner, conversation_id, vec![bob.clone(), mallory.clone()])
            .await
            .unwrap();
        assert!(distributed.is_complete());

        let report = f.manager.revoke_device(&mallory, "device lost").await.unwrap();
        assert!(report.identity_deactivated);
        assert_eq!(report.sessions_revoked, 1);
        assert_eq!(report.chat_keys_revoked, 1);
        assert_eq!(report.conversations_rotated.len(), 1);
        assert_eq!(report.conversations_rotated[0].version, 2);
        assert!(report.conversations_rotated[0].undelivered.is_empty());

        let to_mallory = SessionKey::new(owner.clone(), mallory.clone());
        let send = f.sessions.encrypt(&to_mallory, b"after revoke").await;
        assert!(matches!(send, Err(ConstructError::SessionRevoked(_))));

        let chat_key = f.store.chat_key(conversation_id, &mallory).unwrap().unwrap();
        assert!(!chat_key.is_active);
        assert_eq!(chat_key.revocation_reason.as_deref(), Some("device lost"));

        let conversation = f.store.conversation(conversation_id).unwrap().unwrap();
        assert_eq!(conversation.participants, vec![bob.clone()]);
        assert!(f.identities.get_identity(&mallory).is_err());
    }

    #[tokio::test]
    async fn test_revoking_distributor_reports_owned_conversations() {
        let f = fixture(Config::default());
        let owner = DeviceAddress::new("alice", "phone");
        let bob = DeviceAddress::new("bob", "laptop");
        for device in [&owner, &bob] {
            f.identities.create_identity(device, false).unwrap();
            f.prekeys.rotate_signed_prekey(device).unwrap();
        }
        let conversation_id = Uuid::new_v4();
        f.distributor
            .distribute_key(&owner, conversation_id, vec![bob.clone()])
            .await
            .unwrap();

        let report = f.manager.revoke_device(&owner, "compromised").await.unwrap();
        assert!(report.conversations_rotated.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, conversation_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_rotation_stops_on_shutdown() {
        let f = fixture(small_pool());
        let device = DeviceAddress::new("alice", "phone");
        f.identities.create_identity(&device, false).unwrap();

        let manager = Arc::new(f.manager);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = manager.spawn(shutdown_rx);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(f.prekeys.available_one_time_prekeys(&device).unwrap(), 5);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
