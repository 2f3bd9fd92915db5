// RatchetSessions: продвижение Double Ratchet состояния
//
// Каждое шифрование / расшифровка выполняется под мьютексом своего 4-tuple:
// read state → advance → write state не перемежаются для одной сессии,
// разные сессии идут параллельно.

use crate::crypto::master_key::SealingKey;
use crate::crypto::messaging::{RatchetLimits, SecureMessaging};
use crate::protocol::{DeviceAddress, InitialMessage, RatchetEnvelope, SessionKey};
use crate::session::{open_state, seal_state};
use crate::storage::models::{SessionRecord, SessionRole, SessionState};
use crate::storage::KeyStore;
use crate::utils::error::{ConstructError, Result};
use crate::utils::logging::{security_event, SecurityEvent};
use crate::utils::time::Clock;
use chrono::Duration;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};
use uuid::Uuid;

/// Исходящее сообщение
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub envelope: RatchetEnvelope,
    /// InitialMessage, который инициатор прикладывает, пока не получил ответ
    pub handshake: Option<InitialMessage>,
}

/// Реестр ratchet сессий
#[derive(Clone)]
pub struct RatchetSessions<S: KeyStore> {
    store: S,
    sealing: SealingKey,
    clock: Arc<dyn Clock>,
    limits: RatchetLimits,
    locks: Arc<DashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl<S: KeyStore> RatchetSessions<S> {
    pub fn new(store: S, sealing: SealingKey, clock: Arc<dyn Clock>, limits: RatchetLimits) -> Self {
        Self {
            store,
            sealing,
            clock,
            limits,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Удерживать 4-tuple вне encrypt / decrypt, например на время handshake
    ///
    /// Guard нужно отпустить до `encrypt` / `decrypt` того же tuple.
    pub async fn lock_session(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        self.lock_for(key).lock_owned().await
    }

    /// Активная сессия, иначе последняя созданная (возможно отозванная)
    fn current(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        match self.store.active_session(key)? {
            Some(record) => Ok(Some(record)),
            None => Ok(self.store.sessions_for(key)?.pop()),
        }
    }

    /// Состояние сессии 4-tuple; `Uninitialized` если handshake не выполнялся
    pub fn state(&self, key: &SessionKey) -> Result<SessionState> {
        Ok(self
            .current(key)?
            .map_or(SessionState::Uninitialized, |record| record.state))
    }

    /// Есть ли сессия, готовая к отправке
    pub fn can_send(&self, key: &SessionKey) -> Result<bool> {
        Ok(matches!(
            self.state(key)?,
            SessionState::Established | SessionState::Active
        ))
    }

    pub fn has_session(&self, key: &SessionKey, session_id: Uuid) -> Result<bool> {
        Ok(self.store.session(key, session_id)?.is_some())
    }

    /// Зашифровать сообщение текущей сессией
    ///
    /// # Errors
    /// - `NotFound`: handshake не выполнялся
    /// - `SessionRevoked`: сессия отозвана, нужен новый handshake
    pub async fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<OutboundMessage> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut record = self
            .current(key)?
            .ok_or_else(|| ConstructError::NotFound(format!("Session {}", key)))?;
        if record.is_revoked() {
            debug!(target: "session::ratchet", session = %key, "Send attempt on revoked session");
            return Err(ConstructError::SessionRevoked(key.to_string()));
        }

        let mut session = open_state(&self.sealing, &record, self.limits)?;
        let message = session.encrypt(plaintext)?;

        record.state = SessionState::Active;
        record.message_counter += 1;
        record.last_used_at = self.clock.now();
        record.sealed_state = seal_state(&self.sealing, key, record.session_id, &session)?;
        let session_id = record.session_id;
        let handshake = record.pending_handshake.clone();
        self.store.update_session(record)?;

        trace!(
            target: "session::ratchet",
            session = %key,
            message_number = message.message_number,
            "Message encrypted"
        );

        Ok(OutboundMessage {
            envelope: RatchetEnvelope { session_id, message },
            handshake,
        })
    }

    /// Расшифровать сообщение сессией, указанной в envelope
    ///
    /// Отозванная сессия расшифровывает только сообщения, ключи которых были
    /// выведены до отзыва (skipped keys). Всё, что требует продвинуть цепочку
    /// или DH ratchet, отклоняется с `SessionRevoked`.
    /// При ошибке сохранённое состояние не меняется.
    pub async fn decrypt(&self, key: &SessionKey, envelope: &RatchetEnvelope) -> Result<Vec<u8>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .session(key, envelope.session_id)?
            .ok_or_else(|| ConstructError::NotFound(format!("Session {} for {}", envelope.session_id, key)))?;

        let mut session = open_state(&self.sealing, &record, self.limits)?;
        let now = self.clock.now();
        let decrypted = if record.is_revoked() {
            session
                .decrypt_cached_at(&envelope.message, now.timestamp())
                .and_then(|cached| {
                    cached.ok_or_else(|| {
                        security_event(
                            SecurityEvent::SessionRevoked,
                            &key.local.to_string(),
                            &format!(
                                "new message {} on revoked session {} from {}",
                                envelope.message.message_number, envelope.session_id, key.remote
                            ),
                        );
                        ConstructError::SessionRevoked(key.to_string())
                    })
                })
        } else {
            session.decrypt_at(&envelope.message, now.timestamp())
        };
        let plaintext = match decrypted {
            Ok(plaintext) => plaintext,
            Err(err) => {
                if matches!(err, ConstructError::ReplayOrExpiredKey(_)) {
                    security_event(
                        SecurityEvent::ReplayDetected,
                        &key.local.to_string(),
                        &format!("session {} from {}: {}", envelope.session_id, key.remote, err),
                    );
                }
                return Err(err);
            }
        };

        if !record.is_revoked() {
            record.state = SessionState::Active;
        }
        if record.role == SessionRole::Initiator {
            // Собеседник ответил, значит handshake доставлен
            record.pending_handshake = None;
        }
        record.message_counter += 1;
        record.last_used_at = now;
        record.sealed_state = seal_state(&self.sealing, key, record.session_id, &session)?;
        self.store.update_session(record)?;

        Ok(plaintext)
    }

    /// Отозвать все сессии 4-tuple. Возвращает количество отозванных.
    pub async fn revoke(&self, key: &SessionKey, reason: &str) -> Result<usize> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let mut revoked = 0;
        for mut record in self.store.sessions_for(key)? {
            if record.revoke(reason, now) {
                self.store.deactivate_encapsulations(record.session_id)?;
                self.store.update_session(record)?;
                revoked += 1;
            }
        }

        if revoked > 0 {
            security_event(
                SecurityEvent::SessionRevoked,
                &key.local.to_string(),
                &format!("{} sessions with {}: {}", revoked, key.remote, reason),
            );
        }
        Ok(revoked)
    }

    /// Отозвать все сессии, где устройство local или remote
    pub async fn revoke_involving(&self, address: &DeviceAddress, reason: &str) -> Result<usize> {
        let keys: BTreeSet<SessionKey> = self
            .store
            .sessions_involving(address)?
            .into_iter()
            .filter(|record| !record.is_revoked())
            .map(|record| record.key)
            .collect();

        let mut revoked = 0;
        for key in keys {
            revoked += self.revoke(&key, reason).await?;
        }
        Ok(revoked)
    }

    /// Отозвать сессии без активности дольше `max_idle`
    pub async fn expire_idle(&self, max_idle: Duration) -> Result<usize> {
        let cutoff = self.clock.now() - max_idle;
        let keys: BTreeSet<SessionKey> = self
            .store
            .all_sessions()?
            .into_iter()
            .filter(|record| record.is_active && !record.is_revoked() && record.last_used_at <= cutoff)
            .map(|record| record.key)
            .collect();

        let mut expired = 0;
        for key in keys {
            expired += self.revoke(&key, "idle").await?;
        }
        Ok(expired)
    }
}
