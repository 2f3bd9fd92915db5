// Модели данных для хранилища
//
// Все приватные ключи, ratchet state и shared secrets хранятся только в виде
// sealed blob'ов (см. crypto::master_key::SealingKey).

use crate::crypto::quantum::QuantumAlgorithm;
use crate::protocol::{DeviceAddress, InitialMessage, RatchetEnvelope, SessionKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Квантовый материал identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumIdentityKey {
    pub algorithm: QuantumAlgorithm,
    pub version: u32,
    pub public_key: Vec<u8>,
    /// Подпись identity signing key над `public_key`
    pub signature: Vec<u8>,
    pub sealed_private_key: Vec<u8>,
}

/// Identity ключ устройства
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityKeyRecord {
    pub address: DeviceAddress,
    /// Монотонно растёт при каждой ротации identity на устройстве
    pub registration_id: u32,
    /// X25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 verifying key
    pub signing_public_key: Vec<u8>,
    pub sealed_private_key: Vec<u8>,
    pub sealed_signing_key: Vec<u8>,
    pub fingerprint: String,
    pub quantum: Option<QuantumIdentityKey>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl IdentityKeyRecord {
    pub fn quantum_capable(&self) -> bool {
        self.quantum.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub address: DeviceAddress,
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub sealed_private_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedPreKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub address: DeviceAddress,
    pub key_id: u32,
    pub public_key: Vec<u8>,
    /// `None` после того как получатель стёр приватный ключ при accept
    pub sealed_private_key: Option<Vec<u8>>,
    /// `None` = не использован
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OneTimePreKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && !self.is_expired(now)
    }
}

/// Результат инкапсуляции/декапсуляции: ciphertext и shared secret
/// появляются в записи только вместе
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncapsulationCompletion {
    pub ciphertext: Vec<u8>,
    pub sealed_shared_secret: Vec<u8>,
    pub established_at: DateTime<Utc>,
}

/// Квантовая инкапсуляция, привязанная к сессии
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumEncapsulationRecord {
    pub session_id: Uuid,
    /// Устройство, которому принадлежит эта копия записи
    pub owner: DeviceAddress,
    pub algorithm: QuantumAlgorithm,
    pub version: u32,
    /// Публичный ключ, под который выполнена инкапсуляция
    pub public_key: Vec<u8>,
    /// Приватный ключ получателя (sealed); у инициатора отсутствует
    pub sealed_private_key: Option<Vec<u8>>,
    pub completion: Option<EncapsulationCompletion>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Состояние ratchet сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    /// Handshake завершён, сообщений ещё не было
    Established,
    /// Сессия хотя бы раз шифровала или расшифровывала
    Active,
    /// Отправка запрещена, расшифровка уже полученного разрешена
    Revoked,
}

impl SessionState {
    /// Допустимые переходы: Uninitialized → Established → Active → Revoked,
    /// Revoked достижим из любого состояния
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Established)
                | (Established, Active)
                | (Active, Active)
                | (_, Revoked)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Ratchet сессия для упорядоченного 4-tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Общий для обеих сторон id (из InitialMessage)
    pub session_id: Uuid,
    pub key: SessionKey,
    pub role: SessionRole,
    pub state: SessionState,
    /// bincode(SerializableSession), sealed
    pub sealed_state: Vec<u8>,
    /// Snapshot identity собеседника на момент создания
    pub remote_identity_key: Vec<u8>,
    pub remote_fingerprint: String,
    pub remote_registration_id: u32,
    /// Сообщений зашифровано + расшифровано
    pub message_counter: u64,
    pub is_active: bool,
    /// Handshake, который инициатор прикладывает, пока не получит ответ
    pub pending_handshake: Option<InitialMessage>,
    /// Handshake без one-time prekey
    pub reduced_security: bool,
    pub hybrid: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl SessionRecord {
    pub fn is_revoked(&self) -> bool {
        self.state == SessionState::Revoked
    }

    /// Перевести в Revoked. Возвращает false, если сессия уже отозвана.
    pub fn revoke(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.is_revoked() {
            return false;
        }
        self.state = SessionState::Revoked;
        self.is_active = false;
        self.pending_handshake = None;
        self.revoked_at = Some(at);
        self.revocation_reason = Some(reason.to_string());
        true
    }
}

/// Алгоритм, которым обёрнут ключ беседы
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyWrapAlgorithm {
    /// Ratchet message key + ChaCha20-Poly1305
    DoubleRatchetChaCha20Poly1305,
}

/// Копия ключа беседы для одного устройства-получателя
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationKeyBundleRecord {
    pub conversation_id: Uuid,
    pub recipient: DeviceAddress,
    /// Устройство, чьей сессией обёрнут ключ
    pub sender: DeviceAddress,
    pub version: u32,
    pub algorithm: KeyWrapAlgorithm,
    pub wrapped_key: RatchetEnvelope,
    /// Handshake, если bundle открыл новую сессию
    pub handshake: Option<InitialMessage>,
    pub is_active: bool,
    pub distributed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Device-scoped ключ беседы
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEncryptionKeyRecord {
    pub conversation_id: Uuid,
    pub address: DeviceAddress,
    /// bincode(RatchetEnvelope) текущей версии
    pub wrapped_key: Vec<u8>,
    /// Identity public key устройства на момент выдачи
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    pub version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

/// Беседа с точки зрения распределяющего устройства
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    /// Устройство, которое распределяет ключи
    pub owner: DeviceAddress,
    pub participants: Vec<DeviceAddress>,
    /// 0, пока ключ ни разу не распределялся
    pub current_version: u32,
    /// Sealed копии ключа по версиям (для retry и истории)
    pub sealed_keys: BTreeMap<u32, Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;
        assert!(Uninitialized.can_transition_to(Established));
        assert!(Established.can_transition_to(Active));
        assert!(Active.can_transition_to(Revoked));
        assert!(Established.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Active));
        assert!(!Uninitialized.can_transition_to(Active));
    }

    #[test]
    fn test_one_time_prekey_availability() {
        let now = Utc::now();
        let mut record = OneTimePreKeyRecord {
            address: DeviceAddress::new("bob", "laptop"),
            key_id: 1,
            public_key: vec![0u8; 32],
            sealed_private_key: Some(vec![1u8; 60]),
            used_at: None,
            created_at: now,
            expires_at: Some(now + chrono::Duration::days(1)),
        };
        assert!(record.is_available(now));
        assert!(!record.is_available(now + chrono::Duration::days(2)));

        record.used_at = Some(now);
        assert!(!record.is_available(now));
    }
}
