// Типы payload'ов, которые ядро отдаёт collaborator'ам
// JSON (camelCase), байтовые поля в Base64

use crate::crypto::messaging::EncryptedRatchetMessage;
use crate::crypto::quantum::QuantumAlgorithm;
use crate::crypto::SuiteID;
use crate::utils::error::Result;
use crate::utils::serialization::{from_json, to_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Адрес устройства: (user, device)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// AAD для sealing записей этого устройства: `user:device#label`
    pub fn context(&self, label: &str) -> Vec<u8> {
        format!("{}#{}", self, label).into_bytes()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.device_id)
    }
}

/// Упорядоченный 4-tuple сессии: (local user, local device, remote user, remote device)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub local: DeviceAddress,
    pub remote: DeviceAddress,
}

impl SessionKey {
    pub fn new(local: DeviceAddress, remote: DeviceAddress) -> Self {
        Self { local, remote }
    }

    /// Тот же канал с точки зрения собеседника
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }

    pub fn involves(&self, address: &DeviceAddress) -> bool {
        self.local == *address || self.remote == *address
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "crate::utils::b64")]
    pub public_key: Vec<u8>,
}

/// Опубликованный ML-KEM ключ, подписанный identity signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantumPreKeyPublic {
    pub algorithm: QuantumAlgorithm,
    pub version: u32,
    #[serde(with = "crate::utils::b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::utils::b64")]
    pub signature: Vec<u8>,
}

/// Prekey bundle: read-only payload для инициатора handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub address: DeviceAddress,
    pub registration_id: u32,
    /// X25519 identity public key
    #[serde(with = "crate::utils::b64")]
    pub identity_key: Vec<u8>,
    /// Ed25519 verifying key
    #[serde(with = "crate::utils::b64")]
    pub signing_key: Vec<u8>,
    pub signed_prekey_id: u32,
    #[serde(with = "crate::utils::b64")]
    pub signed_prekey: Vec<u8>,
    #[serde(with = "crate::utils::b64")]
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_expires_at: DateTime<Utc>,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
    pub quantum: Option<QuantumPreKeyPublic>,
    pub suite_id: SuiteID,
}

impl PreKeyBundle {
    pub fn to_json(&self) -> Result<String> {
        to_json(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        from_json(json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantumCiphertext {
    pub algorithm: QuantumAlgorithm,
    pub version: u32,
    #[serde(with = "crate::utils::b64")]
    pub ciphertext: Vec<u8>,
}

/// Первое сообщение handshake от инициатора к получателю
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialMessage {
    pub session_id: Uuid,
    pub initiator: DeviceAddress,
    pub responder: DeviceAddress,
    pub registration_id: u32,
    /// IK_A
    #[serde(with = "crate::utils::b64")]
    pub identity_key: Vec<u8>,
    #[serde(with = "crate::utils::b64")]
    pub signing_key: Vec<u8>,
    /// EK_A
    #[serde(with = "crate::utils::b64")]
    pub ephemeral_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub quantum: Option<QuantumCiphertext>,
    pub suite_id: SuiteID,
}

impl InitialMessage {
    pub fn to_json(&self) -> Result<String> {
        to_json(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        from_json(json)
    }
}

/// Ratchet ciphertext с id сессии, которой он зашифрован
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetEnvelope {
    pub session_id: Uuid,
    pub message: EncryptedRatchetMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_reversed() {
        let key = SessionKey::new(DeviceAddress::new("alice", "phone"), DeviceAddress::new("bob", "laptop"));
        let reversed = key.reversed();
        assert_eq!(reversed.local, key.remote);
        assert_eq!(reversed.reversed(), key);
        assert!(key.involves(&DeviceAddress::new("bob", "laptop")));
        assert_eq!(key.to_string(), "alice:phone -> bob:laptop");
    }

    #[test]
    fn test_bundle_json_uses_base64() {
        let bundle = PreKeyBundle {
            address: DeviceAddress::new("bob", "laptop"),
            registration_id: 1,
            identity_key: vec![1u8; 32],
            signing_key: vec![2u8; 32],
            signed_prekey_id: 1,
            signed_prekey: vec![3u8; 32],
            signed_prekey_signature: vec![4u8; 64],
            signed_prekey_expires_at: Utc::now(),
            one_time_prekey: Some(OneTimePreKeyPublic {
                key_id: 9,
                public_key: vec![5u8; 32],
            }),
            quantum: None,
            suite_id: 1,
        };

        let json = bundle.to_json().unwrap();
        assert!(json.contains("\"identityKey\":\"AQEB"));
        assert!(json.contains("\"keyId\":9"));
        assert_eq!(PreKeyBundle::from_json(&json).unwrap(), bundle);
    }
}
