// Симметричный ключ беседы и шифрование сообщений беседы
// ChaCha20-Poly1305, AAD = conversation_id || version (big-endian)

use crate::crypto::{CryptoProvider, Suite};
use crate::error::CryptoError;
use crate::utils::error::{ConstructError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const CONVERSATION_KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Ключ беседы одной версии
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

impl ConversationKey {
    pub fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new(vec![0u8; CONVERSATION_KEY_LENGTH]);
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(CryptoError::from)?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONVERSATION_KEY_LENGTH {
            return Err(ConstructError::InvalidInput(format!(
                "Invalid conversation key length: {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes.to_vec()),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encrypt(&self, conversation_id: Uuid, version: u32, plaintext: &[u8]) -> Result<ConversationCiphertext> {
        let nonce = Suite::generate_nonce(NONCE_LENGTH)?;
        let aad = associated_data(conversation_id, version);
        let ciphertext = Suite::aead_encrypt(&self.bytes, &nonce, plaintext, Some(&aad))?;
        Ok(ConversationCiphertext {
            conversation_id,
            version,
            nonce,
            ciphertext,
        })
    }

    pub fn decrypt(&self, message: &ConversationCiphertext) -> Result<Vec<u8>> {
        let aad = associated_data(message.conversation_id, message.version);
        Ok(Suite::aead_decrypt(
            &self.bytes,
            &message.nonce,
            &message.ciphertext,
            Some(&aad),
        )?)
    }
}

fn associated_data(conversation_id: Uuid, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 4);
    aad.extend_from_slice(conversation_id.as_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Сообщение беседы, зашифрованное ключом версии `version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCiphertext {
    pub conversation_id: Uuid,
    pub version: u32,
    #[serde(with = "crate::utils::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::utils::b64")]
    pub ciphertext: Vec<u8>,
}

/// Все известные устройству версии ключа беседы
///
/// Новые сообщения шифруются только последней версией; старые версии
/// остаются для расшифровки истории.
#[derive(Debug, Clone)]
pub struct ConversationKeyring {
    conversation_id: Uuid,
    keys: BTreeMap<u32, ConversationKey>,
}

impl ConversationKeyring {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            keys: BTreeMap::new(),
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn insert(&mut self, version: u32, key: ConversationKey) {
        self.keys.insert(version, key);
    }

    pub fn current_version(&self) -> Option<u32> {
        self.keys.keys().next_back().copied()
    }

    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<ConversationCiphertext> {
        let (version, key) = self
            .keys
            .iter()
            .next_back()
            .ok_or_else(|| ConstructError::NotFound(format!("Key for conversation {}", self.conversation_id)))?;
        key.encrypt(self.conversation_id, *version, plaintext)
    }

    /// # Errors
    /// `NotFound` если версия сообщения неизвестна устройству
    pub fn decrypt(&self, message: &ConversationCiphertext) -> Result<Vec<u8>> {
        if message.conversation_id != self.conversation_id {
            return Err(ConstructError::InvalidInput(format!(
                "Message for conversation {}, keyring for {}",
                message.conversation_id, self.conversation_id
            )));
        }
        let key = self.keys.get(&message.version).ok_or_else(|| {
            ConstructError::NotFound(format!(
                "Key version {} for conversation {}",
                message.version, self.conversation_id
            ))
        })?;
        key.decrypt(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_version_is_authenticated() {
        let conversation_id = Uuid::new_v4();
        let key = ConversationKey::generate().unwrap();
        let mut message = key.encrypt(conversation_id, 1, b"group hello").unwrap();
        assert_eq!(key.decrypt(&message).unwrap(), b"group hello");

        message.version = 2;
        assert!(matches!(key.decrypt(&message), Err(ConstructError::CryptoError(_))));
    }

    #[test]
    fn test_keyring_decrypts_history() {
        let conversation_id = Uuid::new_v4();
        let mut keyring = ConversationKeyring::new(conversation_id);
        keyring.insert(1, ConversationKey::generate().unwrap());
        let old = keyring.encrypt(b"v1 message").unwrap();

        keyring.insert(2, ConversationKey::generate().unwrap());
        let new = keyring.encrypt(b"v2 message").unwrap();

        assert_eq!(old.version, 1);
        assert_eq!(new.version, 2);
        assert_eq!(keyring.decrypt(&old).unwrap(), b"v1 message");
        assert_eq!(keyring.decrypt(&new).unwrap(), b"v2 message");
    }

    #[test]
    fn test_older_keyring_cannot_read_newer_version() {
        let conversation_id = Uuid::new_v4();
        let v1 = ConversationKey::generate().unwrap();
        let v2 = ConversationKey::generate().unwrap();

        let mut old_keyring = ConversationKeyring::new(conversation_id);
        old_keyring.insert(1, v1.clone());
        let message = v2.encrypt(conversation_id, 2, b"secret").unwrap();

        assert!(matches!(old_keyring.decrypt(&message), Err(ConstructError::NotFound(_))));

        // Даже подставив версию, ключ v1 не открывает сообщение v2
        let forced = ConversationCiphertext { version: 1, ..message };
        assert!(v1.decrypt(&forced).is_err());
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        assert!(ConversationKey::from_bytes(&[0u8; 16]).is_err());
    }
}
