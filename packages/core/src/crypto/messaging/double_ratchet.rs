//! Double Ratchet Protocol Implementation
//!
//! ## Архитектура
//!
//! Double Ratchet состоит из двух ratchets:
//! 1. **DH Ratchet**: ротация DH ключей при каждой смене направления
//! 2. **Symmetric Ratchet**: ротация chain keys для каждого сообщения
//!
//! ## Skipped Message Keys
//!
//! Ключи пропущенных сообщений индексируются парой `(dh_public, message_number)`,
//! поэтому сообщения из предыдущей цепочки (до DH ratchet step) тоже расшифровываются.
//! - Окно пропуска: не больше `max_skipped_messages` ключей за один шаг
//! - Общий лимит: при переполнении вытесняется самый старый ключ
//! - Возраст: ключи старше `max_skipped_age_secs` удаляются
//!
//! ## Dataflow Example
//!
//! ```text
//! Alice                                    Bob
//! -----                                    ---
//! new_initiator_session(root, EK_A, SPK_B)  new_responder_session(root, SPK_B, EK_A)
//!   ↓                                        ↓
//! DH(EK_A, SPK_B) → sending_chain          DH(SPK_B, EK_A) → receiving_chain
//!                                          DH(B1, EK_A)    → sending_chain
//! encrypt(msg1) →                      →  decrypt(msg1) ✅
//!                                      ←   encrypt(msg2) with B1
//! DH Ratchet Step! (Alice sees B1)
//!   ↓
//! decrypt(msg2) ✅
//! ```

use crate::config::Config;
use crate::crypto::handshake::InitiatorState;
use crate::crypto::messaging::SecureMessaging;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::SuiteID;
use crate::utils::error::{ConstructError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Сколько предыдущих remote ratchet keys помнить для детекции replay
const MAX_RETIRED_CHAINS: usize = 32;

/// Лимиты на skipped message keys (DoS защита)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    pub max_skipped_messages: u32,
    pub max_skipped_age_secs: i64,
}

impl RatchetLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_skipped_messages: config.max_skipped_messages,
            max_skipped_age_secs: config.max_skipped_message_age_seconds,
        }
    }
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self::from_config(Config::global())
    }
}

struct SkippedKey<P: CryptoProvider> {
    key: P::AeadKey,
    stored_at: i64,
    seq: u64,
}

impl<P: CryptoProvider> Clone for SkippedKey<P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            stored_at: self.stored_at,
            seq: self.seq,
        }
    }
}

/// Double Ratchet Session
///
/// Хранит состояние Double Ratchet для одной пары устройств.
///
/// ### Root Key
/// - Обновляется при каждом DH ratchet step
///
/// ### Chain Keys
/// - `sending_chain_key`: для исходящих сообщений
/// - `receiving_chain_key`: для входящих; у инициатора пуст до первого ответа
///
/// ### DH Ratchet Keys
/// - `dh_ratchet_private` / `dh_ratchet_public`: наш текущий ключ
/// - `remote_dh_public`: последний известный ключ собеседника
pub struct DoubleRatchetSession<P: CryptoProvider> {
    suite_id: SuiteID,
    root_key: P::AeadKey,

    sending_chain_key: P::AeadKey,
    sending_chain_length: u32,

    receiving_chain_key: Option<P::AeadKey>,
    receiving_chain_length: u32,

    dh_ratchet_private: P::KemPrivateKey,
    dh_ratchet_public: P::KemPublicKey,
    remote_dh_public: P::KemPublicKey,

    previous_sending_length: u32,
    skipped_message_keys: HashMap<(Vec<u8>, u32), SkippedKey<P>>,
    next_skip_seq: u64,
    retired_remote_dh: VecDeque<Vec<u8>>,

    limits: RatchetLimits,
    session_id: String,
}

impl<P: CryptoProvider> Clone for DoubleRatchetSession<P> {
    fn clone(&self) -> Self {
        Self {
            suite_id: self.suite_id,
            root_key: self.root_key.clone(),
            sending_chain_key: self.sending_chain_key.clone(),
            sending_chain_length: self.sending_chain_length,
            receiving_chain_key: self.receiving_chain_key.clone(),
            receiving_chain_length: self.receiving_chain_length,
            dh_ratchet_private: self.dh_ratchet_private.clone(),
            dh_ratchet_public: self.dh_ratchet_public.clone(),
            remote_dh_public: self.remote_dh_public.clone(),
            previous_sending_length: self.previous_sending_length,
            skipped_message_keys: self.skipped_message_keys.clone(),
            next_skip_seq: self.next_skip_seq,
            retired_remote_dh: self.retired_remote_dh.clone(),
            limits: self.limits,
            session_id: self.session_id.clone(),
        }
    }
}

/// Encrypted message in wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRatchetMessage {
    pub dh_public_key: [u8; 32],
    pub message_number: u32,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub previous_chain_length: u32,
    pub suite_id: u16,
}

impl EncryptedRatchetMessage {
    /// Associated Data: dh_public_key || message_number || previous_chain_length
    fn associated_data(&self) -> Vec<u8> {
        let mut associated_data = Vec::with_capacity(32 + 4 + 4);
        associated_data.extend_from_slice(&self.dh_public_key);
        associated_data.extend_from_slice(&self.message_number.to_be_bytes());
        associated_data.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        associated_data
    }
}

impl<P: CryptoProvider> SecureMessaging<P> for DoubleRatchetSession<P> {
    type EncryptedMessage = EncryptedRatchetMessage;

    fn new_initiator_session(
        root_key: &[u8],
        initiator_state: InitiatorState<P>,
        remote_ratchet_public: &[u8],
        session_id: String,
    ) -> Result<Self> {
        debug!(
            target: "crypto::double_ratchet",
            session_id = %session_id,
            "Creating initiator session"
        );

        let root_key_val = Self::initial_root_key(root_key)?;

        // X3DH ephemeral key как первый DH ratchet key
        let dh_private = initiator_state.ephemeral_private;
        let dh_public = P::from_private_key_to_public_key(&dh_private)?;
        let remote_dh_public = P::kem_public_key_from_bytes(remote_ratchet_public.to_vec());

        // DH(EK_A, SPK_B) → sending_chain
        let dh_output = P::dh(&dh_private, remote_dh_public.as_ref())?;
        let (root_key, sending_chain) = P::kdf_rk(&root_key_val, &dh_output)?;

        Ok(Self {
            suite_id: P::suite_id(),
            root_key,
            sending_chain_key: sending_chain,
            sending_chain_length: 0,
            receiving_chain_key: None,
            receiving_chain_length: 0,
            dh_ratchet_private: dh_private,
            dh_ratchet_public: dh_public,
            remote_dh_public,
            previous_sending_length: 0,
            skipped_message_keys: HashMap::new(),
            next_skip_seq: 0,
            retired_remote_dh: VecDeque::new(),
            limits: RatchetLimits::default(),
            session_id,
        })
    }

    fn new_responder_session(
        root_key: &[u8],
        local_ratchet_private: P::KemPrivateKey,
        remote_ephemeral_public: &[u8],
        session_id: String,
    ) -> Result<Self> {
        debug!(
            target: "crypto::double_ratchet",
            session_id = %session_id,
            "Creating responder session"
        );

        let root_key_val = Self::initial_root_key(root_key)?;
        let remote_dh_public = P::kem_public_key_from_bytes(remote_ephemeral_public.to_vec());

        // DH(SPK_B, EK_A) → receiving_chain
        let dh_receive = P::dh(&local_ratchet_private, remote_dh_public.as_ref())?;
        let (root_key_val, receiving_chain) = P::kdf_rk(&root_key_val, &dh_receive)?;

        // Новая DH пара для ответа
        let (dh_private, dh_public) = P::generate_kem_keys()?;
        let dh_send = P::dh(&dh_private, remote_dh_public.as_ref())?;
        let (root_key_val, sending_chain) = P::kdf_rk(&root_key_val, &dh_send)?;

        Ok(Self {
            suite_id: P::suite_id(),
            root_key: root_key_val,
            sending_chain_key: sending_chain,
            sending_chain_length: 0,
            receiving_chain_key: Some(receiving_chain),
            receiving_chain_length: 0,
            dh_ratchet_private: dh_private,
            dh_ratchet_public: dh_public,
            remote_dh_public,
            previous_sending_length: 0,
            skipped_message_keys: HashMap::new(),
            next_skip_seq: 0,
            retired_remote_dh: VecDeque::new(),
            limits: RatchetLimits::default(),
            session_id,
        })
    }

    /// Зашифровать сообщение
    ///
    /// 1. (msg_key, chain_key') = KDF_CK(chain_key)
    /// 2. ciphertext = AEAD(msg_key, nonce, plaintext, AD)
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Self::EncryptedMessage> {
        trace!(
            target: "crypto::double_ratchet",
            plaintext_len = plaintext.len(),
            chain_length = self.sending_chain_length,
            "Encrypting message"
        );

        let dh_public_key: [u8; 32] = self
            .dh_ratchet_public
            .as_ref()
            .try_into()
            .map_err(|_| ConstructError::InvalidInput("Invalid ratchet public key length".to_string()))?;

        let (message_key, next_chain_key) = P::kdf_ck(&self.sending_chain_key)?;
        let nonce = P::generate_nonce(Config::global().chacha_nonce_length)?;

        let mut message = EncryptedRatchetMessage {
            dh_public_key,
            message_number: self.sending_chain_length,
            ciphertext: Vec::new(),
            nonce,
            previous_chain_length: self.previous_sending_length,
            suite_id: self.suite_id,
        };
        let associated_data = message.associated_data();
        message.ciphertext =
            P::aead_encrypt(&message_key, &message.nonce, plaintext, Some(&associated_data))?;

        self.sending_chain_key = next_chain_key;
        self.sending_chain_length += 1;

        Ok(message)
    }

    /// Работает на копии состояния: изменения применяются только после
    /// успешной AEAD проверки.
    fn decrypt_at(&mut self, message: &Self::EncryptedMessage, now: i64) -> Result<Vec<u8>> {
        self.check_suite(message)?;

        debug!(
            target: "crypto::double_ratchet",
            msg_num = message.message_number,
            current_recv_chain_len = self.receiving_chain_length,
            skipped_keys_count = self.skipped_message_keys.len(),
            "Decrypting message"
        );

        let mut next = self.clone();
        next.prune_skipped_keys(now, next.limits.max_skipped_age_secs);
        let plaintext = next.decrypt_staged(message, now)?;
        *self = next;
        Ok(plaintext)
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn cleanup_old_skipped_keys(&mut self, now: i64, max_age_seconds: i64) {
        self.prune_skipped_keys(now, max_age_seconds);
    }
}

impl<P: CryptoProvider> DoubleRatchetSession<P> {
    pub fn with_limits(mut self, limits: RatchetLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn set_limits(&mut self, limits: RatchetLimits) {
        self.limits = limits;
    }

    pub fn sending_chain_length(&self) -> u32 {
        self.sending_chain_length
    }

    pub fn receiving_chain_length(&self) -> u32 {
        self.receiving_chain_length
    }

    pub fn skipped_keys_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    /// SHA-256 текущего sending chain key: сравнение состояний без раскрытия ключа
    pub fn sending_chain_digest(&self) -> [u8; 32] {
        Sha256::digest(self.sending_chain_key.as_ref()).into()
    }

    pub fn dh_public(&self) -> &[u8] {
        self.dh_ratchet_public.as_ref()
    }

    pub fn remote_dh_public(&self) -> &[u8] {
        self.remote_dh_public.as_ref()
    }

    /// Расшифровать только ранее сохранённым skipped key
    ///
    /// Цепочки не продвигаются и DH ratchet не выполняется. `Ok(None)`, если
    /// ключа для сообщения нет; состояние при этом не меняется.
    pub fn decrypt_cached_at(&mut self, message: &EncryptedRatchetMessage, now: i64) -> Result<Option<Vec<u8>>> {
        self.check_suite(message)?;

        let mut next = self.clone();
        next.prune_skipped_keys(now, next.limits.max_skipped_age_secs);
        let Some(skipped) = next
            .skipped_message_keys
            .remove(&(message.dh_public_key.to_vec(), message.message_number))
        else {
            return Ok(None);
        };
        let plaintext = Self::decrypt_with_key(&skipped.key, message)?;
        *self = next;
        Ok(Some(plaintext))
    }

    fn check_suite(&self, message: &EncryptedRatchetMessage) -> Result<()> {
        if message.suite_id != self.suite_id {
            return Err(ConstructError::InvalidInput(format!(
                "Suite mismatch: session {}, message {}",
                self.suite_id, message.suite_id
            )));
        }
        Ok(())
    }

    fn decrypt_staged(&mut self, message: &EncryptedRatchetMessage, now: i64) -> Result<Vec<u8>> {
        let dh_public = message.dh_public_key.to_vec();

        if let Some(skipped) = self
            .skipped_message_keys
            .remove(&(dh_public.clone(), message.message_number))
        {
            trace!(
                target: "crypto::double_ratchet",
                msg_num = message.message_number,
                "Found skipped message key"
            );
            return Self::decrypt_with_key(&skipped.key, message);
        }

        if dh_public.as_slice() == self.remote_dh_public.as_ref() {
            if self.receiving_chain_key.is_none() || message.message_number < self.receiving_chain_length {
                return Err(self.replay(message));
            }
        } else {
            if self.retired_remote_dh.iter().any(|retired| *retired == dh_public) {
                return Err(self.replay(message));
            }
            // Добираем ключи текущей цепочки, которые собеседник успел отправить
            self.skip_message_keys(message.previous_chain_length, now)?;
            self.perform_dh_ratchet(&dh_public)?;
        }

        self.skip_message_keys(message.message_number, now)?;

        let chain_key = self
            .receiving_chain_key
            .as_ref()
            .ok_or_else(|| ConstructError::InvalidInput("No receiving chain".to_string()))?;
        let (message_key, next_chain) = P::kdf_ck(chain_key)?;
        let plaintext = Self::decrypt_with_key(&message_key, message)?;

        self.receiving_chain_key = Some(next_chain);
        self.receiving_chain_length += 1;
        Ok(plaintext)
    }

    fn replay(&self, message: &EncryptedRatchetMessage) -> ConstructError {
        warn!(
            target: "crypto::double_ratchet",
            session_id = %self.session_id,
            msg_num = message.message_number,
            "Message key already consumed or expired"
        );
        ConstructError::ReplayOrExpiredKey(format!(
            "session {} message {}",
            self.session_id, message.message_number
        ))
    }

    /// Сохранить ключи текущей receiving цепочки до номера `until` (не включая)
    fn skip_message_keys(&mut self, until: u32, now: i64) -> Result<()> {
        let Some(mut chain_key) = self.receiving_chain_key.clone() else {
            return Ok(());
        };
        if until <= self.receiving_chain_length {
            return Ok(());
        }

        let requested = until - self.receiving_chain_length;
        if requested > self.limits.max_skipped_messages {
            return Err(ConstructError::SkipWindowExceeded {
                requested,
                limit: self.limits.max_skipped_messages,
            });
        }

        let remote = self.remote_dh_public.as_ref().to_vec();
        while self.receiving_chain_length < until {
            let (message_key, next_chain) = P::kdf_ck(&chain_key)?;
            self.skipped_message_keys.insert(
                (remote.clone(), self.receiving_chain_length),
                SkippedKey {
                    key: message_key,
                    stored_at: now,
                    seq: self.next_skip_seq,
                },
            );
            self.next_skip_seq += 1;
            chain_key = next_chain;
            self.receiving_chain_length += 1;
        }
        self.receiving_chain_key = Some(chain_key);

        self.evict_overflow();
        Ok(())
    }

    fn evict_overflow(&mut self) {
        let limit = self.limits.max_skipped_messages as usize;
        let excess = self.skipped_message_keys.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<((Vec<u8>, u32), u64)> = self
            .skipped_message_keys
            .iter()
            .map(|(index, skipped)| (index.clone(), skipped.seq))
            .collect();
        by_age.sort_by_key(|(_, seq)| *seq);
        for (index, _) in by_age.into_iter().take(excess) {
            self.skipped_message_keys.remove(&index);
        }

        debug!(
            target: "crypto::double_ratchet",
            evicted = excess,
            "Evicted oldest skipped message keys"
        );
    }

    fn prune_skipped_keys(&mut self, now: i64, max_age_seconds: i64) {
        let initial_count = self.skipped_message_keys.len();
        self.skipped_message_keys
            .retain(|_, skipped| now - skipped.stored_at < max_age_seconds);

        let removed_count = initial_count - self.skipped_message_keys.len();
        if removed_count > 0 {
            debug!(
                target: "crypto::double_ratchet",
                removed = removed_count,
                remaining = self.skipped_message_keys.len(),
                "Cleaned up old skipped message keys"
            );
        }
    }

    /// Выполнить DH ratchet step
    ///
    /// 1. DH(our_private, new_remote) → receiving_chain
    /// 2. Новая DH пара
    /// 3. DH(new_private, new_remote) → sending_chain
    fn perform_dh_ratchet(&mut self, new_remote_dh: &[u8]) -> Result<()> {
        debug!(target: "crypto::double_ratchet", "Performing DH ratchet step");

        let dh_receive = P::dh(&self.dh_ratchet_private, new_remote_dh)?;
        let (root_key, receiving_chain) = P::kdf_rk(&self.root_key, &dh_receive)?;

        let (new_dh_private, new_dh_public) = P::generate_kem_keys()?;
        let dh_send = P::dh(&new_dh_private, new_remote_dh)?;
        let (root_key, sending_chain) = P::kdf_rk(&root_key, &dh_send)?;

        let retired = std::mem::replace(
            &mut self.remote_dh_public,
            P::kem_public_key_from_bytes(new_remote_dh.to_vec()),
        );
        self.retired_remote_dh.push_back(retired.as_ref().to_vec());
        if self.retired_remote_dh.len() > MAX_RETIRED_CHAINS {
            self.retired_remote_dh.pop_front();
        }

        self.root_key = root_key;
        self.receiving_chain_key = Some(receiving_chain);
        self.receiving_chain_length = 0;
        self.previous_sending_length = self.sending_chain_length;
        self.sending_chain_key = sending_chain;
        self.sending_chain_length = 0;
        self.dh_ratchet_private = new_dh_private;
        self.dh_ratchet_public = new_dh_public;

        Ok(())
    }

    fn decrypt_with_key(message_key: &P::AeadKey, message: &EncryptedRatchetMessage) -> Result<Vec<u8>> {
        let associated_data = message.associated_data();
        let plaintext = P::aead_decrypt(
            message_key,
            &message.nonce,
            &message.ciphertext,
            Some(&associated_data),
        )
        .map_err(|e| {
            debug!(target: "crypto::double_ratchet", "Decryption failed");
            ConstructError::from(e)
        })?;
        Ok(plaintext)
    }

    fn initial_root_key(root_key: &[u8]) -> Result<P::AeadKey> {
        let root_key_vec = P::hkdf_derive_key(b"", root_key, b"InitialRootKey", 32)?;
        Ok(P::aead_key_from_bytes(root_key_vec))
    }

    /// Сериализовать сессию для сохранения
    pub fn to_serializable(&self) -> SerializableSession {
        SerializableSession {
            suite_id: self.suite_id,
            root_key: self.root_key.as_ref().to_vec(),
            sending_chain_key: self.sending_chain_key.as_ref().to_vec(),
            sending_chain_length: self.sending_chain_length,
            receiving_chain_key: self.receiving_chain_key.as_ref().map(|k| k.as_ref().to_vec()),
            receiving_chain_length: self.receiving_chain_length,
            dh_ratchet_private: self.dh_ratchet_private.as_ref().to_vec(),
            dh_ratchet_public: self.dh_ratchet_public.as_ref().to_vec(),
            remote_dh_public: self.remote_dh_public.as_ref().to_vec(),
            previous_sending_length: self.previous_sending_length,
            skipped_message_keys: self
                .skipped_message_keys
                .iter()
                .map(|((dh_public, message_number), skipped)| SerializableSkippedKey {
                    dh_public: dh_public.clone(),
                    message_number: *message_number,
                    key: skipped.key.as_ref().to_vec(),
                    stored_at: skipped.stored_at,
                    seq: skipped.seq,
                })
                .collect(),
            next_skip_seq: self.next_skip_seq,
            retired_remote_dh: self.retired_remote_dh.iter().cloned().collect(),
            session_id: self.session_id.clone(),
        }
    }

    /// Десериализовать сессию
    pub fn from_serializable(data: &SerializableSession, limits: RatchetLimits) -> Result<Self> {
        Ok(Self {
            suite_id: data.suite_id,
            root_key: P::aead_key_from_bytes(data.root_key.clone()),
            sending_chain_key: P::aead_key_from_bytes(data.sending_chain_key.clone()),
            sending_chain_length: data.sending_chain_length,
            receiving_chain_key: data
                .receiving_chain_key
                .as_ref()
                .map(|bytes| P::aead_key_from_bytes(bytes.clone())),
            receiving_chain_length: data.receiving_chain_length,
            dh_ratchet_private: P::kem_private_key_from_bytes(data.dh_ratchet_private.clone()),
            dh_ratchet_public: P::kem_public_key_from_bytes(data.dh_ratchet_public.clone()),
            remote_dh_public: P::kem_public_key_from_bytes(data.remote_dh_public.clone()),
            previous_sending_length: data.previous_sending_length,
            skipped_message_keys: data
                .skipped_message_keys
                .iter()
                .map(|entry| {
                    (
                        (entry.dh_public.clone(), entry.message_number),
                        SkippedKey {
                            key: P::aead_key_from_bytes(entry.key.clone()),
                            stored_at: entry.stored_at,
                            seq: entry.seq,
                        },
                    )
                })
                .collect(),
            next_skip_seq: data.next_skip_seq,
            retired_remote_dh: data.retired_remote_dh.iter().cloned().collect(),
            limits,
            session_id: data.session_id.clone(),
        })
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableSkippedKey {
    #[serde(with = "serde_bytes")]
    dh_public: Vec<u8>,
    message_number: u32,
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    stored_at: i64,
    seq: u64,
}

/// Serializable session format for storage
///
/// Содержит секретный материал: сериализуется только для последующего sealing.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableSession {
    suite_id: u16,
    #[serde(with = "serde_bytes")]
    root_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    sending_chain_key: Vec<u8>,
    sending_chain_length: u32,
    receiving_chain_key: Option<Vec<u8>>,
    receiving_chain_length: u32,
    #[serde(with = "serde_bytes")]
    dh_ratchet_private: Vec<u8>,
    #[serde(with = "serde_bytes")]
    dh_ratchet_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    remote_dh_public: Vec<u8>,
    previous_sending_length: u32,
    skipped_message_keys: Vec<SerializableSkippedKey>,
    next_skip_seq: u64,
    retired_remote_dh: Vec<Vec<u8>>,
    session_id: String,
}
