//! Ключи бесед
//!
//! Каждая беседа имеет версионированный симметричный ключ. Распределяющее
//! устройство оборачивает его для каждого участника через pairwise ratchet
//! сессию ([`ConversationKeyDistributor`]), сообщения беседы шифруются
//! [`ConversationKey`] последней версии.

pub mod cipher;
pub mod distributor;

pub use cipher::{ConversationCiphertext, ConversationKey, ConversationKeyring, CONVERSATION_KEY_LENGTH};
pub use distributor::{ConversationKeyDistributor, DistributionReport};
