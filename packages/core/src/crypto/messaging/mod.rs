//! Secure Messaging Protocols
//!
//! Этот модуль содержит протоколы защищённого обмена сообщениями.
//!
//! ## Протоколы
//! - **Double Ratchet**: Основной протокол Signal
//!
//! ## Dataflow
//! ```text
//! После успешного KeyAgreement:
//!
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! 1. Создаёт session:
//!    new_initiator_session(
//!      root_key,           ← от X3DH
//!      initiator_state,    ← содержит ephemeral_private
//!      SPK_B_pub           ← первый remote ratchet key
//!    )
//!
//!                                            1. Создаёт session из InitialMessage
//!                                               (расшифровывать ничего не нужно):
//!                                               new_responder_session(
//!                                                 root_key,   ← от X3DH
//!                                                 SPK_B_priv, ← первый local ratchet key
//!                                                 EK_A_pub
//!                                               )
//!
//! 2. Alice → Bob: msg1, msg2 (цепочка EK_A)
//!    Bob → Alice: msg3 (новый DH ключ Bob, DH ratchet step у Alice)
//!    Alice → Bob: msg4 (новый DH ключ Alice, DH ratchet step у Bob)
//!    ...
//! ```
//!
//! DH ratchet выполняется при каждой смене направления, инициатива всегда
//! у получателя нового ключа. Отправитель никогда не ротирует DH ключ сам.
//!
//! ## Security Properties
//!
//! ### Forward Secrecy
//! Компрометация текущих ключей НЕ раскрывает прошлые сообщения.
//!
//! ### Break-in Recovery
//! После компрометации, новый DH ratchet step восстанавливает безопасность.
//!
//! ### Out-of-Order Messages
//! Сообщения в пределах окна пропуска расшифровываются в любом порядке.
//! Повторно использованный или истёкший ключ даёт `ReplayOrExpiredKey`.

use crate::crypto::handshake::InitiatorState;
use crate::crypto::provider::CryptoProvider;
use crate::utils::error::Result;
use crate::utils::time::current_timestamp;
use serde::{de::DeserializeOwned, Serialize};

/// Протокол защищённого обмена сообщениями
///
/// ## Ответственность
/// - Шифрование и расшифровка сообщений
/// - DH ratcheting для forward secrecy
/// - Symmetric key ratcheting (chain keys)
/// - Управление skipped message keys для out-of-order сообщений
///
/// ## Не отвечает за:
/// - Key agreement / handshake (это делает X3DH)
/// - Хранение и блокировки (это делает `session::ratchet`)
pub trait SecureMessaging<P: CryptoProvider>: Sized {
    /// Зашифрованное сообщение в wire format
    type EncryptedMessage: Clone + Serialize + DeserializeOwned;

    /// Создать сессию как инициатор (Alice)
    ///
    /// `initiator_state.ephemeral_private` становится первым DH ratchet key,
    /// `remote_ratchet_public` это signed prekey собеседника.
    fn new_initiator_session(
        root_key: &[u8],
        initiator_state: InitiatorState<P>,
        remote_ratchet_public: &[u8],
        session_id: String,
    ) -> Result<Self>;

    /// Создать сессию как получатель (Bob)
    ///
    /// `local_ratchet_private` это signed prekey, на который пришёл handshake.
    /// Сессия сразу готова и к отправке, и к приёму.
    fn new_responder_session(
        root_key: &[u8],
        local_ratchet_private: P::KemPrivateKey,
        remote_ephemeral_public: &[u8],
        session_id: String,
    ) -> Result<Self>;

    /// Зашифровать сообщение
    ///
    /// # Side Effects
    /// - Обновляет sending_chain_key
    /// - Увеличивает sending_chain_length
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Self::EncryptedMessage>;

    /// Расшифровать сообщение; `now` (unix timestamp) задаёт возраст skipped keys
    ///
    /// При ошибке состояние сессии не меняется.
    ///
    /// # Ошибки
    /// - `ReplayOrExpiredKey`: ключ уже использован или истёк
    /// - `SkipWindowExceeded`: номер сообщения дальше окна пропуска
    /// - `CryptoError`: подделанный ciphertext
    fn decrypt_at(&mut self, message: &Self::EncryptedMessage, now: i64) -> Result<Vec<u8>>;

    /// `decrypt_at` по системным часам
    ///
    /// Только для standalone использования сессии. `RatchetSessions` всегда
    /// передаёт время из своего `Clock`.
    fn decrypt(&mut self, message: &Self::EncryptedMessage) -> Result<Vec<u8>> {
        self.decrypt_at(message, current_timestamp())
    }

    fn session_id(&self) -> &str;

    /// Удалить skipped message keys старше `max_age_seconds` на момент `now`
    fn cleanup_old_skipped_keys(&mut self, now: i64, max_age_seconds: i64);
}

pub mod double_ratchet;

pub use double_ratchet::{DoubleRatchetSession, EncryptedRatchetMessage, RatchetLimits, SerializableSession};
