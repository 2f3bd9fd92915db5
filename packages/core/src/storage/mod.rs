//! Абстракция хранилища ключевого материала
//!
//! Trait синхронный: все операции атомарны относительно друг друга, поэтому
//! compare-and-set (claim one-time prekey, единственная активная запись на
//! устройство / 4-tuple) реализуется внутри одного вызова.
//!
//! Реализация обязана быть Clone (разделяется между компонентами) и Send + Sync.
//! Клоны должны видеть одно и то же состояние.

pub mod memory;
pub mod models;

pub use memory::MemoryStorage;

use crate::protocol::{DeviceAddress, SessionKey};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use models::{
    ChatEncryptionKeyRecord, ConversationKeyBundleRecord, ConversationRecord, IdentityKeyRecord,
    OneTimePreKeyRecord, QuantumEncapsulationRecord, SessionRecord, SignedPreKeyRecord,
};
use uuid::Uuid;

pub trait KeyStore: Clone + Send + Sync + 'static {
    // ============================================
    // IDENTITY
    // ============================================

    /// Активировать identity
    ///
    /// - Pre: если `replace == false`, у устройства нет активной identity
    /// - Post: `record` единственная активная identity устройства,
    ///   `registration_id` = предыдущий максимум + 1
    ///
    /// # Errors
    /// `DuplicateIdentity` если активная identity есть и `replace == false`
    fn activate_identity(&self, record: IdentityKeyRecord, replace: bool) -> Result<IdentityKeyRecord>;

    fn active_identity(&self, address: &DeviceAddress) -> Result<Option<IdentityKeyRecord>>;

    /// Все identity устройства, от старых к новым
    fn identity_history(&self, address: &DeviceAddress) -> Result<Vec<IdentityKeyRecord>>;

    /// Деактивировать активную identity. Возвращает false, если её не было.
    fn deactivate_identity(&self, address: &DeviceAddress, reason: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Устройства с активной identity
    fn active_devices(&self) -> Result<Vec<DeviceAddress>>;

    // ============================================
    // SIGNED PREKEYS
    // ============================================

    fn next_signed_prekey_id(&self, address: &DeviceAddress) -> Result<u32>;

    /// Сохранить signed prekey активным; предыдущий деактивируется, но не удаляется
    fn activate_signed_prekey(&self, record: SignedPreKeyRecord) -> Result<()>;

    fn active_signed_prekey(&self, address: &DeviceAddress) -> Result<Option<SignedPreKeyRecord>>;

    /// Signed prekey по id, включая неактивные
    fn signed_prekey(&self, address: &DeviceAddress, key_id: u32) -> Result<Option<SignedPreKeyRecord>>;

    fn deactivate_signed_prekeys(&self, address: &DeviceAddress) -> Result<usize>;

    /// Удалить неактивные signed prekeys, истёкшие раньше `before`
    fn purge_signed_prekeys(&self, address: &DeviceAddress, before: DateTime<Utc>) -> Result<usize>;

    // ============================================
    // ONE-TIME PREKEYS
    // ============================================

    fn next_one_time_prekey_id(&self, address: &DeviceAddress) -> Result<u32>;

    /// # Errors
    /// `StorageError` если key id уже занят
    fn insert_one_time_prekeys(&self, records: Vec<OneTimePreKeyRecord>) -> Result<()>;

    /// Неиспользованный ключ с наименьшим id (без claim)
    fn peek_one_time_prekey(&self, address: &DeviceAddress, now: DateTime<Utc>) -> Result<Option<OneTimePreKeyRecord>>;

    /// Атомарно пометить ключ использованным
    ///
    /// - `key_id = Some(id)`: `AlreadyUsed` если уже занят, `NotFound` если нет или истёк
    /// - `key_id = None`: любой свободный ключ, `Ok(None)` если пул пуст
    fn claim_one_time_prekey(
        &self,
        address: &DeviceAddress,
        key_id: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Option<OneTimePreKeyRecord>>;

    /// Забрать sealed приватный ключ и стереть его из записи
    ///
    /// # Errors
    /// `AlreadyUsed` если приватный ключ уже стёрт, `NotFound` если ключа нет
    fn take_one_time_prekey_private(&self, address: &DeviceAddress, key_id: u32, now: DateTime<Utc>) -> Result<Vec<u8>>;

    fn count_available_one_time_prekeys(&self, address: &DeviceAddress, now: DateTime<Utc>) -> Result<usize>;

    /// Пометить все ключи устройства использованными и стереть приватные части
    fn invalidate_one_time_prekeys(&self, address: &DeviceAddress, at: DateTime<Utc>) -> Result<usize>;

    /// Удалить ключи, использованные или истёкшие раньше `before`
    fn purge_one_time_prekeys(&self, address: &DeviceAddress, before: DateTime<Utc>) -> Result<usize>;

    // ============================================
    // QUANTUM ENCAPSULATION
    // ============================================

    /// Upsert по (session_id, owner)
    fn store_encapsulation(&self, record: QuantumEncapsulationRecord) -> Result<()>;

    fn encapsulation(&self, session_id: Uuid, owner: &DeviceAddress) -> Result<Option<QuantumEncapsulationRecord>>;

    fn deactivate_encapsulations(&self, session_id: Uuid) -> Result<usize>;

    // ============================================
    // SESSIONS
    // ============================================

    /// Сохранить новую сессию активной; предыдущая активная для 4-tuple
    /// становится неактивной и остаётся для расшифровки in-flight сообщений
    fn insert_session(&self, record: SessionRecord) -> Result<()>;

    fn active_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>>;

    fn session(&self, key: &SessionKey, session_id: Uuid) -> Result<Option<SessionRecord>>;

    /// Все сессии 4-tuple, от старых к новым
    fn sessions_for(&self, key: &SessionKey) -> Result<Vec<SessionRecord>>;

    /// Заменить запись (key, session_id)
    ///
    /// Revoked терминален: если сохранённая запись уже отозвана, поля отзыва
    /// переносятся в новую запись.
    ///
    /// # Errors
    /// `NotFound` если записи (key, session_id) нет
    fn update_session(&self, record: SessionRecord) -> Result<()>;

    /// Все сессии, где устройство local или remote
    fn sessions_involving(&self, address: &DeviceAddress) -> Result<Vec<SessionRecord>>;

    fn all_sessions(&self) -> Result<Vec<SessionRecord>>;

    // ============================================
    // CONVERSATIONS
    // ============================================

    fn upsert_conversation(&self, record: ConversationRecord) -> Result<()>;

    fn conversation(&self, id: Uuid) -> Result<Option<ConversationRecord>>;

    /// Беседы, где устройство владелец или участник
    fn conversations_involving(&self, address: &DeviceAddress) -> Result<Vec<ConversationRecord>>;

    /// Upsert по (conversation, recipient, version)
    fn put_bundle(&self, record: ConversationKeyBundleRecord) -> Result<()>;

    fn bundle(&self, conversation_id: Uuid, recipient: &DeviceAddress, version: u32) -> Result<Option<ConversationKeyBundleRecord>>;

    /// Bundles устройства в беседе, по возрастанию версии
    fn bundles_for(&self, conversation_id: Uuid, recipient: &DeviceAddress) -> Result<Vec<ConversationKeyBundleRecord>>;

    /// Пометить неактивными bundles беседы с версией меньше `version`
    fn deactivate_bundles_before(&self, conversation_id: Uuid, version: u32) -> Result<usize>;

    fn deactivate_bundles_for_device(&self, recipient: &DeviceAddress) -> Result<usize>;

    fn upsert_chat_key(&self, record: ChatEncryptionKeyRecord) -> Result<()>;

    fn chat_key(&self, conversation_id: Uuid, address: &DeviceAddress) -> Result<Option<ChatEncryptionKeyRecord>>;

    fn revoke_chat_keys(&self, address: &DeviceAddress, reason: &str, at: DateTime<Utc>) -> Result<usize>;
}
