//! Key Agreement Protocols
//!
//! Установка общего секрета между двумя устройствами без предварительного обмена.
//!
//! ## Протоколы
//! - **X3DH**: Extended Triple Diffie-Hellman + опциональный one-time prekey (DH4)
//! - **Hybrid X3DH**: тот же X3DH, в KDF которого подмешан shared secret ML-KEM
//!
//! ## Dataflow
//! ```text
//! Alice (инициатор)                          Bob (получатель)
//! ==================                         =================
//!
//! 1. Получает Bob's bundle
//! 2. Проверяет подпись signed prekey
//! 3. (опц.) encapsulate(Bob's quantum key) → ss, ct
//! 4. X3DHProtocol::perform_as_initiator()
//!    → (root_key, InitiatorState{ephemeral_private})
//! 5. Отправляет InitialMessage {IK_A, EK_A, spk_id, opk_id?, ct?}
//!
//!                                            1. Получает InitialMessage
//!                                            2. (опц.) decapsulate(ct) → ss
//!                                            3. X3DHProtocol::perform_as_responder()
//!                                               → root_key (тот же!)
//! ```

use crate::crypto::provider::CryptoProvider;
use zeroize::Zeroizing;

/// Состояние инициатора после key agreement
///
/// Ephemeral private key становится первым DH ratchet key в Double Ratchet.
/// Он используется дважды:
/// 1. В X3DH для DH2, DH3 и DH4
/// 2. Как первый DH key в Double Ratchet
pub struct InitiatorState<P: CryptoProvider> {
    pub ephemeral_private: P::KemPrivateKey,
}

/// Публичные ключи собеседника, участвующие в DH
#[derive(Debug, Clone, Copy)]
pub struct RemotePreKeys<'a> {
    /// IK_B
    pub identity_public: &'a [u8],
    /// SPK_B
    pub signed_prekey_public: &'a [u8],
    /// OPK_B, если пул не исчерпан
    pub one_time_prekey_public: Option<&'a [u8]>,
}

/// Приватные ключи получателя, участвующие в DH
pub struct LocalPreKeys<'a, P: CryptoProvider> {
    pub identity_private: &'a P::KemPrivateKey,
    pub signed_prekey_private: &'a P::KemPrivateKey,
    pub one_time_prekey_private: Option<&'a P::KemPrivateKey>,
}

/// Корневой ключ сессии (32 байта)
pub type RootKey = Zeroizing<Vec<u8>>;

pub mod x3dh;

pub use x3dh::X3DHProtocol;
