// Типы ошибок протокола управления ключами

use crate::error::CryptoError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructError {
    /// Нет identity / устройства / сессии: caller должен сначала выполнить bootstrap
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Active identity already registered for device {0}")]
    DuplicateIdentity(String),

    /// Нарушение trust anchor: никогда не ретраится автоматически
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("One-time prekey {key_id} already used by device {device}")]
    AlreadyUsed { device: String, key_id: u32 },

    #[error("Replayed or expired message key: {0}")]
    ReplayOrExpiredKey(String),

    /// Номер сообщения дальше окна пропуска (DoS защита)
    #[error("Skip window exceeded: requested {requested} skipped keys, limit {limit}")]
    SkipWindowExceeded { requested: u32, limit: u32 },

    #[error("Stale prekey bundle for device {0}: signed prekey expired")]
    StalePreKeyBundle(String),

    #[error("Unsupported quantum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Session revoked: {0}")]
    SessionRevoked(String),

    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Cryptography error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ConstructError {
    /// Ошибку можно повторить позже (peer переопубликует ключи, сеть восстановится)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StalePreKeyBundle(_) | Self::HandshakeTimeout(_)
        )
    }

    /// Сильный сигнал атаки или рассинхронизации, пишется как security event
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature(_) | Self::AlreadyUsed { .. } | Self::ReplayOrExpiredKey(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConstructError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ConstructError::HandshakeTimeout(100).is_retryable());
        assert!(ConstructError::StalePreKeyBundle("bob:1".into()).is_retryable());
        assert!(!ConstructError::InvalidSignature("spk".into()).is_retryable());

        assert!(ConstructError::InvalidSignature("spk".into()).is_security_event());
        assert!(ConstructError::AlreadyUsed { device: "bob:1".into(), key_id: 7 }.is_security_event());
        assert!(!ConstructError::SessionRevoked("x".into()).is_security_event());
    }

    #[test]
    fn test_crypto_error_converts() {
        let err: ConstructError = CryptoError::AeadDecryptionError("tag".into()).into();
        assert!(matches!(err, ConstructError::CryptoError(_)));
    }
}
