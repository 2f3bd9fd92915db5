// Sealing-ключ для хранения приватного материала at rest
// AES-256-GCM, формат blob: nonce(12) || ciphertext+tag
// Мастер-ключ либо генерируется, либо деривируется из пароля через PBKDF2

use crate::config::Config;
use crate::error::CryptoError;
use crate::utils::error::Result;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

const KEY_LENGTH: usize = 32;

/// Ключ, которым шифруется всё приватное (identity, prekeys, состояние сессий)
///
/// Хранилище никогда не видит plaintext приватных ключей: в записи попадает
/// только результат [`SealingKey::seal`].
#[derive(Clone)]
pub struct SealingKey {
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

impl SealingKey {
    /// Случайный ключ из OsRng
    pub fn generate() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        rand::rngs::OsRng
            .try_fill_bytes(&mut *key)
            .map_err(CryptoError::from)?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidInputError(format!(
                "Invalid sealing key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
            .into());
        }
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Деривировать ключ из пароля с использованием PBKDF2
    ///
    /// # Arguments
    /// * `password` - Пароль устройства
    /// * `salt` - Соль (длина из `Config::salt_length`)
    pub fn from_passphrase(password: &str, salt: &[u8]) -> Result<Self> {
        let config = Config::global();
        if salt.len() != config.salt_length {
            return Err(CryptoError::InvalidInputError(format!(
                "Invalid salt length: expected {}, got {}",
                config.salt_length,
                salt.len()
            ))
            .into());
        }

        if password.is_empty() {
            return Err(
                CryptoError::InvalidInputError("Password cannot be empty".to_string()).into(),
            );
        }

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt,
            config.pbkdf2_iterations,
            &mut *key,
        );

        Ok(Self { key })
    }

    /// Случайная соль для [`SealingKey::from_passphrase`]
    pub fn generate_salt() -> Vec<u8> {
        let mut salt = vec![0u8; Config::global().salt_length];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Зашифровать данные. `context` аутентифицируется, но не шифруется,
    /// и привязывает blob к владельцу записи.
    pub fn seal(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let nonce_length = Config::global().nonce_length;
        let cipher = Aes256Gcm::new((&*self.key).into());

        let mut nonce_bytes = vec![0u8; nonce_length];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(CryptoError::from)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: context,
                },
            )
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))?;

        // nonce + ciphertext
        let mut result = Vec::with_capacity(nonce_length + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Расшифровать blob, созданный [`SealingKey::seal`]
    pub fn open(&self, sealed: &[u8], context: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let nonce_length = Config::global().nonce_length;

        if sealed.len() < nonce_length {
            return Err(CryptoError::AeadDecryptionError(
                "Invalid ciphertext: too short".to_string(),
            )
            .into());
        }

        let cipher = Aes256Gcm::new((&*self.key).into());
        let (nonce_bytes, ciphertext) = sealed.split_at(nonce_length);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: context,
                },
            )
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_passphrase_deterministic() {
        let salt = SealingKey::generate_salt();
        let a = SealingKey::from_passphrase("test_password_123", &salt).unwrap();
        let b = SealingKey::from_passphrase("test_password_123", &salt).unwrap();

        // Одинаковый пароль и соль должны давать одинаковый ключ
        assert_eq!(&*a.key, &*b.key);
    }

    #[test]
    fn test_from_passphrase_different_salt() {
        let a = SealingKey::from_passphrase("pw", &SealingKey::generate_salt()).unwrap();
        let b = SealingKey::from_passphrase("pw", &SealingKey::generate_salt()).unwrap();
        assert_ne!(&*a.key, &*b.key);
    }

    #[test]
    fn test_seal_open() {
        let key = SealingKey::generate().unwrap();
        let sealed = key.seal(b"identity secret", b"alice:phone").unwrap();

        // nonce + ciphertext + tag
        assert_eq!(sealed.len(), 12 + b"identity secret".len() + 16);

        let opened = key.open(&sealed, b"alice:phone").unwrap();
        assert_eq!(opened.as_slice(), b"identity secret");
    }

    #[test]
    fn test_open_wrong_context_fails() {
        let key = SealingKey::generate().unwrap();
        let sealed = key.seal(b"secret", b"alice:phone").unwrap();
        assert!(key.open(&sealed, b"bob:phone").is_err());
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let salt = SealingKey::generate_salt();
        let right = SealingKey::from_passphrase("correct_password_123", &salt).unwrap();
        let wrong = SealingKey::from_passphrase("wrong_password_456", &salt).unwrap();

        let sealed = right.seal(b"secret", b"").unwrap();
        assert!(wrong.open(&sealed, b"").is_err());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(SealingKey::from_passphrase("", &SealingKey::generate_salt()).is_err());
        assert!(SealingKey::from_passphrase("pw", &[0u8; 4]).is_err());
        assert!(SealingKey::from_bytes(&[0u8; 31]).is_err());
        assert!(SealingKey::generate().unwrap().open(&[0u8; 5], b"").is_err());
    }
}
