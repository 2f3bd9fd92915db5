//! Post-quantum KEM (ML-KEM / Kyber)
//!
//! QuantumEncapsulator выполняет KEM-обмен параллельно с классическими DH шагами X3DH.
//! Полученный shared secret конкатенируется с DH выходами перед HKDF, поэтому
//! сессия остаётся защищённой, пока не сломаны ОБА примитива.
//!
//! Обе операции - чистые функции от ключевого материала и параметров алгоритма.
//!
//! ```text
//! Alice                                         Bob
//! =====                                         ===
//! (ct, ss) = encapsulate(Bob.quantum_pub)
//!            ── ct в InitialMessage ──────────→
//!                                               ss = decapsulate(ct, Bob.quantum_priv)
//! ```

use crate::config::Config;
use crate::utils::error::{ConstructError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Алгоритм квантовой инкапсуляции
///
/// Tag сериализуется в строку (`"ML-KEM-768"`) и хранится в записях identity / encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantumAlgorithm {
    #[serde(rename = "ML-KEM-512")]
    MlKem512,
    #[serde(rename = "ML-KEM-768")]
    MlKem768,
    #[serde(rename = "ML-KEM-1024")]
    MlKem1024,
}

impl QuantumAlgorithm {
    pub fn tag(&self) -> &'static str {
        match self {
            QuantumAlgorithm::MlKem512 => "ML-KEM-512",
            QuantumAlgorithm::MlKem768 => "ML-KEM-768",
            QuantumAlgorithm::MlKem1024 => "ML-KEM-1024",
        }
    }

    /// Скомпилирован ли backend (feature `post-quantum`)
    pub fn is_compiled_in(&self) -> bool {
        cfg!(feature = "post-quantum")
    }
}

impl fmt::Display for QuantumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for QuantumAlgorithm {
    type Err = ConstructError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "ML-KEM-512" | "kyber512" => Ok(QuantumAlgorithm::MlKem512),
            "ML-KEM-768" | "kyber768" => Ok(QuantumAlgorithm::MlKem768),
            "ML-KEM-1024" | "kyber1024" => Ok(QuantumAlgorithm::MlKem1024),
            other => Err(ConstructError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Квантовая пара ключей
pub struct QuantumKeyPair {
    pub algorithm: QuantumAlgorithm,
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
}

/// Результат инкапсуляции: ciphertext уходит получателю, shared secret остаётся локально
pub struct Encapsulation {
    pub ciphertext: Vec<u8>,
    pub shared_secret: Zeroizing<Vec<u8>>,
}

/// Post-quantum encapsulator
///
/// Stateless, кроме списка локально разрешённых алгоритмов.
#[derive(Debug, Clone)]
pub struct QuantumEncapsulator {
    supported: Vec<QuantumAlgorithm>,
}

impl QuantumEncapsulator {
    pub fn new(supported: Vec<QuantumAlgorithm>) -> Self {
        Self { supported }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.supported_quantum_algorithms.clone())
    }

    pub fn supports(&self, algorithm: QuantumAlgorithm) -> bool {
        algorithm.is_compiled_in() && self.supported.contains(&algorithm)
    }

    fn ensure_supported(&self, algorithm: QuantumAlgorithm) -> Result<()> {
        if self.supports(algorithm) {
            Ok(())
        } else {
            Err(ConstructError::UnsupportedAlgorithm(algorithm.tag().to_string()))
        }
    }

    /// Сгенерировать пару ключей для публикации в identity
    pub fn generate_keypair(&self, algorithm: QuantumAlgorithm) -> Result<QuantumKeyPair> {
        self.ensure_supported(algorithm)?;
        let (public_key, private_key) = backend::keypair(algorithm)?;

        tracing::debug!(
            target: "crypto::quantum",
            algorithm = %algorithm,
            public_key_len = %public_key.len(),
            "Generated quantum key pair"
        );

        Ok(QuantumKeyPair {
            algorithm,
            public_key,
            private_key: Zeroizing::new(private_key),
        })
    }

    /// Инкапсулировать shared secret под опубликованный публичный ключ получателя
    pub fn encapsulate(
        &self,
        algorithm: QuantumAlgorithm,
        recipient_public_key: &[u8],
    ) -> Result<Encapsulation> {
        self.ensure_supported(algorithm)?;
        let (ciphertext, shared_secret) = backend::encapsulate(algorithm, recipient_public_key)?;

        tracing::trace!(
            target: "crypto::quantum",
            algorithm = %algorithm,
            ciphertext_len = %ciphertext.len(),
            "Encapsulated shared secret"
        );

        Ok(Encapsulation {
            ciphertext,
            shared_secret: Zeroizing::new(shared_secret),
        })
    }

    /// Декапсулировать shared secret своим приватным ключом
    pub fn decapsulate(
        &self,
        algorithm: QuantumAlgorithm,
        ciphertext: &[u8],
        own_private_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_supported(algorithm)?;
        let shared_secret = backend::decapsulate(algorithm, ciphertext, own_private_key)?;
        Ok(Zeroizing::new(shared_secret))
    }
}

#[cfg(feature = "post-quantum")]
mod backend {
    use super::QuantumAlgorithm;
    use crate::error::CryptoError;
    use crate::utils::error::Result;
    use pqcrypto_kyber::{kyber1024, kyber512, kyber768};

    macro_rules! kyber_ops {
        ($name:ident, $module:ident) => {
            mod $name {
                use super::*;
                use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};

                pub fn keypair() -> (Vec<u8>, Vec<u8>) {
                    let (pk, sk) = $module::keypair();
                    (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
                }

                pub fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
                    let pk = $module::PublicKey::from_bytes(public_key).map_err(|e| {
                        CryptoError::KemEncapsulationError(format!("Invalid public key: {:?}", e))
                    })?;
                    let (ss, ct) = $module::encapsulate(&pk);
                    Ok((ct.as_bytes().to_vec(), ss.as_bytes().to_vec()))
                }

                pub fn decapsulate(ciphertext: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
                    let ct = $module::Ciphertext::from_bytes(ciphertext).map_err(|e| {
                        CryptoError::KemDecapsulationError(format!("Invalid ciphertext: {:?}", e))
                    })?;
                    let sk = $module::SecretKey::from_bytes(private_key).map_err(|e| {
                        CryptoError::KemDecapsulationError(format!("Invalid private key: {:?}", e))
                    })?;
                    Ok($module::decapsulate(&ct, &sk).as_bytes().to_vec())
                }
            }
        };
    }

    kyber_ops!(ml_kem_512, kyber512);
    kyber_ops!(ml_kem_768, kyber768);
    kyber_ops!(ml_kem_1024, kyber1024);

    pub fn keypair(algorithm: QuantumAlgorithm) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok(match algorithm {
            QuantumAlgorithm::MlKem512 => ml_kem_512::keypair(),
            QuantumAlgorithm::MlKem768 => ml_kem_768::keypair(),
            QuantumAlgorithm::MlKem1024 => ml_kem_1024::keypair(),
        })
    }

    pub fn encapsulate(algorithm: QuantumAlgorithm, public_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        match algorithm {
            QuantumAlgorithm::MlKem512 => ml_kem_512::encapsulate(public_key),
            QuantumAlgorithm::MlKem768 => ml_kem_768::encapsulate(public_key),
            QuantumAlgorithm::MlKem1024 => ml_kem_1024::encapsulate(public_key),
        }
    }

    pub fn decapsulate(algorithm: QuantumAlgorithm, ciphertext: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
        match algorithm {
            QuantumAlgorithm::MlKem512 => ml_kem_512::decapsulate(ciphertext, private_key),
            QuantumAlgorithm::MlKem768 => ml_kem_768::decapsulate(ciphertext, private_key),
            QuantumAlgorithm::MlKem1024 => ml_kem_1024::decapsulate(ciphertext, private_key),
        }
    }
}

#[cfg(not(feature = "post-quantum"))]
mod backend {
    use super::QuantumAlgorithm;
    use crate::utils::error::{ConstructError, Result};

    pub fn keypair(algorithm: QuantumAlgorithm) -> Result<(Vec<u8>, Vec<u8>)> {
        Err(ConstructError::UnsupportedAlgorithm(algorithm.tag().to_string()))
    }

    pub fn encapsulate(algorithm: QuantumAlgorithm, _public_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        Err(ConstructError::UnsupportedAlgorithm(algorithm.tag().to_string()))
    }

    pub fn decapsulate(algorithm: QuantumAlgorithm, _ciphertext: &[u8], _private_key: &[u8]) -> Result<Vec<u8>> {
        Err(ConstructError::UnsupportedAlgorithm(algorithm.tag().to_string()))
    }
}

#[cfg(all(test, feature = "post-quantum"))]
mod tests {
    use super::*;

    fn encapsulator() -> QuantumEncapsulator {
        QuantumEncapsulator::new(vec![QuantumAlgorithm::MlKem768, QuantumAlgorithm::MlKem1024])
    }

    #[test]
    fn test_encapsulate_decapsulate_shared_secret_matches() {
        let kem = encapsulator();
        let bob = kem.generate_keypair(QuantumAlgorithm::MlKem768).unwrap();

        let encapsulation = kem.encapsulate(QuantumAlgorithm::MlKem768, &bob.public_key).unwrap();
        let decapsulated = kem
            .decapsulate(QuantumAlgorithm::MlKem768, &encapsulation.ciphertext, &bob.private_key)
            .unwrap();

        assert_eq!(*encapsulation.shared_secret, *decapsulated);
        assert_eq!(decapsulated.len(), 32);
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let kem = encapsulator();
        let other = QuantumEncapsulator::new(vec![QuantumAlgorithm::MlKem512]);
        let key = other.generate_keypair(QuantumAlgorithm::MlKem512).unwrap();

        let result = kem.encapsulate(QuantumAlgorithm::MlKem512, &key.public_key);
        assert!(matches!(result, Err(ConstructError::UnsupportedAlgorithm(tag)) if tag == "ML-KEM-512"));
    }

    #[test]
    fn test_wrong_length_public_key_is_crypto_error() {
        let kem = encapsulator();
        let result = kem.encapsulate(QuantumAlgorithm::MlKem768, &[0u8; 10]);
        assert!(matches!(result, Err(ConstructError::CryptoError(_))));
    }

    #[test]
    fn test_algorithm_tags_roundtrip() {
        for algorithm in [QuantumAlgorithm::MlKem512, QuantumAlgorithm::MlKem768, QuantumAlgorithm::MlKem1024] {
            assert_eq!(algorithm.tag().parse::<QuantumAlgorithm>().unwrap(), algorithm);
        }
        assert!(matches!(
            "NTRU-HPS".parse::<QuantumAlgorithm>(),
            Err(ConstructError::UnsupportedAlgorithm(_))
        ));
    }
}
