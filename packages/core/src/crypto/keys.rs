// Генерация ключевого материала устройства
// Identity (X25519 + Ed25519 [+ ML-KEM]), signed prekeys, one-time prekeys

use crate::crypto::provider::CryptoProvider;
use crate::crypto::quantum::{QuantumAlgorithm, QuantumEncapsulator, QuantumKeyPair};
use crate::utils::error::Result;
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use tracing::debug;

/// Fingerprint identity: hex(SHA-256(dh_public || signing_public))
pub fn identity_fingerprint(dh_public: &[u8], signing_public: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dh_public);
    hasher.update(signing_public);
    hex::encode(hasher.finalize())
}

/// Долговременные ключи устройства
pub struct DeviceIdentityKeys<P: CryptoProvider> {
    pub dh: (P::KemPrivateKey, P::KemPublicKey),
    pub signing: (P::SignaturePrivateKey, P::SignaturePublicKey),
    /// ML-KEM пара и подпись над её публичным ключом
    pub quantum: Option<(QuantumKeyPair, Vec<u8>)>,
}

impl<P: CryptoProvider> DeviceIdentityKeys<P> {
    pub fn fingerprint(&self) -> String {
        identity_fingerprint(self.dh.1.as_ref(), self.signing.1.as_ref())
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(P::sign(&self.signing.0, data)?)
    }
}

/// Prekey пара (signed или one-time)
pub struct PreKeyPair<P: CryptoProvider> {
    pub key_id: u32,
    pub private_key: P::KemPrivateKey,
    pub public_key: P::KemPublicKey,
}

/// Signed prekey: пара + подпись identity ключом над публичным ключом
pub struct SignedPreKeyPair<P: CryptoProvider> {
    pub pair: PreKeyPair<P>,
    pub signature: Vec<u8>,
}

/// Генератор ключей устройства
pub struct KeyManager<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> KeyManager<P> {
    /// Сгенерировать identity устройства
    ///
    /// Если передан `quantum`, дополнительно создаётся ML-KEM пара, публичный ключ
    /// которой подписывается identity signing key.
    pub fn generate_identity(
        quantum: Option<(&QuantumEncapsulator, QuantumAlgorithm)>,
    ) -> Result<DeviceIdentityKeys<P>> {
        let dh = P::generate_kem_keys()?;
        let signing = P::generate_signature_keys()?;

        let quantum = match quantum {
            Some((encapsulator, algorithm)) => {
                let pair = encapsulator.generate_keypair(algorithm)?;
                let signature = P::sign(&signing.0, &pair.public_key)?;
                Some((pair, signature))
            }
            None => None,
        };

        let keys = DeviceIdentityKeys { dh, signing, quantum };
        debug!(
            target: "crypto::keys",
            fingerprint = %keys.fingerprint(),
            hybrid = keys.quantum.is_some(),
            "Generated device identity"
        );
        Ok(keys)
    }

    /// Восстановить identity из приватных ключей (после unseal)
    pub fn identity_from_private(
        dh_private: Vec<u8>,
        signing_private: Vec<u8>,
    ) -> Result<(P::KemPrivateKey, P::SignaturePrivateKey)> {
        let dh_private = P::kem_private_key_from_bytes(dh_private);
        P::from_private_key_to_public_key(&dh_private)?;
        let signing_private = P::signature_private_key_from_bytes(signing_private);
        P::from_signature_private_to_public(&signing_private)?;
        Ok((dh_private, signing_private))
    }

    /// Сгенерировать signed prekey и подписать его
    pub fn generate_signed_prekey(
        signing_key: &P::SignaturePrivateKey,
        key_id: u32,
    ) -> Result<SignedPreKeyPair<P>> {
        let (private_key, public_key) = P::generate_kem_keys()?;
        let signature = P::sign(signing_key, public_key.as_ref())?;

        Ok(SignedPreKeyPair {
            pair: PreKeyPair {
                key_id,
                private_key,
                public_key,
            },
            signature,
        })
    }

    /// Сгенерировать `count` one-time prekeys с последовательными id начиная с `first_id`
    pub fn generate_one_time_prekeys(first_id: u32, count: u32) -> Result<Vec<PreKeyPair<P>>> {
        (0..count)
            .map(|offset| -> Result<PreKeyPair<P>> {
                let (private_key, public_key) = P::generate_kem_keys()?;
                Ok(PreKeyPair {
                    key_id: first_id.wrapping_add(offset),
                    private_key,
                    public_key,
                })
            })
            .collect()
    }
}
