use crate::crypto::provider::CryptoProvider;
use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key as AeadKeyChacha, KeyInit, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

const KEY_LEN: usize = 32;
const CHACHA_NONCE_LEN: usize = 12;
const SIGNATURE_LEN: usize = 64;

/// Concrete implementation of `CryptoProvider` for the classic suite.
pub struct ClassicSuiteProvider;

fn as_key_bytes<'a>(bytes: &'a [u8], what: &str) -> Result<&'a [u8; KEY_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidInputError(format!("Invalid {} length: {}", what, bytes.len())))
}

fn aead_parts<'a>(key: &'a [u8], nonce: &'a [u8]) -> Result<(ChaCha20Poly1305, &'a Nonce), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidInputError(format!("Invalid AEAD key length: {}", key.len())));
    }
    if nonce.len() != CHACHA_NONCE_LEN {
        return Err(CryptoError::InvalidInputError(format!("Invalid nonce length: {}", nonce.len())));
    }
    Ok((
        ChaCha20Poly1305::new(AeadKeyChacha::from_slice(key)),
        Nonce::from_slice(nonce),
    ))
}

impl CryptoProvider for ClassicSuiteProvider {
    type KemPublicKey = Vec<u8>;
    type KemPrivateKey = Vec<u8>;
    type SignaturePublicKey = Vec<u8>;
    type SignaturePrivateKey = Vec<u8>;
    type AeadKey = Vec<u8>;

    fn generate_kem_keys() -> Result<(Self::KemPrivateKey, Self::KemPublicKey), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = DhPublicKey::from(&private_key);
        Ok((private_key.to_bytes().to_vec(), public_key.to_bytes().to_vec()))
    }

    fn from_private_key_to_public_key(
        private_key: &Self::KemPrivateKey,
    ) -> Result<Self::KemPublicKey, CryptoError> {
        let bytes = as_key_bytes(private_key, "DH private key")?;
        let static_secret = StaticSecret::from(*bytes);
        Ok(DhPublicKey::from(&static_secret).to_bytes().to_vec())
    }

    fn kem_public_key_from_bytes(bytes: Vec<u8>) -> Self::KemPublicKey {
        bytes
    }

    fn kem_private_key_from_bytes(bytes: Vec<u8>) -> Self::KemPrivateKey {
        bytes
    }

    fn aead_key_from_bytes(bytes: Vec<u8>) -> Self::AeadKey {
        bytes
    }

    fn signature_public_key_from_bytes(bytes: Vec<u8>) -> Self::SignaturePublicKey {
        bytes
    }

    fn signature_private_key_from_bytes(bytes: Vec<u8>) -> Self::SignaturePrivateKey {
        bytes
    }

    fn generate_signature_keys(
    ) -> Result<(Self::SignaturePrivateKey, Self::SignaturePublicKey), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok((
            signing_key.to_bytes().to_vec(),
            verifying_key.to_bytes().to_vec(),
        ))
    }

    fn from_signature_private_to_public(
        private_key: &Self::SignaturePrivateKey,
    ) -> Result<Self::SignaturePublicKey, CryptoError> {
        let bytes = as_key_bytes(private_key, "signing key")?;
        let signing_key = SigningKey::from_bytes(bytes);
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn sign(private_key: &Self::SignaturePrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let bytes = as_key_bytes(private_key, "signing key")?;
        let signing_key = SigningKey::from_bytes(bytes);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(
        public_key: &Self::SignaturePublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let vk_bytes = as_key_bytes(public_key, "verifying key")?;
        let verifying_key = VerifyingKey::from_bytes(vk_bytes)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid verifying key: {}", e)))?;

        let sig_bytes: &[u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureVerificationError("Invalid signature length".to_string()))?;
        let signature_obj = Signature::from_bytes(sig_bytes);

        verifying_key
            .verify_strict(message, &signature_obj)
            .map_err(|e| CryptoError::SignatureVerificationError(e.to_string()))
    }

    fn dh(private_key: &Self::KemPrivateKey, public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(*as_key_bytes(private_key, "DH private key")?);
        let remote = DhPublicKey::from(*as_key_bytes(public_key, "DH public key")?);

        let shared_secret = secret.diffie_hellman(&remote);
        // Low-order точки дают нулевой секрет
        if !shared_secret.was_contributory() {
            return Err(CryptoError::InvalidInputError("Non-contributory DH public key".to_string()));
        }
        Ok(shared_secret.to_bytes().to_vec())
    }

    fn aead_encrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (cipher, nonce_ref) = aead_parts(key, nonce)?;
        let payload = Payload {
            msg: plaintext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .encrypt(nonce_ref, payload)
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))
    }

    fn aead_decrypt(
        key: &Self::AeadKey,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (cipher, nonce_ref) = aead_parts(key, nonce)?;
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data.unwrap_or(b""),
        };

        cipher
            .decrypt(nonce_ref, payload)
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))
    }

    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; len];
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn kdf_rk(
        root_key: &Self::AeadKey,
        dh_output: &[u8],
    ) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_ref()), dh_output);
        let mut output = vec![0u8; 2 * KEY_LEN];
        hkdf.expand(b"Double-Ratchet-Root-Key-Expansion", &mut output)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;

        let chain_key = output.split_off(KEY_LEN);
        Ok((output, chain_key))
    }

    fn kdf_ck(chain_key: &Self::AeadKey) -> Result<(Self::AeadKey, Self::AeadKey), CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(chain_key.as_ref()), b"");
        let mut output = vec![0u8; 2 * KEY_LEN];
        hkdf.expand(b"Double-Ratchet-Chain-Key-Expansion", &mut output)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;

        let next_chain = output.split_off(KEY_LEN);
        Ok((output, next_chain))
    }

    fn generate_nonce(len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::KeyGenerationError(e.to_string()))?;
        Ok(nonce_bytes)
    }

    fn suite_id() -> u16 {
        crate::config::Config::global().classic_suite_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_is_commutative() {
        let (a_priv, a_pub) = ClassicSuiteProvider::generate_kem_keys().unwrap();
        let (b_priv, b_pub) = ClassicSuiteProvider::generate_kem_keys().unwrap();

        let ab = ClassicSuiteProvider::dh(&a_priv, &b_pub).unwrap();
        let ba = ClassicSuiteProvider::dh(&b_priv, &a_pub).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_dh_rejects_low_order_point() {
        let (a_priv, _) = ClassicSuiteProvider::generate_kem_keys().unwrap();
        let result = ClassicSuiteProvider::dh(&a_priv, &[0u8; 32]);
        assert!(result.is_err());
    }

    #[test]
    fn test_aead_rejects_bad_key_length() {
        let nonce = vec![0u8; 12];
        let result = ClassicSuiteProvider::aead_encrypt(&vec![0u8; 16], &nonce, b"msg", None);
        assert!(matches!(result, Err(CryptoError::InvalidInputError(_))));
    }

    #[test]
    fn test_kdf_ck_advances_chain() {
        let chain = vec![7u8; 32];
        let (message_key, next_chain) = ClassicSuiteProvider::kdf_ck(&chain).unwrap();
        assert_ne!(message_key, next_chain);
        assert_ne!(next_chain, chain);
    }
}
