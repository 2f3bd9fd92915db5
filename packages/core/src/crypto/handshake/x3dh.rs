//! X3DH (Extended Triple Diffie-Hellman) Protocol
//!
//! ## Обзор
//!
//! X3DH обеспечивает:
//! - **Forward Secrecy**: Ephemeral keys для каждой сессии
//! - **Cryptographic Deniability**: Подписи только на долгосрочных ключах
//! - **Asynchronous**: Bob может быть offline
//!
//! ## Ключи
//!
//! ### Alice (инициатор)
//! - **IK_A**: Identity Key (долгосрочный)
//! - **EK_A**: Ephemeral Key (одноразовый, генерируется для каждой сессии)
//!
//! ### Bob (получатель)
//! - **IK_B**: Identity Key (долгосрочный)
//! - **SPK_B**: Signed Prekey (среднесрочный, ротируется)
//! - **OPK_B**: One-Time Prekey (одноразовый, может отсутствовать)
//! - **PQ_B**: ML-KEM public key (опционально)
//!
//! ## Протокол
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)          // если есть OPK_B
//! SS  = ML-KEM.Encaps(PQ_B).ss     // если есть PQ_B
//!
//! SK = HKDF(salt = 0^32,
//!           ikm  = 0xFF^32 || DH1 || DH2 || DH3 [|| DH4] [|| SS],
//!           info = "Construct-X3DH-Hybrid-v1" | "Construct-X3DH-v1")
//! ```
//!
//! Bob вычисляет те же DH в обратном порядке: DH(a, B) = DH(b, A).

use crate::crypto::handshake::{InitiatorState, LocalPreKeys, RemotePreKeys, RootKey};
use crate::crypto::provider::CryptoProvider;
use crate::utils::error::{ConstructError, Result};
use std::marker::PhantomData;
use tracing::{debug, trace};
use zeroize::Zeroizing;

const ROOT_KEY_LEN: usize = 32;
const INFO_CLASSIC: &[u8] = b"Construct-X3DH-v1";
const INFO_HYBRID: &[u8] = b"Construct-X3DH-Hybrid-v1";

/// X3DH Protocol Implementation
///
/// Stateless struct - все данные передаются через параметры методов.
pub struct X3DHProtocol<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> X3DHProtocol<P> {
    /// Проверить подпись над публичным ключом prekey
    ///
    /// Это trust anchor: ошибка всегда `InvalidSignature`, fallback не допускается.
    pub fn verify_prekey_signature(
        verifying_key: &[u8],
        prekey_public: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let verifying_key = P::signature_public_key_from_bytes(verifying_key.to_vec());
        P::verify(&verifying_key, prekey_public, signature).map_err(|e| {
            debug!(target: "crypto::x3dh", error = %e, "Signature verification failed");
            ConstructError::InvalidSignature(e.to_string())
        })
    }

    /// Выполнить handshake как инициатор (Alice)
    ///
    /// Подпись SPK_B должна быть проверена до вызова.
    /// `quantum_secret` это shared secret после `encapsulate`, если у Bob есть PQ ключ.
    ///
    /// # Возвращает
    /// - `RootKey`: общий секрет для Double Ratchet
    /// - `InitiatorState`: содержит ephemeral_private (первый DH ratchet key)
    pub fn perform_as_initiator(
        local_identity: &P::KemPrivateKey,
        remote: &RemotePreKeys<'_>,
        quantum_secret: Option<&[u8]>,
    ) -> Result<(RootKey, InitiatorState<P>)> {
        debug!(
            target: "crypto::x3dh",
            with_one_time_prekey = remote.one_time_prekey_public.is_some(),
            hybrid = quantum_secret.is_some(),
            "Starting X3DH as initiator"
        );

        // Ephemeral key для этой сессии (Forward Secrecy)
        let (ephemeral_private, ephemeral_public) = P::generate_kem_keys()?;
        trace!(
            target: "crypto::x3dh",
            ephemeral_public_len = ephemeral_public.as_ref().len(),
            "Ephemeral key generated"
        );

        let dh1 = Zeroizing::new(P::dh(local_identity, remote.signed_prekey_public)?);
        let dh2 = Zeroizing::new(P::dh(&ephemeral_private, remote.identity_public)?);
        let dh3 = Zeroizing::new(P::dh(&ephemeral_private, remote.signed_prekey_public)?);
        let dh4 = remote
            .one_time_prekey_public
            .map(|opk| P::dh(&ephemeral_private, opk).map(Zeroizing::new))
            .transpose()?;

        let root_key = Self::derive_root_key(&dh1, &dh2, &dh3, dh4.as_deref().map(Vec::as_slice), quantum_secret)?;

        debug!(target: "crypto::x3dh", "X3DH completed as initiator");

        Ok((root_key, InitiatorState { ephemeral_private }))
    }

    /// Выполнить handshake как получатель (Bob)
    ///
    /// `remote_identity` это IK_A, `remote_ephemeral` это EK_A из InitialMessage.
    pub fn perform_as_responder(
        local: &LocalPreKeys<'_, P>,
        remote_identity: &[u8],
        remote_ephemeral: &[u8],
        quantum_secret: Option<&[u8]>,
    ) -> Result<RootKey> {
        debug!(
            target: "crypto::x3dh",
            with_one_time_prekey = local.one_time_prekey_private.is_some(),
            hybrid = quantum_secret.is_some(),
            "Starting X3DH as responder"
        );

        // DH1 = DH(SPK_B, IK_A)
        let dh1 = Zeroizing::new(P::dh(local.signed_prekey_private, remote_identity)?);
        // DH2 = DH(IK_B, EK_A)
        let dh2 = Zeroizing::new(P::dh(local.identity_private, remote_ephemeral)?);
        // DH3 = DH(SPK_B, EK_A)
        let dh3 = Zeroizing::new(P::dh(local.signed_prekey_private, remote_ephemeral)?);
        // DH4 = DH(OPK_B, EK_A)
        let dh4 = local
            .one_time_prekey_private
            .map(|opk| P::dh(opk, remote_ephemeral).map(Zeroizing::new))
            .transpose()?;

        let root_key = Self::derive_root_key(&dh1, &dh2, &dh3, dh4.as_deref().map(Vec::as_slice), quantum_secret)?;

        debug!(target: "crypto::x3dh", "X3DH completed as responder");

        Ok(root_key)
    }

    fn derive_root_key(
        dh1: &[u8],
        dh2: &[u8],
        dh3: &[u8],
        dh4: Option<&[u8]>,
        quantum_secret: Option<&[u8]>,
    ) -> Result<RootKey> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 6));
        ikm.extend_from_slice(&[0xFF; 32]);
        ikm.extend_from_slice(dh1);
        ikm.extend_from_slice(dh2);
        ikm.extend_from_slice(dh3);
        if let Some(dh4) = dh4 {
            ikm.extend_from_slice(dh4);
        }
        let info = match quantum_secret {
            Some(ss) => {
                ikm.extend_from_slice(ss);
                INFO_HYBRID
            }
            None => INFO_CLASSIC,
        };

        let root_key = P::hkdf_derive_key(&[0u8; 32], &ikm, info, ROOT_KEY_LEN)?;
        Ok(Zeroizing::new(root_key))
    }
}
