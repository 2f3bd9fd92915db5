//! Установка и продвижение pairwise сессий
//!
//! - [`HandshakeCoordinator`]: X3DH (+ ML-KEM) между двумя устройствами
//! - [`RatchetSessions`]: Double Ratchet состояние на 4-tuple, с блокировкой на tuple
//!
//! ```text
//! initiate(A, B)                                   accept(B, InitialMessage)
//!   fetch_bundle(B)  ─┐ timeout                      take OPK_B private (one-shot)
//!   verify SPK sig    │                              decapsulate(ct)?
//!   claim OPK_B      ─┘                              X3DH responder → root
//!   encapsulate?                                     SessionRecord(B → A, Established)
//!   X3DH initiator → root
//!   SessionRecord(A → B, Established, pending InitialMessage)
//! ```

pub mod handshake;
pub mod ratchet;

pub use handshake::{EstablishedSession, HandshakeCoordinator};
pub use ratchet::{OutboundMessage, RatchetSessions};

use crate::crypto::master_key::SealingKey;
use crate::crypto::messaging::{DoubleRatchetSession, RatchetLimits, SerializableSession};
use crate::crypto::Suite;
use crate::protocol::{DeviceAddress, PreKeyBundle, SessionKey};
use crate::registry::PreKeyStore;
use crate::storage::models::SessionRecord;
use crate::storage::KeyStore;
use crate::utils::error::Result;
use crate::utils::serialization::{from_bytes, to_bytes};
use async_trait::async_trait;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Откуда инициатор берёт prekey bundle собеседника
///
/// Обычно это удалённый collaborator (REST), поэтому вызовы асинхронные
/// и оборачиваются в таймаут handshake.
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle>;

    /// Claim предложенного one-time prekey
    ///
    /// # Errors
    /// `AlreadyUsed` если ключ уже забрал другой инициатор
    async fn claim_one_time_prekey(&self, address: &DeviceAddress, key_id: u32) -> Result<()>;
}

/// BundleSource поверх локального PreKeyStore
#[derive(Clone)]
pub struct LocalBundleSource<S: KeyStore> {
    prekeys: PreKeyStore<S>,
}

impl<S: KeyStore> LocalBundleSource<S> {
    pub fn new(prekeys: PreKeyStore<S>) -> Self {
        Self { prekeys }
    }
}

#[async_trait]
impl<S: KeyStore> BundleSource for LocalBundleSource<S> {
    async fn fetch_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle> {
        self.prekeys.get_prekey_bundle(address)
    }

    async fn claim_one_time_prekey(&self, address: &DeviceAddress, key_id: u32) -> Result<()> {
        self.prekeys.consume_one_time_prekey(address, Some(key_id)).map(|_| ())
    }
}

fn state_context(key: &SessionKey, session_id: Uuid) -> Vec<u8> {
    key.local.context(&format!("session-{}-{}", key.remote, session_id))
}

/// Sealed bincode(SerializableSession)
pub(crate) fn seal_state(
    sealing: &SealingKey,
    key: &SessionKey,
    session_id: Uuid,
    session: &DoubleRatchetSession<Suite>,
) -> Result<Vec<u8>> {
    let serialized = Zeroizing::new(to_bytes(&session.to_serializable())?);
    sealing.seal(&serialized, &state_context(key, session_id))
}

pub(crate) fn open_state(
    sealing: &SealingKey,
    record: &SessionRecord,
    limits: RatchetLimits,
) -> Result<DoubleRatchetSession<Suite>> {
    let serialized = sealing.open(&record.sealed_state, &state_context(&record.key, record.session_id))?;
    let state: SerializableSession = from_bytes(&serialized)?;
    DoubleRatchetSession::from_serializable(&state, limits)
}
