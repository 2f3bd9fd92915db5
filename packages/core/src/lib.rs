// Construct E2EE Core
// Ключи устройств, установка сессий и распределение ключей бесед

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod utils;

// Re-exports для удобства
pub use api::{KeyService, PublishedDevice};
pub use config::{Config, QuantumPolicy};
pub use conversation::{ConversationCiphertext, ConversationKey, ConversationKeyring, DistributionReport};
pub use crypto::master_key::SealingKey;
pub use crypto::quantum::QuantumAlgorithm;
pub use lifecycle::{KeyLifecycleManager, RevocationReport, RotationReport};
pub use protocol::{DeviceAddress, InitialMessage, PreKeyBundle, RatchetEnvelope, SessionKey};
pub use session::{BundleSource, EstablishedSession, OutboundMessage};
pub use storage::models::SessionState;
pub use storage::{KeyStore, MemoryStorage};
pub use utils::error::{ConstructError, Result};
pub use utils::time::{Clock, ManualClock, SystemClock};
