//! Реестр ключей устройств
//!
//! - [`IdentityRegistry`]: долговременная identity на (user, device)
//! - [`PreKeyStore`]: signed prekeys, one-time prekeys, prekey bundles
//!
//! ```text
//! create_identity ──→ IdentityKeyRecord (sealed X25519 + Ed25519 [+ ML-KEM])
//!        │
//!        ├─→ rotate_signed_prekey ──→ SignedPreKeyRecord (подписан identity)
//!        └─→ generate_one_time_prekeys ──→ OneTimePreKeyRecord × N
//!
//! get_prekey_bundle = identity + активный signed prekey + свободный OPK? + ML-KEM?
//! ```

pub mod identity;
pub mod prekeys;

pub use identity::{IdentityRegistry, IdentityRotation};
pub use prekeys::PreKeyStore;
