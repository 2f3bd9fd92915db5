//! Криптографические наборы (Crypto Suites)
//!
//! Этот модуль содержит реализации CryptoProvider trait.
//!
//! ## Доступные наборы
//!
//! ### Classic Suite
//! - **DH**: X25519 (ECDH на Curve25519)
//! - **Signatures**: Ed25519
//! - **AEAD**: ChaCha20-Poly1305
//! - **KDF**: HKDF-SHA256
//! - **Suite ID**: 1
//!
//! Post-quantum часть (ML-KEM) не является отдельным suite: она добавляется
//! поверх классического X3DH через [`crate::crypto::quantum::QuantumEncapsulator`].
//!
//! ```rust
//! use construct_e2ee::crypto::suites::classic::ClassicSuiteProvider;
//! use construct_e2ee::crypto::provider::CryptoProvider;
//!
//! type MySuite = ClassicSuiteProvider;
//!
//! let (private_key, public_key) = MySuite::generate_kem_keys().unwrap();
//! assert_eq!(MySuite::from_private_key_to_public_key(&private_key).unwrap(), public_key);
//! ```

pub mod classic;
