//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          session / conversation / lifecycle                 │
//! │  - HandshakeCoordinator, RatchetSessions, Distributor       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │   X3DH (+ ML-KEM)         │  │  Double Ratchet          │
//! │  - Ephemeral keys         │  │  - Forward secrecy       │
//! │  - One-time prekeys       │  │  - Break-in recovery     │
//! │  - Root key derivation    │  │  - Skip window           │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                └─────────────┬─────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              CryptoProvider (Crypto-Agility)                │
//! │  - DH (X25519)                                              │
//! │  - Signatures (Ed25519)                                     │
//! │  - AEAD (ChaCha20-Poly1305)                                 │
//! │  - KDF (HKDF-SHA256)                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`provider`]: CryptoProvider trait
//! - [`suites`]: реализации CryptoProvider
//! - [`quantum`]: QuantumEncapsulator (ML-KEM)
//! - [`handshake`]: X3DH
//! - [`messaging`]: Double Ratchet
//! - [`keys`]: генерация ключей устройства
//! - [`master_key`]: sealing приватного материала at rest

pub mod provider;

pub mod handshake;

pub mod messaging;

pub mod suites;

pub mod quantum;

pub mod keys;

pub mod master_key;

pub use provider::CryptoProvider;

pub type SuiteID = u16;

/// Suite ID for the classic suite
pub const CLASSIC_SUITE_ID: SuiteID = 1;

/// Набор, которым работают все компоненты крейта
pub type Suite = suites::classic::ClassicSuiteProvider;
