// Адреса устройств и payload'ы для collaborator'ов (REST, транспорт)

pub mod messages;

pub use messages::{
    DeviceAddress, InitialMessage, OneTimePreKeyPublic, PreKeyBundle, QuantumCiphertext,
    QuantumPreKeyPublic, RatchetEnvelope, SessionKey,
};
