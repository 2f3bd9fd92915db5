// Сериализация
//
// bincode для внутреннего состояния (ratchet state, sealed blobs),
// JSON для payload'ов, которые уходят collaborator'ам.

use crate::utils::error::{ConstructError, Result};
use serde::{Deserialize, Serialize};

pub fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    bincode::serialize(data)
        .map_err(|e| ConstructError::SerializationError(format!("Serialization failed: {}", e)))
}

pub fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| ConstructError::SerializationError(format!("Deserialization failed: {}", e)))
}

pub fn to_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string(data)
        .map_err(|e| ConstructError::SerializationError(format!("JSON encode failed: {}", e)))
}

pub fn from_json<T: for<'de> Deserialize<'de>>(json: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| ConstructError::SerializationError(format!("JSON decode failed: {}", e)))
}
