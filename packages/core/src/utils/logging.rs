// Логирование security events
//
// Ротация identity, невалидные подписи, повторное использование ключей и
// деградация безопасности пишутся отдельным target, чтобы внешний audit
// collaborator мог их подписать на отдельный sink.

use std::fmt;
use tracing::warn;

/// Тип security event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    IdentityRotated,
    InvalidSignature,
    OneTimePreKeyReuse,
    ReplayDetected,
    /// Handshake без one-time prekey
    ReducedSecurityHandshake,
    /// Handshake без квантового KEM
    QuantumFallback,
    DeviceRevoked,
    SessionRevoked,
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityEvent::IdentityRotated => "identity_rotated",
            SecurityEvent::InvalidSignature => "invalid_signature",
            SecurityEvent::OneTimePreKeyReuse => "one_time_prekey_reuse",
            SecurityEvent::ReplayDetected => "replay_detected",
            SecurityEvent::ReducedSecurityHandshake => "reduced_security_handshake",
            SecurityEvent::QuantumFallback => "quantum_fallback",
            SecurityEvent::DeviceRevoked => "device_revoked",
            SecurityEvent::SessionRevoked => "session_revoked",
        };
        f.write_str(name)
    }
}

/// Записать security event
pub fn security_event(event: SecurityEvent, device: &str, detail: &str) {
    warn!(
        target: "security",
        event = %event,
        device = %device,
        detail = %detail,
        "Security event"
    );
}
