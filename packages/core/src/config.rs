//! Централизованная конфигурация для Construct E2EE Core
//!
//! Все константы и политики протокола определены здесь,
//! чтобы избежать хардкода по всему проекту.

use crate::crypto::quantum::QuantumAlgorithm;
use std::sync::OnceLock;

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Что делать, если квантовый KEM собеседника не поддерживается локально
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumPolicy {
    /// Продолжить только с классическим X3DH (логируется как деградация)
    PreferHybrid,
    /// Прервать handshake с `UnsupportedAlgorithm`
    RequireHybrid,
    /// Не использовать KEM даже если он опубликован
    ClassicOnly,
}

impl QuantumPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "prefer" | "prefer_hybrid" => Some(Self::PreferHybrid),
            "require" | "require_hybrid" => Some(Self::RequireHybrid),
            "classic" | "classic_only" => Some(Self::ClassicOnly),
            _ => None,
        }
    }
}

/// Основная структура конфигурации
#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// PBKDF2: количество итераций для деривации sealing-ключа из пароля
    pub pbkdf2_iterations: u32,

    /// Длина соли для PBKDF2 (в байтах)
    pub salt_length: usize,

    /// Длина симметричного ключа (в байтах)
    pub key_length: usize,

    /// Длина nonce для AES-GCM (в байтах)
    pub nonce_length: usize,

    /// Длина nonce для ChaCha20Poly1305 (в байтах)
    pub chacha_nonce_length: usize,

    /// ID классического криптографического набора (Classic Suite)
    pub classic_suite_id: u16,

    // ============================================
    // DOUBLE RATCHET ПАРАМЕТРЫ
    // ============================================

    /// Окно пропуска: максимальное количество сохранённых skipped message keys
    pub max_skipped_messages: u32,

    /// Максимальный возраст пропущенных ключей сообщений (в секундах)
    /// По умолчанию: 7 дней
    pub max_skipped_message_age_seconds: i64,

    /// Сессия без активности дольше этого периода отзывается (в секундах)
    pub session_max_idle_secs: i64,

    // ============================================
    // PREKEYS
    // ============================================

    /// Время жизни signed prekey (в секундах). По умолчанию: 30 дней
    pub signed_prekey_lifetime_secs: i64,

    /// За сколько до истечения signed prekey ротируется (в секундах)
    pub signed_prekey_rotation_lead_secs: i64,

    /// Ниже этого количества неиспользованных one-time prekeys пул пополняется
    pub one_time_prekey_low_water: usize,

    /// Размер пула после пополнения
    pub one_time_prekey_batch: usize,

    /// Время жизни one-time prekey (в секундах). По умолчанию: 90 дней
    pub one_time_prekey_lifetime_secs: i64,

    /// Grace period после истечения, по прошествии которого prekeys удаляются
    /// По умолчанию: 30 дней
    pub prekey_cleanup_period_secs: i64,

    // ============================================
    // HANDSHAKE
    // ============================================

    /// Таймаут получения prekey bundle (в миллисекундах)
    pub handshake_timeout_ms: u64,

    /// Сколько раз перезапрашивать bundle, если one-time prekey заняли конкуренты
    pub handshake_prekey_retries: u32,

    /// Политика для квантового KEM
    pub quantum_policy: QuantumPolicy,

    /// Алгоритм для новых quantum-capable identity
    pub default_quantum_algorithm: QuantumAlgorithm,

    /// Локально поддерживаемые KEM алгоритмы
    pub supported_quantum_algorithms: Vec<QuantumAlgorithm>,

    // ============================================
    // КЛЮЧИ БЕСЕД
    // ============================================

    /// Время жизни conversation key bundle (в секундах). По умолчанию: 90 дней
    pub conversation_key_lifetime_secs: i64,

    /// Период фоновой ротации (в секундах)
    pub rotation_interval_secs: u64,
}

impl Config {
    /// Создать конфигурацию с дефолтными значениями
    pub fn default() -> Self {
        Self {
            // Криптография
            pbkdf2_iterations: 100_000,
            salt_length: 32,
            key_length: 32,
            nonce_length: 12,
            chacha_nonce_length: 12,
            classic_suite_id: 1,

            // Double Ratchet
            max_skipped_messages: 1000,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60, // 7 days
            session_max_idle_secs: 90 * 24 * 60 * 60,          // 90 days

            // Prekeys
            signed_prekey_lifetime_secs: 30 * 24 * 60 * 60, // 30 days
            signed_prekey_rotation_lead_secs: 2 * 24 * 60 * 60, // 2 days
            one_time_prekey_low_water: 20,
            one_time_prekey_batch: 100,
            one_time_prekey_lifetime_secs: 90 * 24 * 60 * 60, // 90 days
            prekey_cleanup_period_secs: 30 * 24 * 60 * 60,    // 30 days

            // Handshake
            handshake_timeout_ms: 10_000,
            handshake_prekey_retries: 3,
            quantum_policy: QuantumPolicy::PreferHybrid,
            default_quantum_algorithm: QuantumAlgorithm::MlKem768,
            supported_quantum_algorithms: vec![
                QuantumAlgorithm::MlKem768,
                QuantumAlgorithm::MlKem1024,
            ],

            // Ключи бесед
            conversation_key_lifetime_secs: 90 * 24 * 60 * 60, // 90 days
            rotation_interval_secs: 60 * 60,                    // 1 hour
        }
    }

    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Переопределяем значения из env, если они заданы
        if let Some(parsed) = env_parse("MAX_SKIPPED_MESSAGES") {
            config.max_skipped_messages = parsed;
        }

        if let Some(parsed) = env_parse("MAX_SKIPPED_MESSAGE_AGE_SECONDS") {
            config.max_skipped_message_age_seconds = parsed;
        }

        if let Some(parsed) = env_parse("PBKDF2_ITERATIONS") {
            config.pbkdf2_iterations = parsed;
        }

        if let Some(parsed) = env_parse("HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout_ms = parsed;
        }

        if let Some(parsed) = env_parse("ONE_TIME_PREKEY_LOW_WATER") {
            config.one_time_prekey_low_water = parsed;
        }

        if let Some(parsed) = env_parse("ONE_TIME_PREKEY_BATCH") {
            config.one_time_prekey_batch = parsed;
        }

        if let Some(parsed) = env_parse("SIGNED_PREKEY_LIFETIME_SECS") {
            config.signed_prekey_lifetime_secs = parsed;
        }

        if let Ok(val) = std::env::var("QUANTUM_POLICY") {
            match QuantumPolicy::parse(&val) {
                Some(policy) => config.quantum_policy = policy,
                None => tracing::warn!(target: "config", value = %val, "Unknown QUANTUM_POLICY, keeping default"),
            }
        }

        config
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Зафиксировать дефолтную глобальную конфигурацию
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init() -> Result<(), &'static str> {
        Self::init_with(Self::default())
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(config)
            .map_err(|_| "Config already initialized")
    }

    pub fn is_quantum_supported(&self, algorithm: QuantumAlgorithm) -> bool {
        algorithm.is_compiled_in() && self.supported_quantum_algorithms.contains(&algorithm)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::default()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pbkdf2_iterations, 100_000);
        assert_eq!(config.max_skipped_messages, 1000);
        assert_eq!(config.one_time_prekey_low_water, 20);
        assert_eq!(config.quantum_policy, QuantumPolicy::PreferHybrid);
    }

    #[test]
    fn test_policy_values() {
        let config = Config::default();

        // Prekeys
        assert!(config.signed_prekey_rotation_lead_secs < config.signed_prekey_lifetime_secs);
        assert!(config.one_time_prekey_low_water < config.one_time_prekey_batch);

        // Handshake
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.default_quantum_algorithm, QuantumAlgorithm::MlKem768);
    }

    #[test]
    fn test_quantum_policy_parse() {
        assert_eq!(QuantumPolicy::parse("require"), Some(QuantumPolicy::RequireHybrid));
        assert_eq!(QuantumPolicy::parse("Classic_Only"), Some(QuantumPolicy::ClassicOnly));
        assert_eq!(QuantumPolicy::parse("whatever"), None);
    }
}
