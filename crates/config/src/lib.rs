//! 统一配置中心
//!
//! 提供实时服务的全局配置管理，包括：
//! - 服务监听地址
//! - 数据库连接（可选，缺省时使用内存存储）
//! - JWT认证
//! - 实时层参数（超时、队列容量、心跳、输入状态 TTL）
//! - 各类动作的限流配额
//!
//! 加载顺序：默认值 -> 可选配置文件（APP_CONFIG_FILE）-> 环境变量（APP_*，`__` 分隔层级）

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// JWT认证配置
    #[serde(default)]
    pub jwt: JwtConfig,
    /// 实时层配置
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// 限流配置
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 未设置时使用进程内存储
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_minutes: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-key-not-for-production-use-minimum-32-chars".into(),
            expiration_minutes: 30,
        }
    }
}

/// 实时层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 单个接收方的发送超时
    pub send_timeout_ms: u64,
    /// 每个连接的出站队列容量
    pub outbound_queue_capacity: usize,
    /// 输入状态存活时间
    pub typing_ttl_secs: u64,
    /// 输入状态清理间隔，不得超过 TTL 的一半
    pub typing_sweep_interval_ms: u64,
    /// 服务端 ping 间隔（与客户端心跳间隔一致）
    pub ping_interval_secs: u64,
    /// 超过该时间未收到 pong 视为失活
    pub pong_deadline_secs: u64,
    /// 地点聊天要求的签到时间窗口
    pub place_chat_window_hours: i64,
    /// 每个用户的最大并发连接数
    pub max_sockets_per_user: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            outbound_queue_capacity: 64,
            typing_ttl_secs: 5,
            typing_sweep_interval_ms: 2_500,
            ping_interval_secs: 30,
            pong_deadline_secs: 60,
            place_chat_window_hours: 12,
            max_sockets_per_user: 10,
        }
    }
}

impl RealtimeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_deadline(&self) -> Duration {
        Duration::from_secs(self.pong_deadline_secs)
    }
}

/// 单类动作的配额：窗口内最多 `capacity` 次
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

impl BucketConfig {
    pub const fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            window_secs: 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub message: BucketConfig,
    pub typing: BucketConfig,
    pub reaction: BucketConfig,
    pub mark_read: BucketConfig,
    pub thread_creation: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: BucketConfig::per_minute(20),
            typing: BucketConfig::per_minute(60),
            reaction: BucketConfig::per_minute(30),
            mark_read: BucketConfig::per_minute(60),
            thread_creation: BucketConfig::per_minute(5),
        }
    }
}

impl AppConfig {
    /// 组装配置来源：默认值 -> APP_CONFIG_FILE -> APP_* 环境变量
    pub fn figment() -> Figment {
        let mut fig = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::prefixed("APP_").split("__"))
    }

    /// 加载并验证配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidServerPort(
                "port must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.database.url {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "Database URL cannot be empty".to_string(),
                ));
            }
            if self.database.max_connections == 0 {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "Max connections must be greater than 0".to_string(),
                ));
            }
        }

        // JWT密钥至少256位/32字节
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        let rt = &self.realtime;
        if rt.send_timeout_ms == 0 || rt.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidRealtimeConfig(
                "send timeout and outbound queue capacity must be greater than 0".to_string(),
            ));
        }
        if rt.typing_ttl_secs == 0 || rt.typing_sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidRealtimeConfig(
                "typing ttl and sweep interval must be greater than 0".to_string(),
            ));
        }
        if rt.typing_sweep_interval() > rt.typing_ttl() / 2 {
            return Err(ConfigError::InvalidRealtimeConfig(
                "typing sweep interval must not exceed half of the typing ttl".to_string(),
            ));
        }
        if rt.ping_interval_secs == 0 || rt.pong_deadline_secs < rt.ping_interval_secs {
            return Err(ConfigError::InvalidRealtimeConfig(
                "pong deadline must be at least one ping interval".to_string(),
            ));
        }
        if rt.place_chat_window_hours <= 0 || rt.max_sockets_per_user == 0 {
            return Err(ConfigError::InvalidRealtimeConfig(
                "place chat window and socket cap must be positive".to_string(),
            ));
        }

        let limits = &self.rate_limits;
        for (name, bucket) in [
            ("message", limits.message),
            ("typing", limits.typing),
            ("reaction", limits.reaction),
            ("mark_read", limits.mark_read),
            ("thread_creation", limits.thread_creation),
        ] {
            if bucket.capacity == 0 || bucket.window_secs == 0 {
                return Err(ConfigError::InvalidRateLimit(name.to_string()));
            }
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid server port: {0}")]
    InvalidServerPort(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid realtime configuration: {0}")]
    InvalidRealtimeConfig(String),
    #[error("Invalid rate limit for '{0}': capacity and window must be greater than 0")]
    InvalidRateLimit(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.realtime.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.realtime.outbound_queue_capacity, 64);
        assert_eq!(config.realtime.pong_deadline_secs, 2 * config.realtime.ping_interval_secs);
        assert_eq!(config.rate_limits.message, BucketConfig::per_minute(20));
        assert_eq!(config.rate_limits.thread_creation, BucketConfig::per_minute(5));
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_sweep_interval_must_not_exceed_half_ttl() {
        let mut config = AppConfig::default();
        config.realtime.typing_sweep_interval_ms = 3_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRealtimeConfig(_))
        ));
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let mut config = AppConfig::default();
        config.jwt.secret = "short".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidJwtSecret(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = AppConfig::default();
        config.rate_limits.reaction.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reaction"));
    }

    #[test]
    fn test_env_and_file_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "realtime.toml",
                r#"
                [realtime]
                send_timeout_ms = 1500
                place_chat_window_hours = 6
                "#,
            )?;
            jail.set_env("APP_CONFIG_FILE", "realtime.toml");
            jail.set_env("APP_SERVER__PORT", "9090");
            jail.set_env("APP_RATE_LIMITS__MESSAGE__CAPACITY", "5");

            let config = AppConfig::load().expect("config should load");
            assert_eq!(config.server.port, 9090);
            assert_eq!(config.realtime.send_timeout_ms, 1500);
            assert_eq!(config.realtime.place_chat_window_hours, 6);
            assert_eq!(config.realtime.outbound_queue_capacity, 64);
            assert_eq!(config.rate_limits.message.capacity, 5);
            assert_eq!(config.rate_limits.message.window_secs, 60);
            Ok(())
        });
    }
}
