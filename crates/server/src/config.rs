/// 配置管理

use common::models::constants;
use serde::Deserialize;

/// 迁移编排相关配置
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// 自动模式下单轮同步低于该字节数即执行 switch
    pub sync_threshold_bytes: u64,
    /// 自动模式最多同步轮数
    pub max_auto_syncs: u32,
    /// estimate 使用的传输速率 (bytes/s)
    pub transfer_rate_bytes: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sync_threshold_bytes: constants::DEFAULT_SYNC_THRESHOLD_BYTES,
            max_auto_syncs: constants::DEFAULT_MAX_AUTO_SYNCS,
            transfer_rate_bytes: constants::DEFAULT_TRANSFER_RATE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_port: u16,
    /// 未配置时使用内存存储
    pub database_url: Option<String>,
    pub log_level: String,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_check_secs: u64,
    pub migration: MigrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: constants::DEFAULT_SERVER_PORT,
            database_url: None,
            log_level: "debug".to_string(),
            heartbeat_timeout_secs: constants::DEFAULT_NODE_TIMEOUT,
            heartbeat_check_secs: constants::DEFAULT_HEARTBEAT_INTERVAL,
            migration: MigrationConfig::default(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let server_port = env_or("SERVER_PORT", constants::DEFAULT_SERVER_PORT)?;

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let log_level = std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "debug".to_string());

        let heartbeat_timeout_secs = env_or("AGENT_HEARTBEAT_TIMEOUT_SECS", constants::DEFAULT_NODE_TIMEOUT)?;
        let heartbeat_check_secs = env_or("AGENT_HEARTBEAT_CHECK_SECS", constants::DEFAULT_HEARTBEAT_INTERVAL)?;

        let defaults = MigrationConfig::default();
        let migration = MigrationConfig {
            sync_threshold_bytes: env_or("MIGRATION_SYNC_THRESHOLD_BYTES", defaults.sync_threshold_bytes)?,
            max_auto_syncs: env_or("MIGRATION_MAX_AUTO_SYNCS", defaults.max_auto_syncs)?,
            transfer_rate_bytes: env_or("MIGRATION_TRANSFER_RATE_BYTES", defaults.transfer_rate_bytes)?,
        };

        if migration.max_auto_syncs == 0 {
            anyhow::bail!("MIGRATION_MAX_AUTO_SYNCS 必须大于 0");
        }

        Ok(Self {
            server_port,
            database_url,
            log_level,
            heartbeat_timeout_secs,
            heartbeat_check_secs,
            migration,
        })
    }
}

/// 读取并解析环境变量，缺省时使用默认值
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("环境变量 {} 无效 ({}): {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}
