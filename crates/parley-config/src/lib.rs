//! Parley 配置：JSON 配置树及其管理器。

pub mod config;
pub mod manager;

pub use config::{
    Config, ConfigError, ConfigResult, GatewayConfig, LlmConfig, LogLevel, LoggingConfig,
    MemoryConfig, MetricsConfig, QueueConfig, ServerConfig, StorageConfig, StorageType, WorkerConfig,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// 获取 Parley 数据目录路径
pub fn parley_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley"))
}

/// 获取默认配置文件路径
pub fn default_config_path() -> Option<PathBuf> {
    parley_dir().map(|dir| dir.join("config.json"))
}

/// 获取默认 sessions 目录
pub fn default_sessions_dir() -> Option<PathBuf> {
    parley_dir().map(|dir| dir.join("sessions"))
}

/// 获取默认日志目录
pub fn default_log_dir() -> Option<PathBuf> {
    parley_dir().map(|dir| dir.join("logs"))
}

/// 初始化 Parley 目录结构
pub async fn init_parley_dirs() -> ConfigResult<()> {
    if let Some(root) = parley_dir() {
        tokio::fs::create_dir_all(root.join("sessions")).await?;
        tokio::fs::create_dir_all(root.join("logs")).await?;
    }
    Ok(())
}

/// 展开路径中的 ~ 为用户主目录
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
