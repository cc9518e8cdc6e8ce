//! 观测性配置
//!
//! 可以直接构建，也可以从 `parley_config::Config` 转换得到。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 观测性配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 指标配置
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// 设置日志级别
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    /// 设置是否输出 JSON
    pub fn with_json_format(mut self, json: bool) -> Self {
        self.logging.json_format = json;
        self
    }

    /// 设置滚动日志目录
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logging.file_dir = Some(dir.into());
        self
    }

    /// 设置模块级别
    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.logging.module_levels.insert(module.into(), level.into());
        self
    }

    /// 启用 Prometheus 导出
    pub fn with_metrics_listener(mut self, addr: impl Into<String>) -> Self {
        self.metrics.enabled = true;
        self.metrics.listen = Some(addr.into());
        self
    }
}

impl From<&parley_config::Config> for Config {
    fn from(config: &parley_config::Config) -> Self {
        let logging = &config.logging;
        Self {
            logging: LoggingConfig {
                level: logging.level.as_str().to_string(),
                json_format: logging.json_format,
                file_dir: logging
                    .file
                    .as_deref()
                    .and_then(parley_config::expand_tilde),
                module_levels: logging
                    .module_levels
                    .iter()
                    .map(|(module, level)| (module.clone(), level.as_str().to_string()))
                    .collect(),
                ..LoggingConfig::default()
            },
            metrics: MetricsConfig {
                enabled: config.metrics.enabled,
                listen: config.metrics.listen.clone(),
            },
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（trace, debug, info, warn, error）或完整的 EnvFilter 表达式
    pub level: String,

    /// 是否使用 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 每日滚动日志文件所在目录
    #[serde(default)]
    pub file_dir: Option<PathBuf>,

    /// 模块级别的日志配置
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// 是否启用 ANSI 颜色
    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// 是否包含目标（target）
    #[serde(default = "default_true")]
    pub include_target: bool,

    /// 是否包含线程 ID
    #[serde(default)]
    pub include_thread_id: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_dir: None,
            module_levels: HashMap::new(),
            ansi_colors: true,
            include_target: true,
            include_thread_id: false,
        }
    }
}

/// 指标配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 是否安装 Prometheus recorder
    #[serde(default)]
    pub enabled: bool,

    /// 抓取端点监听地址；为空时只在进程内渲染
    #[serde(default)]
    pub listen: Option<String>,
}
