use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            memory: MemoryConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

fn parse_bool(value: &str) -> ConfigResult<bool> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid boolean: {}", value)))
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "host"] => Some(self.server.host.clone()),
            ["gateway", "bind"] => Some(self.gateway.bind.clone()),
            ["gateway", "auth_token"] => self.gateway.auth_token.clone(),
            ["gateway", "max_connections"] => Some(self.gateway.max_connections.to_string()),
            ["gateway", "heartbeat_interval_secs"] => {
                Some(self.gateway.heartbeat_interval_secs.to_string())
            }
            ["memory", "window_size"] => Some(self.memory.window_size.to_string()),
            ["memory", "window_ttl_secs"] => Some(self.memory.window_ttl_secs.to_string()),
            ["memory", "embed_threshold"] => Some(self.memory.embed_threshold.to_string()),
            ["memory", "recent_strategy_min"] => Some(self.memory.recent_strategy_min.to_string()),
            ["memory", "semantic_strategy_min"] => {
                Some(self.memory.semantic_strategy_min.to_string())
            }
            ["memory", "recall_top_k"] => Some(self.memory.recall_top_k.to_string()),
            ["queue", "default_attempts"] => Some(self.queue.default_attempts.to_string()),
            ["queue", "backoff_base_ms"] => Some(self.queue.backoff_base_ms.to_string()),
            ["queue", "keep_completed"] => Some(self.queue.keep_completed.to_string()),
            ["queue", "keep_failed"] => Some(self.queue.keep_failed.to_string()),
            ["queue", "turn_priority"] => Some(self.queue.turn_priority.to_string()),
            ["worker", "concurrency"] => Some(self.worker.concurrency.to_string()),
            ["worker", "job_timeout_secs"] => Some(self.worker.job_timeout_secs.to_string()),
            ["worker", "system_prompt"] => self.worker.system_prompt.clone(),
            ["worker", "stream_agent_responses"] => {
                Some(self.worker.stream_agent_responses.to_string())
            }
            ["llm", "base_url"] => Some(self.llm.base_url.clone()),
            ["llm", "model"] => Some(self.llm.model.clone()),
            ["llm", "embedding_model"] => Some(self.llm.embedding_model.clone()),
            ["llm", "api_key_env"] => Some(self.llm.api_key_env.clone()),
            ["llm", "timeout_seconds"] => Some(self.llm.timeout_seconds.to_string()),
            ["storage", "type"] => Some(format!("{:?}", self.storage.storage_type)),
            ["storage", "path"] => self.storage.path.clone(),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            ["logging", "file"] => self.logging.file.clone(),
            ["metrics", "enabled"] => Some(self.metrics.enabled.to_string()),
            ["metrics", "listen"] => self.metrics.listen.clone(),
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "host"] => self.server.host = value.to_string(),
            ["gateway", "bind"] => self.gateway.bind = value.to_string(),
            ["gateway", "auth_token"] => self.gateway.auth_token = Some(value.to_string()),
            ["gateway", "max_connections"] => self.gateway.max_connections = parse_number(value)?,
            ["gateway", "heartbeat_interval_secs"] => {
                self.gateway.heartbeat_interval_secs = parse_number(value)?
            }
            ["memory", "window_size"] => self.memory.window_size = parse_number(value)?,
            ["memory", "window_ttl_secs"] => self.memory.window_ttl_secs = parse_number(value)?,
            ["memory", "embed_threshold"] => self.memory.embed_threshold = parse_number(value)?,
            ["memory", "recent_strategy_min"] => {
                self.memory.recent_strategy_min = parse_number(value)?
            }
            ["memory", "semantic_strategy_min"] => {
                self.memory.semantic_strategy_min = parse_number(value)?
            }
            ["memory", "recall_top_k"] => self.memory.recall_top_k = parse_number(value)?,
            ["queue", "default_attempts"] => self.queue.default_attempts = parse_number(value)?,
            ["queue", "backoff_base_ms"] => self.queue.backoff_base_ms = parse_number(value)?,
            ["queue", "keep_completed"] => self.queue.keep_completed = parse_number(value)?,
            ["queue", "keep_failed"] => self.queue.keep_failed = parse_number(value)?,
            ["queue", "turn_priority"] => self.queue.turn_priority = parse_number(value)?,
            ["worker", "concurrency"] => self.worker.concurrency = parse_number(value)?,
            ["worker", "job_timeout_secs"] => self.worker.job_timeout_secs = parse_number(value)?,
            ["worker", "system_prompt"] => self.worker.system_prompt = Some(value.to_string()),
            ["worker", "stream_agent_responses"] => {
                self.worker.stream_agent_responses = parse_bool(value)?
            }
            ["llm", "base_url"] => self.llm.base_url = value.to_string(),
            ["llm", "model"] => self.llm.model = value.to_string(),
            ["llm", "embedding_model"] => self.llm.embedding_model = value.to_string(),
            ["llm", "api_key_env"] => self.llm.api_key_env = value.to_string(),
            ["llm", "timeout_seconds"] => self.llm.timeout_seconds = parse_number(value)?,
            ["storage", "path"] => self.storage.path = Some(value.to_string()),
            ["logging", "level"] => self.logging.level = value.parse()?,
            ["logging", "json_format"] => self.logging.json_format = parse_bool(value)?,
            ["logging", "file"] => self.logging.file = Some(value.to_string()),
            ["metrics", "enabled"] => self.metrics.enabled = parse_bool(value)?,
            ["metrics", "listen"] => self.metrics.listen = Some(value.to_string()),
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

/// Server 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
        }
    }
}

/// WebSocket gateway 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub bind: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
            auth_token: None,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
        }
    }
}

/// 分层记忆配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// 每个会话在快速层保留的消息数
    pub window_size: usize,
    /// 快速层空闲多久后整体过期
    pub window_ttl_secs: u64,
    /// 每 n 条消息写入一次归档
    pub embed_threshold: usize,
    /// 消息数超过该值时使用最近窗口
    pub recent_strategy_min: usize,
    /// 消息数超过该值时使用语义召回
    pub semantic_strategy_min: usize,
    pub recall_top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            window_ttl_secs: 24 * 60 * 60,
            embed_threshold: 10,
            recent_strategy_min: 10,
            semantic_strategy_min: 50,
            recall_top_k: 5,
        }
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub default_attempts: u32,
    pub backoff_base_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// 交互式对话轮次的优先级
    pub turn_priority: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: 3,
            backoff_base_ms: 2000,
            keep_completed: 100,
            keep_failed: 50,
            turn_priority: 10,
        }
    }
}

/// Generation worker 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Agent 回复按词组重新分块后再转发
    #[serde(default = "default_stream_agent_responses")]
    pub stream_agent_responses: bool,
}

fn default_stream_agent_responses() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout_secs: 120,
            system_prompt: None,
            stream_agent_responses: true,
        }
    }
}

/// LLM 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// 保存 API key 的环境变量名
    pub api_key_env: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_seconds: 60,
            headers: HashMap::new(),
        }
    }
}

impl LlmConfig {
    /// 从环境变量读取 API key
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    #[default]
    Jsonl,
}

/// Chat store 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Jsonl,
            path: Some("~/.parley/sessions".to_string()),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    #[serde(default)]
    pub json_format: bool,
    /// 按天滚动的日志目录，未设置时只输出到 stdout
    #[serde(default)]
    pub file: Option<String>,
    /// 按模块覆盖日志级别，例如 `{"parley_relay": "debug"}`
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            file: None,
            module_levels: HashMap::new(),
        }
    }
}

/// Metrics 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prometheus 抓取地址，例如 `127.0.0.1:9464`
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
