//! 结构化日志模块
//!
//! 基于 tracing 的结构化日志，级别可以在运行时通过 reload 句柄调整。

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::{Layered, SubscriberExt},
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

/// 日志级别重新加载句柄类型
type ReloadHandle = Handle<EnvFilter, Registry>;

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "parley.log";

/// 日志管理器
#[derive(Debug)]
pub struct LogManager {
    /// 配置
    config: LoggingConfig,

    /// 过滤器重新加载句柄
    reload_handle: ReloadHandle,

    /// 文件写入线程的守卫，drop 时刷新缓冲
    _file_guard: Option<WorkerGuard>,
}

impl LogManager {
    /// 初始化全局日志系统。同一进程只能调用一次。
    pub fn init(config: &Config) -> Result<Self> {
        let logging = config.logging.clone();

        let filter = build_filter(&logging.level, &logging.module_levels)?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let mut layers: Vec<BoxedLayer> = Vec::new();

        // stdout 输出层
        if logging.json_format {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(logging.include_target)
                    .with_thread_ids(logging.include_thread_id)
                    .with_current_span(true)
                    .boxed(),
            );
        } else {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_target(logging.include_target)
                    .with_thread_ids(logging.include_thread_id)
                    .with_ansi(logging.ansi_colors)
                    .boxed(),
            );
        }

        // 文件输出层
        let file_guard = match logging.file_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = if logging.json_format {
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .boxed()
                } else {
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .boxed()
                };
                layers.push(layer);
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(layers)
            .try_init()
            .map_err(|e| ObservabilityError::init(format!("Failed to install subscriber: {}", e)))?;

        tracing::info!(
            target: "parley_observability",
            level = %logging.level,
            json = logging.json_format,
            "Log manager initialized"
        );

        Ok(Self {
            config: logging,
            reload_handle,
            _file_guard: file_guard,
        })
    }

    /// 动态更新日志级别
    pub fn update_level(&mut self, level: &str) -> Result<()> {
        let new_filter = build_filter(level, &self.config.module_levels)?;

        self.reload_handle
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;

        self.config.level = level.to_string();

        tracing::info!(target: "parley_observability", "Log level updated to: {}", level);
        Ok(())
    }

    /// 获取当前配置
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

/// 构建环境过滤器；`RUST_LOG` 不参与，级别完全来自配置
fn build_filter(
    level: &str,
    module_levels: &std::collections::HashMap<String, String>,
) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level)
        .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

    for (module, module_level) in module_levels {
        let directive = format!("{}={}", module, module_level)
            .parse()
            .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// 单个对话轮次的 span
pub fn turn_span(session_id: &str, job_id: &str) -> tracing::Span {
    tracing::info_span!(
        "turn",
        session_id = %session_id,
        job_id = %job_id,
    )
}

/// 客户端连接的 span
pub fn connection_span(connection_id: &str, user_id: Option<&str>) -> tracing::Span {
    match user_id {
        Some(user_id) => tracing::info_span!(
            "connection",
            connection_id = %connection_id,
            user_id = %user_id,
        ),
        None => tracing::info_span!(
            "connection",
            connection_id = %connection_id,
        ),
    }
}
