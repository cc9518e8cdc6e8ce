//! Parley Observability
//!
//! 统一的日志和指标初始化。

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
#[allow(missing_docs)]
pub mod metrics;

pub use config::Config;
pub use error::{ObservabilityError, Result};
pub use logging::{connection_span, turn_span, LogManager};
pub use metrics::{
    ConnectionMetrics, MemoryMetrics, MetricsCollector, QueueMetrics, RelayMetrics, TurnMetrics,
};

/// 统一的观测性句柄
#[derive(Debug)]
pub struct Observability {
    /// 日志管理器
    log_manager: LogManager,
    /// 指标收集器
    metrics: MetricsCollector,
}

impl Observability {
    /// 初始化观测性基础设施
    pub fn init(config: &Config) -> Result<Self> {
        let log_manager = LogManager::init(config)?;
        let metrics = MetricsCollector::init(config)?;

        tracing::info!(
            target: "parley_observability",
            metrics = metrics.is_enabled(),
            "Observability infrastructure initialized"
        );

        Ok(Self {
            log_manager,
            metrics,
        })
    }

    /// 获取指标收集器
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// 动态更新日志级别
    pub fn update_log_level(&mut self, level: &str) -> Result<()> {
        self.log_manager.update_level(level)
    }
}
