//! 指标收集模块
//!
//! 基于 metrics facade。没有安装 recorder 时所有记录器都是空操作。

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::{Config, MetricsConfig};
use crate::error::{ObservabilityError, Result};

/// 指标收集器
pub struct MetricsCollector {
    /// 进程内渲染句柄（未配置监听地址时）
    handle: Option<PrometheusHandle>,

    config: MetricsConfig,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

impl MetricsCollector {
    /// 创建指标收集器，按配置安装全局 recorder
    pub fn init(config: &Config) -> Result<Self> {
        let metrics_config = config.metrics.clone();

        if !metrics_config.enabled {
            return Ok(Self {
                handle: None,
                config: metrics_config,
            });
        }

        let handle = match metrics_config.listen {
            Some(ref listen) => {
                let addr: SocketAddr = listen.parse().map_err(|e| {
                    ObservabilityError::config(format!("Invalid metrics listen address {}: {}", listen, e))
                })?;
                PrometheusBuilder::new()
                    .with_http_listener(addr)
                    .install()
                    .map_err(|e| ObservabilityError::metrics(format!("Failed to install exporter: {}", e)))?;
                tracing::info!(target: "parley_observability", "Metrics exporter listening on {}", addr);
                None
            }
            None => Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .map_err(|e| ObservabilityError::metrics(format!("Failed to set global recorder: {}", e)))?,
            ),
        };

        register_descriptions();

        Ok(Self {
            handle,
            config: metrics_config,
        })
    }

    /// 获取 Prometheus 格式的指标
    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// 注册指标描述
fn register_descriptions() {
    describe_counter!("parley_turns_total", Unit::Count, "Chat turns processed");
    describe_counter!("parley_turns_failed_total", Unit::Count, "Chat turns that failed");
    describe_histogram!(
        "parley_turn_duration_seconds",
        Unit::Seconds,
        "Time from job lease to end event"
    );
    describe_counter!("parley_tokens_total", Unit::Count, "Tokens reported by the generator");

    describe_counter!("parley_jobs_enqueued_total", Unit::Count, "Jobs accepted by the queue");
    describe_counter!("parley_jobs_completed_total", Unit::Count, "Jobs acknowledged");
    describe_counter!("parley_jobs_failed_total", Unit::Count, "Jobs that exhausted retries");
    describe_counter!("parley_jobs_retried_total", Unit::Count, "Job attempts scheduled for retry");
    describe_gauge!("parley_queue_waiting", Unit::Count, "Jobs waiting to be leased");

    describe_counter!("parley_relay_published_total", Unit::Count, "Events published to the broker");
    describe_counter!("parley_relay_delivered_total", Unit::Count, "Events handed to local connections");
    describe_counter!(
        "parley_relay_delivery_failures_total",
        Unit::Count,
        "Best-effort deliveries that were dropped"
    );
    describe_gauge!("parley_relay_channels", Unit::Count, "Session channels with local listeners");

    describe_gauge!("parley_connections_active", Unit::Count, "Open client connections");
    describe_counter!("parley_connections_rejected_total", Unit::Count, "Connections refused at capacity");

    describe_counter!("parley_archive_writes_total", Unit::Count, "Messages written to the archive");
    describe_counter!("parley_archive_failures_total", Unit::Count, "Archive writes that failed");
    describe_counter!("parley_recall_queries_total", Unit::Count, "Semantic recall queries");
}

/// 对话轮次指标记录器
pub struct TurnMetrics;

impl TurnMetrics {
    pub fn record_completed(duration_secs: f64) {
        metrics::counter!("parley_turns_total").increment(1);
        metrics::histogram!("parley_turn_duration_seconds").record(duration_secs);
    }

    pub fn record_failed() {
        metrics::counter!("parley_turns_failed_total").increment(1);
    }

    pub fn record_tokens(prompt_tokens: u64, completion_tokens: u64) {
        metrics::counter!("parley_tokens_total", "kind" => "prompt").increment(prompt_tokens);
        metrics::counter!("parley_tokens_total", "kind" => "completion").increment(completion_tokens);
    }
}

/// 任务队列指标记录器
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(job_type: &'static str) {
        metrics::counter!("parley_jobs_enqueued_total", "job_type" => job_type).increment(1);
    }

    pub fn record_completed(job_type: &'static str) {
        metrics::counter!("parley_jobs_completed_total", "job_type" => job_type).increment(1);
    }

    pub fn record_failed(job_type: &'static str) {
        metrics::counter!("parley_jobs_failed_total", "job_type" => job_type).increment(1);
    }

    pub fn record_retried(job_type: &'static str) {
        metrics::counter!("parley_jobs_retried_total", "job_type" => job_type).increment(1);
    }

    pub fn set_waiting(count: usize) {
        metrics::gauge!("parley_queue_waiting").set(count as f64);
    }
}

/// Relay 指标记录器
pub struct RelayMetrics;

impl RelayMetrics {
    pub fn record_published() {
        metrics::counter!("parley_relay_published_total").increment(1);
    }

    pub fn record_delivered() {
        metrics::counter!("parley_relay_delivered_total").increment(1);
    }

    pub fn record_delivery_failure() {
        metrics::counter!("parley_relay_delivery_failures_total").increment(1);
    }

    pub fn set_channels(count: usize) {
        metrics::gauge!("parley_relay_channels").set(count as f64);
    }
}

/// 连接指标记录器
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// 增加活跃连接数
    pub fn increment_active() {
        metrics::gauge!("parley_connections_active").increment(1.0);
    }

    /// 减少活跃连接数
    pub fn decrement_active() {
        metrics::gauge!("parley_connections_active").decrement(1.0);
    }

    pub fn record_rejected() {
        metrics::counter!("parley_connections_rejected_total").increment(1);
    }
}

/// 记忆层指标记录器
pub struct MemoryMetrics;

impl MemoryMetrics {
    pub fn record_archive_write() {
        metrics::counter!("parley_archive_writes_total").increment(1);
    }

    pub fn record_archive_failure() {
        metrics::counter!("parley_archive_failures_total").increment(1);
    }

    pub fn record_recall() {
        metrics::counter!("parley_recall_queries_total").increment(1);
    }
}
