use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::Result;

// ==========================================
// 1. 执行器配置 (ExecutorConfig)
// ==========================================

/// 串行执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// 最小重入队延迟 (毫秒)
    ///
    /// - 说明: 所有延时提交的下限，也是 Bridge 的轮询节奏。
    /// - 默认值: 1
    /// - 约束: 小于 1 的值按 1 处理。
    pub min_delay_ms: u64,

    /// 执行器名称，仅用于日志
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1,
            name: "cloudbind-scheduler".to_string(),
        }
    }
}

// ==========================================
// 2. Bridge 配置 (BridgeConfig)
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 默认超时时间 (毫秒)
    ///
    /// - 默认值: 10,000 ms
    /// - 约束: 小于 1 的值按 1 处理。
    pub timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

// ==========================================
// 3. Binding 配置 (BindingConfig)
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// 默认刷新周期 (毫秒)
    ///
    /// - 默认值: 1000 ms
    /// - 影响: 只作为 Builder 没有显式设置周期时的默认值，运行中可以通过 `with_period` 覆盖。
    pub period_ms: u64,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self { period_ms: 1000 }
    }
}

// ==========================================
// 4. 总配置入口 (SchedulerConfig)
// ==========================================

/// 调度上下文总配置
///
/// 使用分层结构组织配置项。支持 `serde`，可直接从 JSON 加载，缺省的字段走默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub binding: BindingConfig,
}

impl SchedulerConfig {
    /// 快速创建一个开发环境配置
    pub fn new_dev() -> Self {
        let mut cfg = Self::default();
        // 开发环境下超时和周期短一点，方便调试
        cfg.bridge.timeout_ms = 2000;
        cfg.binding.period_ms = 250;
        cfg
    }

    /// 从 JSON 字符串加载
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.executor.min_delay_ms.max(1))
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.timeout_ms.max(1))
    }

    pub fn binding_period(&self) -> Duration {
        Duration::from_millis(self.binding.period_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.min_delay(), Duration::from_millis(1));
        assert_eq!(cfg.bridge_timeout(), Duration::from_millis(10_000));
        assert_eq!(cfg.binding_period(), Duration::from_millis(1000));
    }

    #[test]
    fn dev_preset_shortens_timeout_and_period() {
        let cfg = SchedulerConfig::new_dev();
        assert_eq!(cfg.bridge_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.binding_period(), Duration::from_millis(250));
        assert_eq!(cfg.min_delay(), Duration::from_millis(1));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = SchedulerConfig::from_json(r#"{ "bridge": { "timeout_ms": 500 } }"#).unwrap();
        assert_eq!(cfg.bridge_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.min_delay(), Duration::from_millis(1));
        assert_eq!(cfg.executor.name, "cloudbind-scheduler");
    }

    #[test]
    fn zero_values_are_clamped() {
        let cfg = SchedulerConfig::from_json(
            r#"{ "executor": { "min_delay_ms": 0, "name": "x" }, "binding": { "period_ms": 0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.min_delay(), Duration::from_millis(1));
        assert_eq!(cfg.binding_period(), Duration::from_millis(1));
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = SchedulerConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, crate::common::SchedulerError::Serialization(_)));
    }
}
