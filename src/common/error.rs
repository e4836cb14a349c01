use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// 统一结果类型
///
/// 使用此别名可以简化函数签名：`fn do_something() -> Result<()>`
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    // ==========================================
    // 1. 配置与生命周期错误 (Configuration & Lifecycle)
    // ==========================================
    /// 配置错误
    ///
    /// - 触发场景: 在 Tokio Runtime 之外创建 SchedulerContext、构建 Binding 时没有提供 Provider、JSON 配置解析不通过。
    /// - 后果: 构造直接失败 (Fail Fast)，不会拖到第一次 Tick 才暴露。
    #[error("Configuration error: {0}")]
    Config(String),

    /// 调度器已停机
    ///
    /// - 触发场景: 调用 `shutdown()` 之后仍有组件尝试提交延时任务。
    /// - 后果: 请求被拒绝，Bridge 以失败终结，Binding 的 Tick 链条结束。
    #[error("Scheduler is shut down, rejecting new work.")]
    SchedulerShutdown,

    /// 内部通信通道已关闭
    ///
    /// - 触发场景: 执行器的接收端已被 Drop，但仍有组件尝试发送任务。
    #[error("Internal communication channel closed.")]
    ChannelClosed,

    // ==========================================
    // 2. Bridge 终态错误 (Bridge Settlement)
    // ==========================================
    /// 外部 Future 超时
    ///
    /// - 触发场景: 被包装的外部句柄在 deadline 之前既没有完成也没有被取消。
    #[error("Future timed out after {0:?}.")]
    BridgeTimeout(Duration),

    /// 外部 Future 被取消
    #[error("Future was cancelled.")]
    BridgeCancelled,

    /// 外部 Future 已完成，但取值时抛错
    #[error("Future failed: {0}")]
    BridgeFailure(#[source] anyhow::Error),

    // ==========================================
    // 3. Provider 与运行时错误 (Provider & Runtime)
    // ==========================================
    /// Provider 在某次 Tick 中失败
    ///
    /// - 说明: 只在 Binding 内部被吸收，订阅者永远看不到这个错误，只会看到回退值。
    #[error("Provider failed: {0}")]
    ProviderFailure(#[source] anyhow::Error),

    /// Completion 的结果已经被取走
    ///
    /// - 触发场景: 同一个 Completion 在返回 Ready 之后又被 poll。
    #[error("Completion result was already consumed.")]
    CompletionConsumed,

    /// 序列化/反序列化失败
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// 自动转换 Tokio MPSC 发送错误
impl<T> From<SendError<T>> for SchedulerError {
    fn from(_: SendError<T>) -> Self {
        SchedulerError::ChannelClosed
    }
}

// 用户闭包里的 anyhow 错误统一视为 Provider 失败
impl From<anyhow::Error> for SchedulerError {
    fn from(e: anyhow::Error) -> Self {
        SchedulerError::ProviderFailure(e)
    }
}

impl SchedulerError {
    /// 判断该错误是否值得继续轮询 (Retryable)
    ///
    /// - 返回 `true`: 暂时性故障，例如超时、远端调用失败。下一个周期再试一次是有意义的。
    /// - 返回 `false`: 配置错误、停机、取消等，再怎么轮询也不会变好。
    pub fn is_retryable(&self) -> bool {
        match self {
            // --- 可以重试的情况 ---
            SchedulerError::BridgeTimeout(_) => true,
            SchedulerError::BridgeFailure(_) => true,
            SchedulerError::ProviderFailure(_) => true,

            // --- 不可重试的情况 (永久性错误) ---
            SchedulerError::Config(_) => false,
            SchedulerError::SchedulerShutdown => false,
            SchedulerError::ChannelClosed => false,
            SchedulerError::BridgeCancelled => false,
            SchedulerError::CompletionConsumed => false,
            SchedulerError::Serialization(_) => false,
        }
    }
}
