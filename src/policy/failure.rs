use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::SchedulerError;

/// 失败策略接口 (The Interface)
///
/// - 决定了 Provider 失败之后，Binding 是否继续轮询。
/// - 只控制 "要不要继续"，错误本身永远不会暴露给订阅者。
/// - 没有配置策略时，Binding 默认容忍失败并按固定周期继续轮询。
pub trait FailurePolicy: Send + Sync + 'static {
    /// 核心决策方法
    ///
    /// - 返回 `true`: 下一个周期继续。
    /// - 返回 `false`: 结束当前的 Tick 链条。
    fn should_continue(&self, error: &SchedulerError) -> bool;

    /// 成功拉取一次后调用，给有状态的策略一个重置的机会
    fn on_success(&self) {}
}

// 闭包即策略
impl<F> FailurePolicy for F
where
    F: Fn(&SchedulerError) -> bool + Send + Sync + 'static,
{
    fn should_continue(&self, error: &SchedulerError) -> bool {
        self(error)
    }
}

/// 永远继续 (与不配置策略等价，只是写得更明确)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

impl FailurePolicy for AlwaysContinue {
    fn should_continue(&self, _error: &SchedulerError) -> bool {
        true
    }
}

/// 第一次失败就停
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnFailure;

impl FailurePolicy for StopOnFailure {
    fn should_continue(&self, _error: &SchedulerError) -> bool {
        false
    }
}

/// 只在暂时性故障上继续
///
/// 依据 `SchedulerError::is_retryable`：超时、远端失败继续；取消、停机、配置错误停止。
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryTransient;

impl FailurePolicy for RetryTransient {
    fn should_continue(&self, error: &SchedulerError) -> bool {
        error.is_retryable()
    }
}

/// 连续失败熔断
///
/// - 连续失败达到 `limit` 次后停止。
/// - 任何一次成功都会把计数清零。
#[derive(Debug)]
pub struct MaxConsecutiveFailures {
    limit: u32,
    failures: AtomicU32,
}

impl MaxConsecutiveFailures {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl FailurePolicy for MaxConsecutiveFailures {
    fn should_continue(&self, _error: &SchedulerError) -> bool {
        let seen = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        seen < self.limit
    }

    fn on_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// 组合策略链 (Arbitrator)
///
/// 所有策略都同意继续才继续。每个策略都会被问到，保证有状态的策略计数准确。
#[derive(Default)]
pub struct FailurePolicyChain {
    policies: Vec<Box<dyn FailurePolicy>>,
}

impl FailurePolicyChain {
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// 向链中添加一个新策略
    pub fn add<P: FailurePolicy>(mut self, policy: P) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl FailurePolicy for FailurePolicyChain {
    fn should_continue(&self, error: &SchedulerError) -> bool {
        self.policies
            .iter()
            .fold(true, |keep, policy| policy.should_continue(error) && keep)
    }

    fn on_success(&self) {
        for policy in &self.policies {
            policy.on_success();
        }
    }
}
