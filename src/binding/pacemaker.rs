use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::scheduler::SchedulerContext;

/// Tick 链条的起搏器
///
/// 一个可取消的重复定时器：每一拍结束时由 Tick 自己调用 `beat` 安排下一拍，
/// 在重新提交之前检查取消令牌。`stop()` 只是取消令牌，已经提交的那一拍照常执行，
/// 只是它不会再安排后继。
#[derive(Clone)]
pub(crate) struct Pacemaker {
    ctx: SchedulerContext,
    token: CancellationToken,
}

impl Pacemaker {
    pub fn new(ctx: SchedulerContext, token: CancellationToken) -> Self {
        Self { ctx, token }
    }

    /// 安排下一拍
    pub fn beat<F>(&self, delay: Duration, tick: F) -> PacemakerEvent
    where
        F: FnOnce() + Send + 'static,
    {
        if self.token.is_cancelled() {
            return PacemakerEvent::Stopped;
        }
        match self.ctx.schedule(tick, delay) {
            Ok(()) => PacemakerEvent::Scheduled,
            Err(_) => {
                // 调度器已停机，链条随之结束
                self.token.cancel();
                PacemakerEvent::Shutdown
            }
        }
    }

    /// 主动结束链条 (失败策略要求停止等)
    pub fn halt(&self) {
        self.token.cancel();
    }
}

/// 起搏器产生的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacemakerEvent {
    /// 下一拍已提交
    Scheduled,
    /// 链条已被停止，没有后继
    Stopped,
    /// 调度器停机，链条结束
    Shutdown,
}
