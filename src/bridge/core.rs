use std::{
    future::IntoFuture,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::{
    bridge::{Completer, Completion, ExternalFuture},
    common::{Result, SchedulerError, TimeUtils, panic_message},
    scheduler::SchedulerContext,
};

/// Bridge 生命周期状态
///
/// 只会从 `Pending` 迁移一次到某个终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// 还在轮询
    Pending = 0,
    /// 外部句柄成功产出值
    Completed = 1,
    /// 取值失败，或者调度器停机导致无法继续轮询
    Failed = 2,
    /// 外部句柄报告已取消
    Cancelled = 3,
    /// 超过 deadline 仍未完成
    TimedOut = 4,
}

impl BridgeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BridgeState::Completed,
            2 => BridgeState::Failed,
            3 => BridgeState::Cancelled,
            4 => BridgeState::TimedOut,
            _ => BridgeState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BridgeState::Pending)
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(BridgeState::Pending as u8))
    }

    fn get(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Pending -> 终态，只成功一次
    fn transition(&self, to: BridgeState) -> bool {
        self.0
            .compare_exchange(
                BridgeState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// 单次轮询的判定结果
enum PollStep<T> {
    Settle(BridgeState, Result<T>),
    Again,
}

/// 轮询循环本体，每一轮都被重新提交到串行执行器
struct BridgePoller<T, H> {
    handle: H,
    completer: Completer<T>,
    state: Arc<StateCell>,
    enqueued_at: Instant,
    timeout: Duration,
}

impl<T, H> BridgePoller<T, H>
where
    T: Send + 'static,
    H: ExternalFuture<T>,
{
    /// 判定顺序: 完成 -> 取消 -> 超时。
    ///
    /// 完成的检查永远排在超时前面，所以在超时那一轮恰好完成的句柄以 `Completed` 终结。
    fn step(&mut self, now: Instant) -> PollStep<T> {
        if self.handle.is_done() {
            return match self.handle.take() {
                Ok(value) => PollStep::Settle(BridgeState::Completed, Ok(value)),
                Err(cause) => PollStep::Settle(
                    BridgeState::Failed,
                    Err(SchedulerError::BridgeFailure(cause)),
                ),
            };
        }
        if self.handle.is_cancelled() {
            return PollStep::Settle(BridgeState::Cancelled, Err(SchedulerError::BridgeCancelled));
        }
        if now.saturating_duration_since(self.enqueued_at) >= self.timeout {
            return PollStep::Settle(
                BridgeState::TimedOut,
                Err(SchedulerError::BridgeTimeout(self.timeout)),
            );
        }
        PollStep::Again
    }

    fn settle(&self, state: BridgeState, result: Result<T>) {
        if self.state.transition(state) {
            trace!("[Bridge] Settled as {:?}.", state);
            self.completer.settle(result);
        }
    }

    fn run(mut self, ctx: SchedulerContext) {
        let now = Instant::now();
        // 句柄自身 panic 时也必须经过 settle，状态和结果才能保持一致
        let step = match catch_unwind(AssertUnwindSafe(|| self.step(now))) {
            Ok(step) => step,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("[Bridge] External handle panicked: {}", message);
                PollStep::Settle(
                    BridgeState::Failed,
                    Err(SchedulerError::BridgeFailure(anyhow!(message))),
                )
            }
        };
        match step {
            PollStep::Settle(state, result) => self.settle(state, result),
            PollStep::Again => {
                let completer = self.completer.clone();
                let cell = self.state.clone();
                let next_ctx = ctx.clone();
                if let Err(e) = ctx.enqueue(move || self.run(next_ctx)) {
                    debug!("[Bridge] Poll could not be re-enqueued: {}", e);
                    if cell.transition(BridgeState::Failed) {
                        completer.fail(e);
                    }
                }
            }
        }
    }
}

/// 外部 Future 桥接器
///
/// 把一个只能问询的外部句柄，转换成统一的一次性 `Completion`：
/// 以 `min_delay` 为节奏在串行执行器上反复轮询，直到句柄完成、被取消或者超时。
///
/// 这是忙轮询桥接，适用于被包装的句柄没有任何原生完成通知的场景。
pub struct FutureBridge<T> {
    completion: Completion<T>,
    state: Arc<StateCell>,
    enqueued_at: Instant,
    timeout: Duration,
}

impl<T> FutureBridge<T>
where
    T: Send + 'static,
{
    /// 使用配置中的默认超时 (`bridge.timeout_ms`，默认 10 秒)
    pub fn new<H>(ctx: &SchedulerContext, handle: H) -> Result<Self>
    where
        H: ExternalFuture<T>,
    {
        Self::with_timeout(ctx, handle, ctx.config().bridge_timeout())
    }

    /// 指定超时时间，小于 1ms 按 1ms 处理
    ///
    /// 调度器已停机时立即返回 `SchedulerShutdown`。
    pub fn with_timeout<H>(ctx: &SchedulerContext, handle: H, timeout: Duration) -> Result<Self>
    where
        H: ExternalFuture<T>,
    {
        let timeout = TimeUtils::at_least_unit(timeout);
        let (completer, completion) = Completion::channel();
        let state = Arc::new(StateCell::new());
        let enqueued_at = Instant::now();

        let poller = BridgePoller {
            handle,
            completer,
            state: state.clone(),
            enqueued_at,
            timeout,
        };
        let next_ctx = ctx.clone();
        ctx.enqueue(move || poller.run(next_ctx))?;

        Ok(Self {
            completion,
            state,
            enqueued_at,
            timeout,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn into_completion(self) -> Completion<T> {
        self.completion
    }

    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.completion.on_complete(f)
    }

    pub fn on_success<F>(self, f: F) -> Completion<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.completion.on_success(f)
    }

    pub fn on_failure<F>(self, f: F) -> Completion<T>
    where
        F: FnOnce(&SchedulerError) + Send + 'static,
    {
        self.completion.on_failure(f)
    }

    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.completion.map(f)
    }

    pub fn and_then<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Completion<U> + Send + 'static,
    {
        self.completion.and_then(f)
    }
}

impl<T> IntoFuture for FutureBridge<T> {
    type Output = Result<T>;
    type IntoFuture = Completion<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.completion
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use tokio::time::sleep;

    use super::*;
    use crate::{bridge::Deferred, common::SchedulerConfig};

    fn ctx() -> SchedulerContext {
        SchedulerContext::configure(SchedulerConfig::default()).unwrap()
    }

    async fn wait_settled<T: Send + 'static>(bridge: &FutureBridge<T>) {
        while !bridge.is_settled() {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_handle_completes() {
        let ctx = ctx();
        let handle = Deferred::new();
        let bridge = FutureBridge::new(&ctx, handle.clone()).unwrap();
        assert_eq!(bridge.state(), BridgeState::Pending);
        assert_eq!(bridge.timeout(), Duration::from_millis(10_000));

        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            handle.complete("i-0abc");
        });

        wait_settled(&bridge).await;
        assert_eq!(bridge.state(), BridgeState::Completed);
        assert_eq!(bridge.await.unwrap(), "i-0abc");
    }

    #[tokio::test(start_paused = true)]
    async fn never_completing_handle_times_out_no_earlier_than_deadline() {
        let ctx = ctx();
        let timeout = Duration::from_millis(100);
        let bridge = FutureBridge::<u32>::with_timeout(&ctx, Deferred::new(), timeout).unwrap();
        let started = bridge.enqueued_at();

        wait_settled(&bridge).await;
        let elapsed = Instant::now() - started;
        assert_eq!(bridge.state(), BridgeState::TimedOut);
        assert!(elapsed >= timeout, "settled too early: {elapsed:?}");
        assert!(elapsed <= timeout + Duration::from_millis(3), "settled too late: {elapsed:?}");
        assert!(matches!(bridge.await, Err(SchedulerError::BridgeTimeout(t)) if t == timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_handle_settles_as_cancelled() {
        let ctx = ctx();
        let handle = Deferred::<u32>::new();
        let bridge = FutureBridge::new(&ctx, handle.clone()).unwrap();
        handle.cancel();

        wait_settled(&bridge).await;
        assert_eq!(bridge.state(), BridgeState::Cancelled);
        assert!(matches!(bridge.await, Err(SchedulerError::BridgeCancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn retrieval_failure_settles_as_failed() {
        let ctx = ctx();
        let handle = Deferred::<u32>::new();
        handle.fail(anyhow!("DescribeInstances throttled"));
        let bridge = FutureBridge::new(&ctx, handle).unwrap();

        wait_settled(&bridge).await;
        assert_eq!(bridge.state(), BridgeState::Failed);
        match bridge.await {
            Err(SchedulerError::BridgeFailure(cause)) => {
                assert_eq!(cause.to_string(), "DescribeInstances throttled")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completion_wins_over_timeout_in_the_same_tick() {
        let handle = Deferred::new();
        handle.complete(9);
        let (completer, _completion) = Completion::channel();
        let enqueued_at = Instant::now();
        let timeout = Duration::from_millis(50);
        let mut poller = BridgePoller {
            handle,
            completer,
            state: Arc::new(StateCell::new()),
            enqueued_at,
            timeout,
        };

        match poller.step(enqueued_at + timeout) {
            PollStep::Settle(state, result) => {
                assert_eq!(state, BridgeState::Completed);
                assert_eq!(result.unwrap(), 9);
            }
            PollStep::Again => panic!("expected settlement"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn continuations_fire_once_on_settlement() {
        let ctx = ctx();
        let handle = Deferred::new();
        let bridge = FutureBridge::new(&ctx, handle.clone()).unwrap();
        let mapped = bridge.map(|ids: Vec<&str>| ids.len());
        handle.complete(vec!["i-1", "i-2"]);
        assert_eq!(mapped.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn construction_fails_fast_after_shutdown() {
        let ctx = ctx();
        ctx.shutdown();
        let result = FutureBridge::<u32>::new(&ctx, Deferred::new());
        assert!(matches!(result, Err(SchedulerError::SchedulerShutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_poll_settles_as_failed() {
        let ctx = ctx();
        let bridge = FutureBridge::<u32>::new(&ctx, Deferred::new()).unwrap();
        ctx.shutdown();

        wait_settled(&bridge).await;
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert!(matches!(bridge.await, Err(SchedulerError::SchedulerShutdown)));
    }

    #[tokio::test]
    async fn bridges_blocking_work_on_the_blocking_pool() {
        let ctx = ctx();
        let caller = std::thread::current().id();
        let handle = Deferred::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(20));
            assert_ne!(std::thread::current().id(), caller);
            Ok(vec!["condor_status: 4 slots".to_string()])
        });
        let lines = FutureBridge::new(&ctx, handle).unwrap().await.unwrap();
        assert_eq!(lines, vec!["condor_status: 4 slots".to_string()]);
    }

    struct PoisonedHandle;

    impl ExternalFuture<u32> for PoisonedHandle {
        fn is_done(&self) -> bool {
            panic!("sdk handle poisoned")
        }

        fn is_cancelled(&self) -> bool {
            false
        }

        fn take(&mut self) -> anyhow::Result<u32> {
            Err(anyhow!("never reached"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handle_settles_as_failed() {
        let ctx = ctx();
        let bridge = FutureBridge::new(&ctx, PoisonedHandle).unwrap();

        wait_settled(&bridge).await;
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(ctx.metrics().panicked(), 0);

        let err = bridge.await.unwrap_err();
        assert!(matches!(err, SchedulerError::BridgeFailure(_)));
        assert!(err.to_string().contains("sdk handle poisoned"));
    }
}
