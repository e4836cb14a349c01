use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::error;

use crate::common::panic_message;

/// 外部 Future 接口 (The Wrapped Handle)
///
/// 描述一个只能被 "问询" 的异步结果：它不会主动通知完成，只能反复询问。
/// 典型来源是厂商 SDK 返回的阻塞式 Future，或者跑在独立线程上的远程命令。
pub trait ExternalFuture<T>: Send + 'static {
    /// 是否已经产生结果 (成功或失败)
    fn is_done(&self) -> bool;

    /// 是否已被取消
    fn is_cancelled(&self) -> bool;

    /// 取出结果
    ///
    /// 只会在 `is_done()` 返回 `true` 之后被调用一次；取值本身也可能失败。
    fn take(&mut self) -> anyhow::Result<T>;
}

impl<T, H> ExternalFuture<T> for Box<H>
where
    H: ExternalFuture<T> + ?Sized,
{
    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }

    fn take(&mut self) -> anyhow::Result<T> {
        (**self).take()
    }
}

enum DeferredState<T> {
    Pending,
    Done(anyhow::Result<T>),
    Cancelled,
    Taken,
}

/// 线程安全的外部句柄
///
/// 任何线程都可以通过 `complete` / `fail` / `cancel` 写入一次结果，先到先得。
/// 它本身不提供通知能力，需要交给 `FutureBridge` 轮询。
pub struct Deferred<T> {
    state: Arc<Mutex<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeferredState::Pending)),
        }
    }

    fn resolve(&self, next: DeferredState<T>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, DeferredState::Pending) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(DeferredState::Done(Ok(value)))
    }

    pub fn fail(&self, error: anyhow::Error) -> bool {
        self.resolve(DeferredState::Done(Err(error)))
    }

    pub fn cancel(&self) -> bool {
        self.resolve(DeferredState::Cancelled)
    }
}

impl<T> Deferred<T>
where
    T: Send + 'static,
{
    /// 在 Tokio 的阻塞线程池上执行阻塞任务，并以句柄形式暴露结果
    ///
    /// - 任务 panic 会被转换为失败。
    /// - 在 Runtime 之外调用时，句柄立即以失败终结。
    pub fn spawn_blocking<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let deferred = Self::new();
        let writer = deferred.clone();
        match Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(move || {
                    let result = catch_unwind(AssertUnwindSafe(work))
                        .unwrap_or_else(|p| Err(anyhow!(panic_message(p.as_ref()))));
                    match result {
                        Ok(value) => writer.complete(value),
                        Err(e) => writer.fail(e),
                    };
                });
            }
            Err(e) => {
                error!("[Bridge] Blocking work needs a Tokio runtime: {}", e);
                deferred.fail(anyhow!(e));
            }
        }
        deferred
    }
}

impl<T> ExternalFuture<T> for Deferred<T>
where
    T: Send + 'static,
{
    fn is_done(&self) -> bool {
        matches!(
            *self.state.lock(),
            DeferredState::Done(_) | DeferredState::Taken
        )
    }

    fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), DeferredState::Cancelled)
    }

    fn take(&mut self) -> anyhow::Result<T> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, DeferredState::Taken) {
            DeferredState::Done(result) => result,
            DeferredState::Taken => Err(anyhow!("deferred value was already taken")),
            DeferredState::Pending => {
                *state = DeferredState::Pending;
                Err(anyhow!("deferred value is not ready"))
            }
            DeferredState::Cancelled => {
                *state = DeferredState::Cancelled;
                Err(anyhow!("deferred value was cancelled"))
            }
        }
    }
}
