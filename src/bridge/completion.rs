use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

use crate::common::{Result, SchedulerError};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum Slot<T> {
    /// 尚未终结。最多挂一个回调 (on_complete) 或者一个 Waker (await)。
    Pending {
        callback: Option<Callback<T>>,
        waker: Option<Waker>,
    },
    /// 已终结，结果还没被取走
    Settled(Result<T>),
    /// 结果已交给消费者
    Consumed,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending {
                callback: None,
                waker: None,
            }),
        }
    }

    /// 只有第一次终结会被观察到，之后的调用都是 no-op
    fn settle(&self, result: Result<T>) -> bool {
        let mut slot = self.slot.lock();
        match mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Pending {
                callback: Some(callback),
                ..
            } => {
                drop(slot);
                callback(result);
                true
            }
            Slot::Pending {
                callback: None,
                waker,
            } => {
                *slot = Slot::Settled(result);
                drop(slot);
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            previous => {
                *slot = previous;
                false
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Pending { .. })
    }
}

/// 最后一个 Completer 被 Drop 时，如果还没终结，以 `ChannelClosed` 终结
struct Abandon<T>(Arc<Shared<T>>);

impl<T> Drop for Abandon<T> {
    fn drop(&mut self) {
        self.0.settle(Err(SchedulerError::ChannelClosed));
    }
}

/// 生产者一侧 (写端)
///
/// 可以 Clone 给多个可能的终结者 (例如轮询循环和超时逻辑)，先到先得。
pub struct Completer<T> {
    inner: Arc<Abandon<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Completer<T> {
    /// 终结。返回 `false` 表示之前已经终结过。
    pub fn settle(&self, result: Result<T>) -> bool {
        self.inner.0.settle(result)
    }

    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn fail(&self, error: SchedulerError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        !self.inner.0.is_pending()
    }
}

/// 一次性、可链式组合的完成值 (读端)
///
/// - 每个后续操作 (`on_complete` / `map` / `and_then` ...) 都消费 `self`，所以结果只会交给唯一的消费链。
/// - 回调在终结的那一刻、在终结者所在的线程上同步执行；如果挂回调时已经终结，则立即执行。
/// - 也可以直接 `.await`。
#[must_use = "a Completion does nothing unless a continuation is attached or it is awaited"]
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &!self.shared.is_pending())
            .finish()
    }
}

impl<T> Completion<T>
where
    T: Send + 'static,
{
    /// 创建一对读写端
    pub fn channel() -> (Completer<T>, Completion<T>) {
        let shared = Arc::new(Shared::new());
        let completer = Completer {
            inner: Arc::new(Abandon(shared.clone())),
        };
        (completer, Completion { shared })
    }

    pub fn ready(result: Result<T>) -> Self {
        let (completer, completion) = Self::channel();
        completer.settle(result);
        completion
    }

    pub fn ok(value: T) -> Self {
        Self::ready(Ok(value))
    }

    pub fn err(error: SchedulerError) -> Self {
        Self::ready(Err(error))
    }

    /// 把一个普通的 async 计算包装成 Completion
    ///
    /// 需要在 Tokio Runtime 中调用。错误统一转换为 `SchedulerError` (anyhow -> `ProviderFailure`)。
    pub fn from_future<F, E>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<SchedulerError>,
    {
        let (completer, completion) = Self::channel();
        tokio::spawn(async move {
            completer.settle(future.await.map_err(Into::into));
        });
        completion
    }

    pub fn is_settled(&self) -> bool {
        !self.shared.is_pending()
    }

    /// 挂上终结回调 (消费链的终点)
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Settled(result) => {
                drop(slot);
                f(result);
            }
            Slot::Pending { .. } => {
                *slot = Slot::Pending {
                    callback: Some(Box::new(f)),
                    waker: None,
                };
            }
            Slot::Consumed => {}
        }
    }

    /// 值变换
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (completer, next) = Completion::channel();
        self.on_complete(move |result| {
            completer.settle(result.map(f));
        });
        next
    }

    /// 串联另一个异步步骤
    pub fn and_then<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Completion<U> + Send + 'static,
    {
        let (completer, next) = Completion::channel();
        self.on_complete(move |result| match result {
            Ok(value) => f(value).on_complete(move |inner| {
                completer.settle(inner);
            }),
            Err(e) => {
                completer.settle(Err(e));
            }
        });
        next
    }

    /// 成功时旁路观察一次，结果原样向下传递
    pub fn on_success<F>(self, f: F) -> Completion<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let (completer, next) = Completion::channel();
        self.on_complete(move |result| {
            if let Ok(value) = &result {
                f(value);
            }
            completer.settle(result);
        });
        next
    }

    /// 失败时旁路观察一次，结果原样向下传递
    pub fn on_failure<F>(self, f: F) -> Completion<T>
    where
        F: FnOnce(&SchedulerError) + Send + 'static,
    {
        let (completer, next) = Completion::channel();
        self.on_complete(move |result| {
            if let Err(e) = &result {
                f(e);
            }
            completer.settle(result);
        });
        next
    }

    /// 把失败转换为一个值
    pub fn recover<F>(self, f: F) -> Completion<T>
    where
        F: FnOnce(SchedulerError) -> T + Send + 'static,
    {
        let (completer, next) = Completion::channel();
        self.on_complete(move |result| {
            completer.settle(Ok(result.unwrap_or_else(f)));
        });
        next
    }

    /// 等待所有 Completion 完成
    ///
    /// - 结果顺序与输入顺序一致。
    /// - 任何一个失败，整体立即以该错误终结。
    pub fn all<I>(parts: I) -> Completion<Vec<T>>
    where
        I: IntoIterator<Item = Completion<T>>,
    {
        let parts: Vec<Completion<T>> = parts.into_iter().collect();
        if parts.is_empty() {
            return Completion::ok(Vec::new());
        }

        struct JoinState<T> {
            values: Vec<Option<T>>,
            remaining: usize,
        }

        let (completer, joined) = Completion::channel();
        let state = Arc::new(Mutex::new(JoinState {
            values: parts.iter().map(|_| None).collect(),
            remaining: parts.len(),
        }));

        for (index, part) in parts.into_iter().enumerate() {
            let state = state.clone();
            let completer = completer.clone();
            part.on_complete(move |result| match result {
                Ok(value) => {
                    let finished = {
                        let mut s = state.lock();
                        s.values[index] = Some(value);
                        s.remaining -= 1;
                        (s.remaining == 0).then(|| mem::take(&mut s.values))
                    };
                    if let Some(values) = finished {
                        completer.settle(Ok(values.into_iter().flatten().collect()));
                    }
                }
                Err(e) => {
                    completer.settle(Err(e));
                }
            });
        }
        joined
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        match mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Settled(result) => Poll::Ready(result),
            Slot::Pending { callback, .. } => {
                *slot = Slot::Pending {
                    callback,
                    waker: Some(cx.waker().clone()),
                };
                Poll::Pending
            }
            Slot::Consumed => Poll::Ready(Err(SchedulerError::CompletionConsumed)),
        }
    }
}
