use std::{
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
    mem,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, ThreadId},
    time::Duration,
};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    binding::{
        builder::ReactiveBindingBuilder,
        metrics::BindingMetrics,
        pacemaker::{Pacemaker, PacemakerEvent},
    },
    bridge::Completion,
    common::{Result, SchedulerError, TimeUtils, panic_message},
    policy::FailurePolicy,
    scheduler::SchedulerContext,
};

/// 数据源：每次调用返回一个新的异步结果，`None` 表示 "没有值"
pub(crate) type Provider<T> = Arc<dyn Fn() -> Completion<Option<T>> + Send + Sync>;

/// 订阅者回调，参数是当前值 (可能为空)
type Subscriber<T> = Box<dyn FnMut(Option<&T>) + Send>;

/// 把一个总是产出值的 Provider 提升为可选值的形式
pub(crate) fn lift_provider<T, P>(provider: P) -> Provider<T>
where
    T: Send + 'static,
    P: Fn() -> Completion<T> + Send + Sync + 'static,
{
    Arc::new(move || provider().map(Some))
}

/// Binding 的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    /// 从未启动
    Idle,
    /// Tick 链条正在运行
    Running,
    /// 链条已结束 (stop / 失败策略 / 调度器停机)，可以再次 start
    Stopped,
}

/// 可以在运行时整体替换的配置
pub(crate) struct Settings<T> {
    pub provider: Provider<T>,
    pub failure_policy: Option<Arc<dyn FailurePolicy>>,
    pub period: Duration,
    pub fallback: Option<T>,
}

enum RegistryOp<K, T> {
    Bind(K, Subscriber<T>),
    Listen(K),
    Pause(K),
    Unbind(K),
    Clear,
}

/// 订阅者注册表
///
/// `active` 永远是 `subscribers` 键集合的子集。
struct Registry<K, T> {
    subscribers: HashMap<K, Subscriber<T>, RandomState>,
    active: HashSet<K, RandomState>,
}

impl<K, T> Registry<K, T>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            subscribers: HashMap::with_hasher(RandomState::new()),
            active: HashSet::with_hasher(RandomState::new()),
        }
    }

    fn apply(&mut self, op: RegistryOp<K, T>) {
        match op {
            RegistryOp::Bind(key, callback) => {
                self.subscribers.insert(key.clone(), callback);
                self.active.insert(key);
            }
            RegistryOp::Listen(key) => {
                // 从未注册过的 key 什么也不做
                if self.subscribers.contains_key(&key) {
                    self.active.insert(key);
                }
            }
            RegistryOp::Pause(key) => {
                self.active.remove(&key);
            }
            RegistryOp::Unbind(key) => {
                self.active.remove(&key);
                self.subscribers.remove(&key);
            }
            RegistryOp::Clear => {
                self.active.clear();
                self.subscribers.clear();
            }
        }
    }
}

struct BindingInner<K, T> {
    name: String,
    ctx: SchedulerContext,
    settings: Mutex<Settings<T>>,
    registry: Mutex<Registry<K, T>>,
    value: RwLock<Option<T>>,
    /// 当前 Tick 链条的取消令牌，`None` 表示从未启动
    chain: Mutex<Option<CancellationToken>>,
    /// 正在做扇出的线程
    fanout_thread: Mutex<Option<ThreadId>>,
    /// 扇出期间由回调自己发起的注册表变更，扇出结束后再应用
    deferred: Mutex<Vec<RegistryOp<K, T>>>,
    metrics: BindingMetrics,
}

/// 响应式绑定 (Reactive Binding)
///
/// **职责**:
/// 周期性地调用 Provider 拉取最新值，缓存下来，并推送给所有活跃的订阅者。
///
/// **节奏**:
/// - 第一拍在 `start()` 之后立即安排 (受调度器最小延迟约束)。
/// - 成功时，下一拍的延迟会扣除本次拉取的耗时，保证回调之间的间隔约等于 `period`。
/// - 失败时，缓存值回退为默认值，订阅者不会被通知，按失败策略决定是否以 `period` 继续。
/// - 没有活跃订阅者时跳过拉取，只做空转。
///
/// **线程模型**:
/// 所有 Tick 和扇出都在调度器的串行执行器上执行。注册表的修改可以来自任何线程，
/// 包括订阅者回调自身 (此时会被推迟到扇出结束后再生效)。
pub struct ReactiveBinding<K, T> {
    inner: Arc<BindingInner<K, T>>,
}

impl<K, T> Clone for ReactiveBinding<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> fmt::Debug for ReactiveBinding<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .inner
            .chain
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled());
        f.debug_struct("ReactiveBinding")
            .field("name", &self.inner.name)
            .field("running", &running)
            .finish()
    }
}

impl<K, T> ReactiveBinding<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn builder(ctx: &SchedulerContext) -> ReactiveBindingBuilder<K, T> {
        ReactiveBindingBuilder::new(ctx)
    }

    /// 使用上下文里配置的默认周期创建一个 Binding
    pub fn new<P>(ctx: &SchedulerContext, provider: P) -> Self
    where
        P: Fn() -> Completion<T> + Send + Sync + 'static,
    {
        let settings = Settings {
            provider: lift_provider(provider),
            failure_policy: None,
            period: ctx.config().binding_period(),
            fallback: None,
        };
        Self::assemble(ctx.clone(), crate::common::new_binding_name(), settings)
    }

    pub(crate) fn assemble(ctx: SchedulerContext, name: String, settings: Settings<T>) -> Self {
        let value = settings.fallback.clone();
        debug!(
            "[Binding-{}] Created with period {:?}.",
            name, settings.period
        );
        Self {
            inner: Arc::new(BindingInner {
                name,
                ctx,
                settings: Mutex::new(settings),
                registry: Mutex::new(Registry::new()),
                value: RwLock::new(value),
                chain: Mutex::new(None),
                fanout_thread: Mutex::new(None),
                deferred: Mutex::new(Vec::new()),
                metrics: BindingMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ---------------------------------------------------------------------
    // 配置 (下一拍生效)
    // ---------------------------------------------------------------------

    pub fn with_provider<P>(&self, provider: P) -> &Self
    where
        P: Fn() -> Completion<T> + Send + Sync + 'static,
    {
        self.inner.settings.lock().provider = lift_provider(provider);
        self
    }

    /// 替换为可能返回空值的 Provider
    pub fn with_optional_provider<P>(&self, provider: P) -> &Self
    where
        P: Fn() -> Completion<Option<T>> + Send + Sync + 'static,
    {
        self.inner.settings.lock().provider = Arc::new(provider);
        self
    }

    pub fn on_failure<P: FailurePolicy>(&self, policy: P) -> &Self {
        self.inner.settings.lock().failure_policy = Some(Arc::new(policy));
        self
    }

    /// 移除失败策略，恢复 "失败后继续轮询" 的默认行为
    pub fn without_failure_policy(&self) -> &Self {
        self.inner.settings.lock().failure_policy = None;
        self
    }

    /// 设置默认值
    ///
    /// Provider 返回空值或者失败时，缓存值回退到它。如果此时还没有缓存值，也立即采用它。
    pub fn with_default(&self, value: T) -> &Self {
        {
            let mut current = self.inner.value.write();
            if current.is_none() {
                *current = Some(value.clone());
            }
        }
        self.inner.settings.lock().fallback = Some(value);
        self
    }

    pub fn with_period(&self, period: Duration) -> &Self {
        self.inner.settings.lock().period = TimeUtils::at_least_unit(period);
        self
    }

    pub fn period(&self) -> Duration {
        self.inner.settings.lock().period
    }

    // ---------------------------------------------------------------------
    // 订阅者
    // ---------------------------------------------------------------------

    /// 注册 (或替换) 一个订阅者并立即激活
    pub fn bind<F>(&self, key: K, callback: F)
    where
        F: FnMut(Option<&T>) + Send + 'static,
    {
        self.mutate(RegistryOp::Bind(key, Box::new(callback)));
    }

    /// `bind` 的链式写法
    pub fn with_notifier<F>(&self, key: K, callback: F) -> &Self
    where
        F: FnMut(Option<&T>) + Send + 'static,
    {
        self.bind(key, callback);
        self
    }

    /// 重新激活一个已注册的订阅者，未注册的 key 被忽略
    pub fn listen(&self, key: &K) {
        self.mutate(RegistryOp::Listen(key.clone()));
    }

    pub fn resume(&self, key: &K) {
        self.listen(key);
    }

    /// 暂停推送，但保留回调
    pub fn pause(&self, key: &K) {
        self.mutate(RegistryOp::Pause(key.clone()));
    }

    /// 暂停并丢弃回调
    pub fn unbind(&self, key: &K) {
        self.mutate(RegistryOp::Unbind(key.clone()));
    }

    pub fn clear(&self) {
        self.mutate(RegistryOp::Clear);
    }

    fn mutate(&self, op: RegistryOp<K, T>) {
        if self.inner.is_fanout_thread() {
            // 回调里修改注册表：此时注册表正被扇出持有
            self.inner.deferred.lock().push(op);
            return;
        }
        self.inner.registry.lock().apply(op);
    }

    // ---------------------------------------------------------------------
    // 状态与生命周期
    // ---------------------------------------------------------------------

    /// 当前缓存值
    pub fn get(&self) -> Option<T> {
        self.inner.value.read().clone()
    }

    pub fn metrics(&self) -> &BindingMetrics {
        &self.inner.metrics
    }

    /// 启动 Tick 链条
    ///
    /// 已经在运行时什么也不做；停止之后可以再次启动。调度器已停机时返回 `SchedulerShutdown`。
    pub fn start(&self) -> Result<()> {
        let mut chain = self.inner.chain.lock();
        if chain.as_ref().is_some_and(|token| !token.is_cancelled()) {
            trace!("[Binding-{}] Already running.", self.inner.name);
            return Ok(());
        }

        let token = CancellationToken::new();
        let pacemaker = Pacemaker::new(self.inner.ctx.clone(), token.clone());
        let inner = self.inner.clone();
        let next = pacemaker.clone();
        match pacemaker.beat(Duration::ZERO, move || inner.tick(next)) {
            PacemakerEvent::Scheduled => {
                debug!("[Binding-{}] Started.", self.inner.name);
                *chain = Some(token);
                Ok(())
            }
            _ => Err(SchedulerError::SchedulerShutdown),
        }
    }

    /// 结束 Tick 链条
    ///
    /// 已经提交的那一拍 (包括在途的拉取) 仍会执行一次并通知订阅者，但不会再安排后继。
    pub fn stop(&self) {
        if let Some(token) = self.inner.chain.lock().as_ref() {
            if !token.is_cancelled() {
                debug!("[Binding-{}] Stopped.", self.inner.name);
            }
            token.cancel();
        }
    }

    pub fn status(&self) -> BindingStatus {
        match self.inner.chain.lock().as_ref() {
            None => BindingStatus::Idle,
            Some(token) if token.is_cancelled() => BindingStatus::Stopped,
            Some(_) => BindingStatus::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == BindingStatus::Running
    }
}

impl<K, T> BindingInner<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn is_fanout_thread(&self) -> bool {
        *self.fanout_thread.lock() == Some(thread::current().id())
    }

    /// 一拍：运行在串行执行器上
    fn tick(self: &Arc<Self>, pacemaker: Pacemaker) {
        let tick_start = Instant::now();
        self.metrics.inc_tick();

        let (provider, period) = {
            let settings = self.settings.lock();
            (settings.provider.clone(), settings.period)
        };

        if self.registry.lock().active.is_empty() {
            self.metrics.inc_idle_tick();
            trace!("[Binding-{}] No active subscribers, skip fetch.", self.name);
            self.reschedule(&pacemaker, period);
            return;
        }

        let pending = match catch_unwind(AssertUnwindSafe(|| provider())) {
            Ok(pending) => pending,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("[Binding-{}] Provider panicked: {}", self.name, message);
                Completion::err(SchedulerError::ProviderFailure(anyhow::anyhow!(
                    "provider panicked: {}",
                    message
                )))
            }
        };

        let inner = self.clone();
        let ctx = self.ctx.clone();
        let stopper = pacemaker.clone();
        pending.on_complete(move |result| {
            // 结果可能在任意线程上到达，挪回串行执行器再处理
            let name = inner.name.clone();
            let apply = move || inner.apply(result, tick_start, pacemaker);
            if let Err(e) = ctx.execute(apply) {
                warn!("[Binding-{}] Dropping fetch result: {}", name, e);
                stopper.halt();
            }
        });
    }

    fn apply(
        self: &Arc<Self>,
        result: Result<Option<T>>,
        tick_start: Instant,
        pacemaker: Pacemaker,
    ) {
        let (period, fallback, policy) = {
            let settings = self.settings.lock();
            (
                settings.period,
                settings.fallback.clone(),
                settings.failure_policy.clone(),
            )
        };

        match result {
            Ok(fresh) => {
                self.metrics.inc_success();
                if let Some(policy) = &policy {
                    policy.on_success();
                }
                let elapsed = {
                    let mut registry = self.registry.lock();
                    let value = fresh.or(fallback);
                    *self.value.write() = value.clone();
                    let elapsed = tick_start.elapsed();
                    self.fan_out(&mut registry, value.as_ref());
                    elapsed
                };
                self.reschedule(&pacemaker, TimeUtils::compensated_delay(period, elapsed));
            }
            Err(e) => {
                self.metrics.inc_failure();
                *self.value.write() = fallback;
                let keep_polling = policy
                    .as_ref()
                    .is_none_or(|policy| policy.should_continue(&e));
                if keep_polling {
                    debug!("[Binding-{}] Fetch failed, keep polling: {}", self.name, e);
                    self.reschedule(&pacemaker, period);
                } else {
                    warn!("[Binding-{}] Fetch failed, stopping: {}", self.name, e);
                    pacemaker.halt();
                }
            }
        }
    }

    /// 把值推送给所有活跃订阅者
    ///
    /// 调用方持有注册表锁。回调的 panic 被隔离，不影响其他订阅者和链条。
    fn fan_out(&self, registry: &mut Registry<K, T>, value: Option<&T>) {
        *self.fanout_thread.lock() = Some(thread::current().id());
        {
            let Registry {
                subscribers,
                active,
            } = &mut *registry;
            for key in active.iter() {
                let Some(callback) = subscribers.get_mut(key) else {
                    continue;
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(value)));
                self.metrics.inc_notification();
                if let Err(payload) = outcome {
                    self.metrics.inc_subscriber_panic();
                    error!(
                        "[Binding-{}] Subscriber panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        *self.fanout_thread.lock() = None;

        let deferred = mem::take(&mut *self.deferred.lock());
        for op in deferred {
            registry.apply(op);
        }
    }

    fn reschedule(self: &Arc<Self>, pacemaker: &Pacemaker, delay: Duration) {
        let inner = self.clone();
        let next = pacemaker.clone();
        match pacemaker.beat(delay, move || inner.tick(next)) {
            PacemakerEvent::Scheduled => {
                self.metrics.record_delay(delay);
                trace!("[Binding-{}] Next tick in {:?}.", self.name, delay);
            }
            PacemakerEvent::Stopped => {
                trace!("[Binding-{}] Chain stopped, no successor.", self.name);
            }
            PacemakerEvent::Shutdown => {
                warn!("[Binding-{}] Scheduler is shut down, chain ends.", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;
    use crate::common::SchedulerConfig;

    fn ctx() -> SchedulerContext {
        SchedulerContext::configure(SchedulerConfig::default()).unwrap()
    }

    #[test]
    fn registry_keeps_active_within_bound_keys() {
        let mut registry: Registry<&str, i32> = Registry::new();
        registry.apply(RegistryOp::Listen("ghost"));
        assert!(registry.active.is_empty());

        registry.apply(RegistryOp::Bind("a", Box::new(|_: Option<&i32>| {})));
        registry.apply(RegistryOp::Pause("a"));
        assert!(registry.subscribers.contains_key("a"));
        assert!(!registry.active.contains("a"));

        registry.apply(RegistryOp::Listen("a"));
        assert!(registry.active.contains("a"));

        registry.apply(RegistryOp::Unbind("a"));
        assert!(registry.subscribers.is_empty());
        assert!(registry.active.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_follows_the_chain() {
        let ctx = ctx();
        let binding: ReactiveBinding<&str, i32> = ReactiveBinding::new(&ctx, || Completion::ok(1));
        assert_eq!(binding.status(), BindingStatus::Idle);

        binding.start().unwrap();
        assert_eq!(binding.status(), BindingStatus::Running);

        binding.stop();
        assert_eq!(binding.status(), BindingStatus::Stopped);

        binding.start().unwrap();
        assert!(binding.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_shutdown_is_rejected() {
        let ctx = ctx();
        let binding: ReactiveBinding<&str, i32> = ReactiveBinding::new(&ctx, || Completion::ok(1));
        ctx.shutdown();
        assert!(matches!(binding.start(), Err(SchedulerError::SchedulerShutdown)));
        assert_eq!(binding.status(), BindingStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_may_pause_itself() {
        let ctx = ctx();
        let binding: ReactiveBinding<&str, i32> = ReactiveBinding::new(&ctx, || Completion::ok(7));
        binding.with_period(Duration::from_millis(10));

        let seen = Arc::new(AtomicUsize::new(0));
        let me = binding.clone();
        let counter = seen.clone();
        binding.bind("self", move |value| {
            assert_eq!(value, Some(&7));
            counter.fetch_add(1, Ordering::SeqCst);
            me.pause(&"self");
        });

        binding.start().unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(binding.metrics().idle_ticks() > 0);
        binding.stop();
        // 回调持有 binding 的克隆，清理掉以打破引用环
        binding.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn provider_panic_is_treated_as_failure() {
        let ctx = ctx();
        let binding: ReactiveBinding<&str, i32> =
            ReactiveBinding::new(&ctx, || -> Completion<i32> { panic!("provider exploded") });
        binding.with_period(Duration::from_millis(10)).with_default(-1);
        binding.bind("a", |_| {});

        binding.start().unwrap();
        sleep(Duration::from_millis(35)).await;

        assert!(binding.metrics().fetch_failure() >= 3);
        assert_eq!(binding.get(), Some(-1));
        assert!(binding.is_running());
    }
}
