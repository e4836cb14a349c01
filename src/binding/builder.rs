use std::{hash::Hash, marker::PhantomData, sync::Arc, time::Duration};

use crate::{
    binding::core::{Provider, ReactiveBinding, Settings, lift_provider},
    bridge::Completion,
    common::{Result, SchedulerError, TimeUtils, new_binding_name},
    policy::FailurePolicy,
    scheduler::SchedulerContext,
};

/// Binding 构造器 (Builder Pattern)
/// - `K`: 订阅者 key 类型
/// - `T`: 值类型
pub struct ReactiveBindingBuilder<K, T> {
    ctx: SchedulerContext,
    /// 日志里使用的名字 (如果不设，自动生成)
    name: Option<String>,
    provider: Option<Provider<T>>,
    failure_policy: Option<Arc<dyn FailurePolicy>>,
    /// 轮询周期 (不设则使用上下文配置)
    period: Option<Duration>,
    fallback: Option<T>,
    _key: PhantomData<fn() -> K>,
}

impl<K, T> ReactiveBindingBuilder<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ctx: &SchedulerContext) -> Self {
        Self {
            ctx: ctx.clone(),
            name: None,
            provider: None,
            failure_policy: None,
            period: None,
            fallback: None,
            _key: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_provider<P>(mut self, provider: P) -> Self
    where
        P: Fn() -> Completion<T> + Send + Sync + 'static,
    {
        self.provider = Some(lift_provider(provider));
        self
    }

    /// 设置一个可能返回空值的 Provider，空值会回退到默认值
    pub fn with_optional_provider<P>(mut self, provider: P) -> Self
    where
        P: Fn() -> Completion<Option<T>> + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn with_failure_policy<P: FailurePolicy>(mut self, policy: P) -> Self {
        self.failure_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_default(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    /// 构建 Binding (不会自动启动)
    pub fn build(self) -> Result<ReactiveBinding<K, T>> {
        let provider = self
            .provider
            .ok_or_else(|| SchedulerError::Config("binding requires a provider".into()))?;
        let period = self
            .period
            .map(TimeUtils::at_least_unit)
            .unwrap_or_else(|| self.ctx.config().binding_period());
        let settings = Settings {
            provider,
            failure_policy: self.failure_policy,
            period,
            fallback: self.fallback,
        };
        let name = self.name.unwrap_or_else(new_binding_name);
        Ok(ReactiveBinding::assemble(self.ctx, name, settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::SchedulerConfig, policy::StopOnFailure};

    #[tokio::test]
    async fn build_requires_a_provider() {
        let ctx = SchedulerContext::configure(SchedulerConfig::default()).unwrap();
        let result = ReactiveBindingBuilder::<&str, i32>::new(&ctx).build();
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn build_applies_settings() {
        let ctx = SchedulerContext::configure(SchedulerConfig::default()).unwrap();
        let binding = ReactiveBinding::<&str, i32>::builder(&ctx)
            .with_name("quotes")
            .with_provider(|| Completion::ok(1))
            .with_failure_policy(StopOnFailure)
            .with_period(Duration::ZERO)
            .with_default(9)
            .build()
            .unwrap();

        assert_eq!(binding.name(), "quotes");
        assert_eq!(binding.period(), Duration::from_millis(1));
        assert_eq!(binding.get(), Some(9));
    }

    #[tokio::test]
    async fn period_defaults_to_context_config() {
        let config = SchedulerConfig::from_json(r#"{"binding": {"period_ms": 250}}"#).unwrap();
        let ctx = SchedulerContext::configure(config).unwrap();
        let binding = ReactiveBinding::<&str, i32>::builder(&ctx)
            .with_provider(|| Completion::ok(1))
            .build()
            .unwrap();
        assert_eq!(binding.period(), Duration::from_millis(250));
        assert_eq!(binding.get(), None);
    }
}
