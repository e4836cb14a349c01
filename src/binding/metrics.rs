use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

use crate::common::TimeUtils;

/// Binding 核心指标
#[derive(Debug, Default, Serialize)]
pub struct BindingMetrics {
    // --- 累积计数 (Counters) ---
    /// 执行过的 Tick 总数 (包括空转的)
    pub ticks: AtomicU64,

    /// 因为没有活跃订阅者而跳过拉取的 Tick 数
    pub idle_ticks: AtomicU64,

    /// Provider 成功次数
    pub fetch_success: AtomicU64,

    /// Provider 失败次数
    pub fetch_failure: AtomicU64,

    /// 回调被调用的总次数
    pub notifications: AtomicU64,

    /// 回调 panic 的次数
    pub subscriber_panics: AtomicU64,

    // --- 瞬时状态 (Gauges) ---
    /// 最近一次安排下一拍时使用的延迟 (毫秒)
    pub last_delay_ms: AtomicU64,
}

impl BindingMetrics {
    pub fn inc_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_tick(&self) {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_success(&self) {
        self.fetch_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failure(&self) {
        self.fetch_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_subscriber_panic(&self) {
        self.subscriber_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delay(&self, delay: Duration) {
        self.last_delay_ms
            .store(TimeUtils::as_millis_u64(delay), Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    pub fn fetch_success(&self) -> u64 {
        self.fetch_success.load(Ordering::Relaxed)
    }

    pub fn fetch_failure(&self) -> u64 {
        self.fetch_failure.load(Ordering::Relaxed)
    }

    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn subscriber_panics(&self) -> u64 {
        self.subscriber_panics.load(Ordering::Relaxed)
    }

    pub fn last_delay(&self) -> Duration {
        Duration::from_millis(self.last_delay_ms.load(Ordering::Relaxed))
    }
}
