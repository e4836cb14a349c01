use std::time::Duration;

/// 全局统一的时间计算器
///
/// 所有 "下一次什么时候跑" 的算术都收敛在这里，方便单独测试。
pub struct TimeUtils;

impl TimeUtils {
    /// 1 个时间单位 (毫秒)
    pub const UNIT: Duration = Duration::from_millis(1);

    /// 单次延时提交的上限 (365 天)
    ///
    /// `DelayQueue` 的时间轮只能容纳约 2.2 年以内的 deadline，超出会在执行器任务里直接 panic。
    /// 上限留出一半余量，因为时间轮的内部时钟只在被 poll 时推进。
    pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// 把时长钳制到至少 1ms
    pub fn at_least_unit(d: Duration) -> Duration {
        d.max(Self::UNIT)
    }

    /// 计算成功 Tick 之后的漂移补偿延迟
    ///
    /// 结果为 `clamp(period - elapsed, 1ms, period)`：
    /// - Provider 很快: 接近完整的 period。
    /// - Provider 比 period 还慢: 1ms 后立刻开始下一轮，而不是跳过一个周期或者积压。
    pub fn compensated_delay(period: Duration, elapsed: Duration) -> Duration {
        let period = Self::at_least_unit(period);
        period.saturating_sub(elapsed).clamp(Self::UNIT, period)
    }

    /// 把延时钳制到 `[0, MAX_DELAY]`
    pub fn capped_delay(d: Duration) -> Duration {
        d.min(Self::MAX_DELAY)
    }

    /// Duration -> 毫秒 (u64 饱和)
    pub fn as_millis_u64(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }
}
