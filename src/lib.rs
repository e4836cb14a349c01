// 1. 基础模块
pub mod common;

// 2. 串行调度器
pub mod scheduler;

// 3. 外部 Future 桥接
pub mod bridge;

// 4. 失败策略
pub mod policy;

// 5. 响应式绑定
pub mod binding;

pub use binding::{BindingStatus, ReactiveBinding, ReactiveBindingBuilder};
pub use bridge::{BridgeState, Completer, Completion, Deferred, ExternalFuture, FutureBridge};
pub use common::{Result, SchedulerConfig, SchedulerError};
pub use scheduler::SchedulerContext;
