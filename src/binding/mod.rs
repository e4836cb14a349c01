pub mod builder;
pub mod core;
pub mod metrics;
pub(crate) mod pacemaker;

pub use builder::ReactiveBindingBuilder;
pub use self::core::{BindingStatus, ReactiveBinding};
pub use metrics::BindingMetrics;
