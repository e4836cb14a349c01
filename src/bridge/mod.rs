pub mod completion;
pub mod core;
pub mod external;

pub use completion::{Completer, Completion};
pub use self::core::{BridgeState, FutureBridge};
pub use external::{Deferred, ExternalFuture};
