pub mod failure;

pub use failure::{
    AlwaysContinue, FailurePolicy, FailurePolicyChain, MaxConsecutiveFailures, RetryTransient,
    StopOnFailure,
};
