pub mod duplication;
pub mod inner;
pub mod token;

pub use duplication::{DuplicationPredicate, FixedCountPredicate, SerializedPredicate};
pub use inner::{
    run_task, InnerTaskHandle, InnerTaskListener, InnerTaskManager, InnerTaskRequest,
    InnerTaskResult, InvocationCounts,
};
pub use token::{AllocatorKey, ComputationToken, TokenAllocator};
