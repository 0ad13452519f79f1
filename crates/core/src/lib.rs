pub mod config;
pub mod environment;
pub mod error;
pub mod sync;
pub mod task;

pub use config::ExecutionConfig;
pub use environment::*;
pub use error::*;
pub use task::*;
