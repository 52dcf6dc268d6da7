//! Shared utilities

pub mod scheduler;
pub mod throttle;

pub use scheduler::{Scheduler, TokioScheduler};
pub use throttle::LogThrottler;
